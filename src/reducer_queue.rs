// reducer_queue.rs - ReducerQueue: a priority-FIFO of asynchronous reducers
// serializing updates to one state cell.
//
// The load-bearing concurrency primitive (spec.md §4.1, §9): channel-state
// updates (validation, deposit, signing, claim) must be atomic relative to
// one another, or interleaving can produce stale `spent` or double-open.
//
// Implemented as a single-consumer task, following the command-loop shape
// of the delayed-settlement background task in the reference balance
// service (`tokio::select!` over an mpsc receiver driving a priority
// structure) rather than a mutex: at most one reducer runs at a time by
// construction, since only the consumer task ever touches the cell.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

pub type Reducer<T, E> =
    Box<dyn FnOnce(T) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send>;

struct Job<T, E> {
    priority: i64,
    sequence: u64,
    reducer: Reducer<T, E>,
    reply: oneshot::Sender<Result<T, E>>,
}

impl<T, E> PartialEq for Job<T, E> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl<T, E> Eq for Job<T, E> {}

impl<T, E> PartialOrd for Job<T, E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, E> Ord for Job<T, E> {
    /// Higher priority first; among equal priorities, lower sequence (i.e.
    /// earlier enqueue) first. `BinaryHeap` is a max-heap, so we flip the
    /// sequence comparison to get FIFO among equal priorities.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

enum Command<T, E> {
    Enqueue(Job<T, E>),
    Clear,
}

/// Handle to a live `ReducerQueue`. Cheap to clone; all clones share the
/// same consumer task and state cell.
pub struct ReducerQueue<T, E> {
    commands: mpsc::UnboundedSender<Command<T, E>>,
    sequence: Arc<AtomicU64>,
    data: watch::Receiver<T>,
}

impl<T, E> Clone for ReducerQueue<T, E> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            sequence: self.sequence.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T, E> ReducerQueue<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// Spawn a new queue seeded with `initial` state.
    pub fn new(initial: T) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = watch::channel(initial);

        tokio::spawn(run_consumer(commands_rx, data_tx));

        ReducerQueue {
            commands: commands_tx,
            sequence: Arc::new(AtomicU64::new(0)),
            data: data_rx,
        }
    }

    /// Enqueue a reducer at the given priority (higher runs first; equal
    /// priority is FIFO). Returns a future resolving to the reducer's
    /// result once it actually runs.
    pub fn add<F, Fut>(&self, priority: i64, reducer: F) -> oneshot::Receiver<Result<T, E>>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let job = Job {
            priority,
            sequence,
            reducer: Box::new(move |state| Box::pin(reducer(state))),
            reply,
        };
        // The consumer task owns the receiving end for its lifetime; a send
        // error here only happens after the queue has been torn down, and
        // the caller observes that via the dropped `receiver`.
        let _ = self.commands.send(Command::Enqueue(job));
        receiver
    }

    /// Drop all pending (not yet started) jobs. The in-flight reducer, if
    /// any, still runs to completion.
    pub fn clear(&self) {
        let _ = self.commands.send(Command::Clear);
    }

    /// Current state snapshot. May be stale relative to an in-flight reducer.
    pub fn snapshot(&self) -> T {
        self.data.borrow().clone()
    }

    /// Subscribe to the `data` event stream: one emission after every
    /// successful reduction.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.data.clone()
    }
}

async fn run_consumer<T, E>(
    mut commands: mpsc::UnboundedReceiver<Command<T, E>>,
    data_tx: watch::Sender<T>,
) where
    T: Clone + Send + 'static,
{
    let mut heap: BinaryHeap<Job<T, E>> = BinaryHeap::new();

    loop {
        // Block for the next command only when nothing is pending. A woken
        // command is pushed into the heap rather than run directly, so a
        // higher-priority job that arrives in the same wakeup still wins --
        // this is what gives an in-flight reducer priority preemption over
        // newly-enqueued lower-priority work.
        if heap.is_empty() {
            match commands.recv().await {
                Some(Command::Enqueue(job)) => heap.push(job),
                Some(Command::Clear) => continue,
                None => return,
            }
        }

        // Opportunistically drain any other commands that arrived in the
        // same wakeup, so priority ordering stays correct even under bursts
        // of concurrent `add` calls.
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                Command::Enqueue(j) => heap.push(j),
                Command::Clear => heap.clear(),
            }
        }

        let job = match heap.pop() {
            Some(job) => job,
            None => continue,
        };

        let current = data_tx.borrow().clone();
        let result = (job.reducer)(current).await;

        match result {
            Ok(new_state) => {
                let _ = data_tx.send(new_state.clone());
                let _ = job.reply.send(Ok(new_state));
            }
            Err(err) => {
                // Reducer failed: state cell untouched, no `data` event.
                let _ = job.reply.send(Err(err));
            }
        }
    }
}
