// peer_account.rs - PeerAccount: per-peer settlement state machine
//
// The core of the engine (spec.md §4.3-§4.9): balances, the linked payout
// address, and the two ReducerQueues that serialize every mutation of the
// outgoing and incoming cached channel. Everything here either runs inside
// a queue reducer or takes the balances lock directly, per the coarse-lock
// discipline spec.md §5 requires between ILP packet handling and queue work.
//
// One cheap-to-clone struct holding Arc'd collaborators, passed around by
// value instead of by reference, with a `persist()` call at natural save
// points.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::btp::{BtpTransport, InfoMessage, SubProtocolMessage};
use crate::channel_watcher;
use crate::claim::{gwei_to_wei, parse_address, random_channel_id, sign_claim, wei_to_gwei_floor, Claim};
use crate::config::Config;
use crate::contract::{ChannelContract, OnChainChannel};
use crate::error::SettlementError;
use crate::ilp::{DataHandler, Prepare, PrepareResponse, Reject};
use crate::model::{ClaimablePaymentChannel, PaymentChannel};
use crate::reducer_queue::ReducerQueue;
use crate::store::{AccountSnapshot, Store};
use crate::tx_executor::{AlwaysAuthorize, FeeAuthorizer, TxExecutor, TxOutcome};

pub const PRIORITY_DEFAULT: i64 = 0;
pub const PRIORITY_VALIDATE_CLAIM: i64 = 1;
pub const PRIORITY_CHANNEL_WATCHER: i64 = 2;
pub const PRIORITY_CLAIM_CHANNEL: i64 = 3;

const RETRY_ATTEMPTS: u32 = 20;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Out-of-core callback invoked on every validated incoming claim increment.
#[async_trait]
pub trait MoneyHandler: Send + Sync {
    async fn handle_incoming_money(&self, account_name: &str, amount_gwei: u64);
}

#[derive(Debug, Clone, Default)]
struct Balances {
    receivable_balance_gwei: i64,
    payable_balance_gwei: i64,
    payout_amount_gwei: i64,
}

/// Per-peer state. Cheap to clone: every field is an `Arc` or a queue
/// handle, so a clone shares the same underlying balances, queues and
/// watcher slot as the original.
#[derive(Clone)]
pub struct PeerAccount {
    pub account_name: String,
    balances: Arc<Mutex<Balances>>,
    ethereum_address: Arc<RwLock<Option<Address>>>,
    pub incoming: ReducerQueue<Option<ClaimablePaymentChannel>, SettlementError>,
    pub outgoing: ReducerQueue<Option<PaymentChannel>, SettlementError>,
    watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: Arc<Config>,
    contract: Arc<dyn ChannelContract>,
    tx_executor: Arc<dyn TxExecutor>,
    signer: Arc<PrivateKeySigner>,
    our_address: Address,
    transport: Arc<dyn BtpTransport>,
    store: Arc<dyn Store>,
    money_handler: Arc<dyn MoneyHandler>,
}

impl PeerAccount {
    #[allow(clippy::too_many_arguments)]
    pub async fn load_or_create(
        account_name: String,
        config: Arc<Config>,
        contract: Arc<dyn ChannelContract>,
        tx_executor: Arc<dyn TxExecutor>,
        signer: Arc<PrivateKeySigner>,
        our_address: Address,
        transport: Arc<dyn BtpTransport>,
        store: Arc<dyn Store>,
        money_handler: Arc<dyn MoneyHandler>,
    ) -> Result<Self, SettlementError> {
        let snapshot = store.get_account(&account_name).await?;

        let (balances, ethereum_address, outgoing_initial, incoming_initial) = match &snapshot {
            Some(s) => (
                Balances {
                    receivable_balance_gwei: s.receivable_balance_gwei,
                    payable_balance_gwei: s.payable_balance_gwei,
                    payout_amount_gwei: s.payout_amount_gwei,
                },
                s.ethereum_address.as_deref().map(parse_address).transpose()?,
                s.outgoing_channel.as_ref().map(PaymentChannel::try_from).transpose()?,
                s.incoming_channel.as_ref().map(PaymentChannel::try_from).transpose()?,
            ),
            None => (Balances::default(), None, None, None),
        };

        let account = PeerAccount {
            account_name,
            balances: Arc::new(Mutex::new(balances)),
            ethereum_address: Arc::new(RwLock::new(ethereum_address)),
            incoming: ReducerQueue::new(incoming_initial),
            outgoing: ReducerQueue::new(outgoing_initial),
            watcher: Arc::new(Mutex::new(None)),
            config,
            contract,
            tx_executor,
            signer,
            our_address,
            transport,
            store,
            money_handler,
        };

        if account.incoming.snapshot().is_some() {
            account.ensure_watcher_running().await;
        }

        Ok(account)
    }

    async fn persist(&self) -> Result<(), SettlementError> {
        let balances = self.balances.lock().await.clone();
        let ethereum_address = self.ethereum_address.read().await.map(|a| format!("0x{:x}", a));
        let snapshot = AccountSnapshot {
            account_name: self.account_name.clone(),
            receivable_balance_gwei: balances.receivable_balance_gwei,
            payable_balance_gwei: balances.payable_balance_gwei,
            payout_amount_gwei: balances.payout_amount_gwei,
            ethereum_address,
            outgoing_channel: self.outgoing.snapshot().map(|c| c.to_snapshot()),
            incoming_channel: self.incoming.snapshot().map(|c| c.to_snapshot()),
        };
        self.store.put_account(&snapshot).await
    }

    /// Tear down this account: stop the watcher, drop queued work, remove
    /// the store entry. In-flight reducers run to completion but their
    /// persistence writes become no-ops against a deleted row (spec.md §5).
    pub async fn unload(&self) -> Result<(), SettlementError> {
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
        self.incoming.clear();
        self.outgoing.clear();
        self.store.delete_account(&self.account_name).await
    }

    async fn ensure_watcher_running(&self) {
        let mut guard = self.watcher.lock().await;
        if guard.is_some() {
            return;
        }
        let account = self.clone();
        let interval_ms = self.config.channel_watcher_interval_ms;
        *guard = Some(tokio::spawn(channel_watcher::run(account, interval_ms)));
    }

    pub(crate) fn contract(&self) -> Arc<dyn ChannelContract> {
        self.contract.clone()
    }

    pub(crate) async fn watcher_finished(&self) {
        *self.watcher.lock().await = None;
    }

    // =========================================================================
    // §4.2 Address-linking sub-protocol
    // =========================================================================

    pub async fn handle_info(&self, msg: InfoMessage) -> Result<InfoMessage, SettlementError> {
        let candidate = parse_address(&msg.ethereum_address)?;
        {
            let mut guard = self.ethereum_address.write().await;
            match *guard {
                None => *guard = Some(candidate),
                Some(existing) if existing != candidate => {
                    tracing::warn!(
                        account = %self.account_name,
                        existing = %existing,
                        attempted = %candidate,
                        "ignoring attempt to rebind a linked ethereum address"
                    );
                }
                Some(_) => {}
            }
        }
        self.persist().await?;
        Ok(InfoMessage {
            ethereum_address: format!("0x{:x}", self.our_address),
        })
    }

    // =========================================================================
    // §4.3 Outgoing channel management
    // =========================================================================

    pub async fn fund_outgoing_channel(&self, value_gwei: u64, authorizer: Arc<dyn FeeAuthorizer>) -> Result<(), SettlementError> {
        let ctx = OutgoingFundCtx {
            contract: self.contract.clone(),
            tx_executor: self.tx_executor.clone(),
            ethereum_address: self.ethereum_address.clone(),
            transport: self.transport.clone(),
            account_name: self.account_name.clone(),
            our_address: self.our_address,
            outgoing_dispute_period: self.config.outgoing_dispute_period,
        };
        let handle = self.outgoing.add(PRIORITY_DEFAULT, move |cached| {
            let ctx = ctx.clone();
            let authorizer = authorizer.clone();
            async move { fund_outgoing_reducer(cached, value_gwei, ctx, authorizer).await }
        });
        let result = handle
            .await
            .map_err(|_| SettlementError::Internal("outgoing queue closed".into()))?;
        result?;
        self.persist().await
    }

    // =========================================================================
    // §4.4 Outgoing claim signing (sendMoney)
    // =========================================================================

    pub async fn send_money(&self, amount_gwei: Option<u64>) -> Result<(), SettlementError> {
        let ctx = SendMoneyCtx {
            balances: self.balances.clone(),
            signer: self.signer.clone(),
            transport: self.transport.clone(),
            account_name: self.account_name.clone(),
        };
        let handle = self.outgoing.add(PRIORITY_DEFAULT, move |cached| {
            let ctx = ctx.clone();
            async move { send_money_reducer(cached, amount_gwei, ctx).await }
        });
        let result = handle
            .await
            .map_err(|_| SettlementError::Internal("outgoing queue closed".into()))?;
        result?;
        self.persist().await
    }

    // =========================================================================
    // §4.5 Incoming claim validation
    // =========================================================================

    pub async fn handle_claim(&self, claim: Claim) -> Result<(), SettlementError> {
        let ctx = ValidateClaimCtx {
            contract: self.contract.clone(),
            store: self.store.clone(),
            account_name: self.account_name.clone(),
            our_address: self.our_address,
            min_incoming_dispute_period: self.config.min_incoming_dispute_period,
            balances: self.balances.clone(),
            money_handler: self.money_handler.clone(),
        };
        let handle = self.incoming.add(PRIORITY_VALIDATE_CLAIM, move |cached| {
            let ctx = ctx.clone();
            let claim = claim.clone();
            async move { validate_claim_reducer(cached, claim, ctx).await }
        });
        let result = handle
            .await
            .map_err(|_| SettlementError::Internal("incoming queue closed".into()))?;
        let new_state = result?;
        self.persist().await?;
        if new_state.is_some() {
            self.ensure_watcher_running().await;
        }
        Ok(())
    }

    // =========================================================================
    // §4.7 claimIfProfitable
    // =========================================================================

    pub async fn claim_if_profitable(&self, require_disputed: bool, authorizer: Option<Arc<dyn FeeAuthorizer>>) -> Result<(), SettlementError> {
        let ctx = ClaimCtx {
            contract: self.contract.clone(),
            tx_executor: self.tx_executor.clone(),
        };
        let handle = self.incoming.add(PRIORITY_CLAIM_CHANNEL, move |cached| {
            let ctx = ctx.clone();
            let authorizer = authorizer.clone();
            async move { claim_reducer(cached, require_disputed, authorizer, ctx).await }
        });
        let result = handle
            .await
            .map_err(|_| SettlementError::Internal("incoming queue closed".into()))?;
        result?;
        self.persist().await
    }

    /// Fire-and-forget variant used by the channel watcher and `requestClose`,
    /// which must not block their caller on the result (spec.md §4.6, §4.9).
    pub fn schedule_claim_if_profitable(&self, require_disputed: bool, authorizer: Option<Arc<dyn FeeAuthorizer>>) {
        let account = self.clone();
        tokio::spawn(async move {
            if let Err(e) = account.claim_if_profitable(require_disputed, authorizer).await {
                tracing::debug!(account = %account.account_name, error = %e, "scheduled claimIfProfitable did not succeed");
            }
        });
    }

    // =========================================================================
    // §4.8 ILP PREPARE forwarding
    // =========================================================================

    pub async fn handle_prepare(&self, prepare: Prepare, data_handler: &(dyn DataHandler + Sync)) -> Result<PrepareResponse, SettlementError> {
        let amount = prepare.amount_gwei;

        if amount > self.config.max_packet_amount_gwei {
            return Ok(PrepareResponse::Reject(Reject::amount_too_large(amount, self.config.max_packet_amount_gwei)));
        }

        {
            let mut balances = self.balances.lock().await;
            if balances.receivable_balance_gwei + amount as i64 > self.config.max_balance_gwei {
                return Ok(PrepareResponse::Reject(Reject::insufficient_liquidity()));
            }
            balances.receivable_balance_gwei += amount as i64;
        }

        let response = match data_handler.handle_prepare(prepare).await {
            Ok(r) => r,
            Err(reason) => {
                let mut balances = self.balances.lock().await;
                balances.receivable_balance_gwei -= amount as i64;
                self.persist().await?;
                return Ok(PrepareResponse::Reject(Reject::bundled(reason)));
            }
        };

        if let PrepareResponse::Reject(_) = &response {
            let mut balances = self.balances.lock().await;
            balances.receivable_balance_gwei -= amount as i64;
        }

        self.persist().await?;
        Ok(response)
    }

    /// Client-side reaction to the response of a PREPARE we sent out.
    pub async fn on_prepare_response(&self, prepare_amount_gwei: u64, response: &PrepareResponse) -> Result<(), SettlementError> {
        match response {
            PrepareResponse::Fulfill(_) => {
                {
                    let mut balances = self.balances.lock().await;
                    balances.payable_balance_gwei += prepare_amount_gwei as i64;
                }
                self.persist().await?;
                self.send_money(None).await
            }
            PrepareResponse::Reject(r) if r.is_t04() => self.send_money(None).await,
            PrepareResponse::Reject(_) => Ok(()),
        }
    }

    // =========================================================================
    // §4.9 requestClose sub-protocol
    // =========================================================================

    pub fn handle_request_close(&self) {
        self.schedule_claim_if_profitable(false, None);
    }
}

// =============================================================================
// §4.3 reducer
// =============================================================================

#[derive(Clone)]
struct OutgoingFundCtx {
    contract: Arc<dyn ChannelContract>,
    tx_executor: Arc<dyn TxExecutor>,
    ethereum_address: Arc<RwLock<Option<Address>>>,
    transport: Arc<dyn BtpTransport>,
    account_name: String,
    our_address: Address,
    outgoing_dispute_period: u64,
}

async fn fund_outgoing_reducer(
    cached: Option<PaymentChannel>,
    value_gwei: u64,
    ctx: OutgoingFundCtx,
    authorizer: Arc<dyn FeeAuthorizer>,
) -> Result<Option<PaymentChannel>, SettlementError> {
    let value_wei = gwei_to_wei(value_gwei);

    match cached {
        None => {
            let peer_address = match *ctx.ethereum_address.read().await {
                Some(addr) => addr,
                None => {
                    let _ = ctx
                        .transport
                        .send_message(
                            &ctx.account_name,
                            SubProtocolMessage::Info(InfoMessage {
                                ethereum_address: format!("0x{:x}", ctx.our_address),
                            }),
                        )
                        .await;
                    return Err(SettlementError::PeerAddressUnknown);
                }
            };

            let channel_id = random_channel_id();
            let call = ctx.contract.build_open(channel_id, peer_address, ctx.outgoing_dispute_period, value_wei);
            let outcome = ctx.tx_executor.submit(call, 1, authorizer.as_ref()).await?;
            match outcome {
                TxOutcome::Reverted { tx_hash } => return Err(SettlementError::TransactionReverted(tx_hash)),
                TxOutcome::Success { .. } => {}
            }

            let chain = fetch_channel_with_retry(ctx.contract.as_ref(), channel_id)
                .await
                .ok_or_else(|| SettlementError::ChannelNotYetVisible(format!("{:x}", channel_id)))?;
            Ok(Some(PaymentChannel::from_on_chain(channel_id, ctx.contract.address(), &chain, U256::ZERO, None)))
        }
        Some(existing) => {
            let refreshed = ctx
                .contract
                .fetch(existing.channel_id)
                .await?
                .ok_or_else(|| SettlementError::ChannelVanished(format!("{:x}", existing.channel_id)))?;

            let call = ctx.contract.build_deposit(existing.channel_id, value_wei);
            let outcome = ctx.tx_executor.submit(call, 1, authorizer.as_ref()).await?;
            match outcome {
                TxOutcome::Reverted { tx_hash } => return Err(SettlementError::TransactionReverted(tx_hash)),
                TxOutcome::Success { .. } => {}
            }

            let target = refreshed.value + value_wei;
            // Possibly-buggy source behavior (spec.md §9): if the deposit
            // never shows up within the retry budget, the old value is kept
            // silently rather than surfacing a failure.
            let chain = fetch_channel_until_value_at_least(ctx.contract.as_ref(), existing.channel_id, target)
                .await
                .unwrap_or(refreshed);
            Ok(Some(PaymentChannel::from_on_chain(
                existing.channel_id,
                ctx.contract.address(),
                &chain,
                existing.spent,
                existing.signature,
            )))
        }
    }
}

async fn fetch_channel_with_retry(contract: &dyn ChannelContract, channel_id: B256) -> Option<OnChainChannel> {
    for attempt in 0..RETRY_ATTEMPTS {
        match contract.fetch(channel_id).await {
            Ok(Some(chain)) => return Some(chain),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "transient chain error while waiting for channel visibility"),
        }
        if attempt + 1 < RETRY_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    None
}

async fn fetch_channel_until_value_at_least(contract: &dyn ChannelContract, channel_id: B256, target: U256) -> Option<OnChainChannel> {
    let mut last = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match contract.fetch(channel_id).await {
            Ok(Some(chain)) => {
                if chain.value >= target {
                    return Some(chain);
                }
                last = Some(chain);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "transient chain error while waiting for deposit confirmation"),
        }
        if attempt + 1 < RETRY_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    last
}

// =============================================================================
// §4.4 reducer
// =============================================================================

#[derive(Clone)]
struct SendMoneyCtx {
    balances: Arc<Mutex<Balances>>,
    signer: Arc<PrivateKeySigner>,
    transport: Arc<dyn BtpTransport>,
    account_name: String,
}

async fn send_money_reducer(cached: Option<PaymentChannel>, amount_gwei: Option<u64>, ctx: SendMoneyCtx) -> Result<Option<PaymentChannel>, SettlementError> {
    let payout_amount_gwei = {
        let mut balances = ctx.balances.lock().await;
        let add = amount_gwei.unwrap_or_else(|| balances.payable_balance_gwei.max(0) as u64);
        balances.payout_amount_gwei += add as i64;
        balances.payout_amount_gwei
    };

    let channel = match cached {
        Some(c) => c,
        None => return Ok(None),
    };

    let remaining = channel.remaining();
    if remaining.is_zero() || payout_amount_gwei <= 0 {
        return Ok(Some(channel));
    }

    let budget_wei = gwei_to_wei(payout_amount_gwei as u64);
    let increment_wei = remaining.min(budget_wei);
    if increment_wei.is_zero() {
        return Ok(Some(channel));
    }

    let new_spent = channel.spent + increment_wei;
    let claim = sign_claim(&ctx.signer, channel.contract_address, channel.channel_id, new_spent).await?;

    if let Err(e) = ctx.transport.send_message(&ctx.account_name, SubProtocolMessage::Claim(claim.to_message())).await {
        tracing::debug!(account = %ctx.account_name, error = %e, "claim delivery failed, will resend on next sendMoney");
    }

    let increment_gwei = wei_to_gwei_floor(increment_wei);
    {
        let mut balances = ctx.balances.lock().await;
        balances.payable_balance_gwei -= increment_gwei as i64;
        // Preserved from the source (spec.md §9, flagged as possibly buggy):
        // `min(0, payoutAmount - increment)` zeroes the backlog once fully
        // paid but goes negative when over-paid, rather than clamping at 0.
        balances.payout_amount_gwei = (balances.payout_amount_gwei - increment_gwei as i64).min(0);
    }

    let mut updated = channel;
    updated.spent = new_spent;
    updated.signature = Some(claim.signature);
    Ok(Some(updated))
}

// =============================================================================
// §4.5 reducer
// =============================================================================

#[derive(Clone)]
struct ValidateClaimCtx {
    contract: Arc<dyn ChannelContract>,
    store: Arc<dyn Store>,
    account_name: String,
    our_address: Address,
    min_incoming_dispute_period: u64,
    balances: Arc<Mutex<Balances>>,
    money_handler: Arc<dyn MoneyHandler>,
}

async fn validate_claim_reducer(
    cached: Option<ClaimablePaymentChannel>,
    claim: Claim,
    ctx: ValidateClaimCtx,
) -> Result<Option<ClaimablePaymentChannel>, SettlementError> {
    match cached {
        None => validate_claim_case_a(claim, ctx).await,
        Some(existing) => validate_claim_case_b(existing, claim, ctx).await,
    }
}

async fn validate_claim_case_a(claim: Claim, ctx: ValidateClaimCtx) -> Result<Option<ClaimablePaymentChannel>, SettlementError> {
    // claim.value is a `U256`; "value < 0" (spec.md §4.5 step 2) is
    // unrepresentable by construction and needs no runtime check.
    let channel_id_hex = format!("{:x}", claim.channel_id);

    let chain = match fetch_channel_with_retry(ctx.contract.as_ref(), claim.channel_id).await {
        Some(chain) => chain,
        // Transient chain error taxonomy (spec.md §7): on retry exhaustion,
        // return the prior (absent) state unchanged rather than erroring.
        None => return Ok(None),
    };

    if claim.contract_address != ctx.contract.address() {
        return Err(SettlementError::WrongContract {
            expected: format!("{:x}", ctx.contract.address()),
            actual: format!("{:x}", claim.contract_address),
        });
    }
    if !claim.verify(chain.sender) {
        return Err(SettlementError::InvalidClaimSignature);
    }
    if chain.receiver != ctx.our_address {
        return Err(SettlementError::NotOurChannel {
            receiver: format!("{:x}", chain.receiver),
            ours: format!("{:x}", ctx.our_address),
        });
    }
    if chain.dispute_period < ctx.min_incoming_dispute_period {
        return Err(SettlementError::DisputePeriodTooShort {
            actual: chain.dispute_period,
            minimum: ctx.min_incoming_dispute_period,
        });
    }

    if let Some(other_owner) = ctx.store.link_incoming_channel(&channel_id_hex, &ctx.account_name).await? {
        return Err(SettlementError::ChannelAlreadyLinked {
            channel_id: channel_id_hex,
            existing_account: other_owner,
        });
    }

    let increment = claim.value.min(chain.value);
    if !increment.is_zero() {
        let amount_gwei = wei_to_gwei_floor(increment);
        if amount_gwei > 0 {
            ctx.balances.lock().await.receivable_balance_gwei -= amount_gwei as i64;
            ctx.money_handler.handle_incoming_money(&ctx.account_name, amount_gwei).await;
        }
    }

    Ok(Some(PaymentChannel::from_on_chain(
        claim.channel_id,
        claim.contract_address,
        &chain,
        claim.value,
        Some(claim.signature),
    )))
}

async fn validate_claim_case_b(
    existing: ClaimablePaymentChannel,
    claim: Claim,
    ctx: ValidateClaimCtx,
) -> Result<Option<ClaimablePaymentChannel>, SettlementError> {
    let chain = if claim.value > existing.value {
        let mut seen = None;
        let mut confirmed = false;
        for attempt in 0..RETRY_ATTEMPTS {
            match ctx.contract.fetch(existing.channel_id).await {
                Ok(Some(chain)) => {
                    let big_enough = chain.value >= claim.value;
                    seen = Some(chain);
                    if big_enough {
                        confirmed = true;
                        break;
                    }
                }
                Ok(None) => {
                    // Vanished mid-validation: treat as error, keep the
                    // last known on-chain view (spec.md §4.5 Case B step 2).
                    tracing::warn!(channel = %existing.channel_id, "incoming channel vanished from chain during claim validation");
                    break;
                }
                Err(e) => tracing::debug!(error = %e, "transient chain error refreshing incoming channel"),
            }
            if attempt + 1 < RETRY_ATTEMPTS {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        if !confirmed {
            // Deposit never confirmed within the retry budget, or the
            // channel vanished: keep cached state unchanged (spec.md §7).
            let _ = seen;
            return Ok(Some(existing));
        }
        seen.unwrap_or_else(|| existing_as_chain(&existing))
    } else {
        existing_as_chain(&existing)
    };

    if claim.channel_id != existing.channel_id {
        return Err(SettlementError::ChannelIdMismatch {
            claim_id: format!("{:x}", claim.channel_id),
            cached_id: format!("{:x}", existing.channel_id),
        });
    }
    if !claim.verify(chain.sender) {
        return Err(SettlementError::InvalidClaimSignature);
    }

    let increment = claim.value.min(chain.value).saturating_sub(existing.spent);
    if increment.is_zero() {
        // Replay or regression: ignore, keep cached state (spec.md §4.5).
        return Ok(Some(existing));
    }

    let amount_gwei = wei_to_gwei_floor(increment);
    if amount_gwei > 0 {
        ctx.balances.lock().await.receivable_balance_gwei -= amount_gwei as i64;
        ctx.money_handler.handle_incoming_money(&ctx.account_name, amount_gwei).await;
    }

    Ok(Some(PaymentChannel::from_on_chain(
        claim.channel_id,
        claim.contract_address,
        &chain,
        claim.value,
        Some(claim.signature),
    )))
}

fn existing_as_chain(existing: &ClaimablePaymentChannel) -> OnChainChannel {
    OnChainChannel {
        sender: existing.sender,
        receiver: existing.receiver,
        value: existing.value,
        dispute_period: existing.dispute_period,
        disputed_until: existing.disputed_until,
    }
}

// =============================================================================
// §4.7 reducer
// =============================================================================

#[derive(Clone)]
struct ClaimCtx {
    contract: Arc<dyn ChannelContract>,
    tx_executor: Arc<dyn TxExecutor>,
}

async fn claim_reducer(
    cached: Option<ClaimablePaymentChannel>,
    require_disputed: bool,
    authorizer: Option<Arc<dyn FeeAuthorizer>>,
    ctx: ClaimCtx,
) -> Result<Option<ClaimablePaymentChannel>, SettlementError> {
    let channel = match &cached {
        Some(c) if c.signature.is_some() => c.clone(),
        _ => return Ok(cached),
    };

    let chain = match ctx.contract.fetch(channel.channel_id).await? {
        Some(chain) => chain,
        None => return Ok(None),
    };

    if require_disputed {
        let block = ctx.contract.current_block().await?;
        if !chain.is_disputed(block) {
            return Ok(cached);
        }
    }

    let signature = channel.signature.expect("checked above");
    let call = ctx.contract.build_claim(channel.channel_id, channel.spent, signature.as_bytes().to_vec());
    let fee = ctx.tx_executor.estimate_fee(&call).await?;

    match &authorizer {
        Some(a) => a.authorize(fee).await.map_err(SettlementError::FeeRejected)?,
        None if fee >= channel.spent => {
            return Err(SettlementError::NotProfitable {
                fee: fee.to_string(),
                spent: channel.spent.to_string(),
            });
        }
        None => {}
    }

    let outcome = match &authorizer {
        Some(a) => ctx.tx_executor.submit(call, 1, a.as_ref()).await?,
        None => ctx.tx_executor.submit(call, 1, &AlwaysAuthorize).await?,
    };
    match outcome {
        TxOutcome::Reverted { tx_hash } => return Err(SettlementError::TransactionReverted(tx_hash)),
        TxOutcome::Success { .. } => {}
    }

    for attempt in 0..RETRY_ATTEMPTS {
        if ctx.contract.fetch(channel.channel_id).await?.is_none() {
            break;
        }
        if attempt + 1 < RETRY_ATTEMPTS {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btp::SubProtocolMessage as SPM;
    use crate::contract::ContractCall;
    use crate::store::InMemoryStore;
    use alloy::primitives::address;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeContract {
        address: Address,
        channels: Mutex<HashMap<B256, OnChainChannel>>,
        block: AtomicU64,
    }

    impl FakeContract {
        fn new(address: Address) -> Self {
            FakeContract {
                address,
                channels: Mutex::new(HashMap::new()),
                block: AtomicU64::new(0),
            }
        }

        async fn insert(&self, id: B256, channel: OnChainChannel) {
            self.channels.lock().await.insert(id, channel);
        }
    }

    #[async_trait]
    impl ChannelContract for FakeContract {
        fn address(&self) -> Address {
            self.address
        }
        async fn fetch(&self, channel_id: B256) -> Result<Option<OnChainChannel>, SettlementError> {
            Ok(self.channels.lock().await.get(&channel_id).cloned())
        }
        fn build_open(&self, _channel_id: B256, _receiver: Address, _dispute_period: u64, _value: U256) -> ContractCall {
            ContractCall {
                to: self.address,
                calldata: Default::default(),
                value: U256::ZERO,
            }
        }
        fn build_deposit(&self, _channel_id: B256, _value: U256) -> ContractCall {
            ContractCall {
                to: self.address,
                calldata: Default::default(),
                value: U256::ZERO,
            }
        }
        fn build_claim(&self, _channel_id: B256, _value: U256, _signature: Vec<u8>) -> ContractCall {
            ContractCall {
                to: self.address,
                calldata: Default::default(),
                value: U256::ZERO,
            }
        }
        fn build_start_dispute(&self, _channel_id: B256) -> ContractCall {
            ContractCall {
                to: self.address,
                calldata: Default::default(),
                value: U256::ZERO,
            }
        }
        async fn current_block(&self) -> Result<u64, SettlementError> {
            Ok(self.block.load(Ordering::Relaxed))
        }
    }

    struct FakeTxExecutor {
        revert: bool,
    }

    #[async_trait]
    impl TxExecutor for FakeTxExecutor {
        async fn estimate_fee(&self, _call: &ContractCall) -> Result<U256, SettlementError> {
            Ok(U256::from(1000u64))
        }
        async fn submit(&self, _call: ContractCall, _confirmations: u64, authorizer: &(dyn FeeAuthorizer + Sync)) -> Result<TxOutcome, SettlementError> {
            authorizer.authorize(U256::from(1000u64)).await.map_err(SettlementError::FeeRejected)?;
            if self.revert {
                Ok(TxOutcome::Reverted { tx_hash: "0xdead".into() })
            } else {
                Ok(TxOutcome::Success { tx_hash: "0xbeef".into() })
            }
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl crate::btp::BtpTransport for RecordingTransport {
        async fn send_message(&self, account_name: &str, message: SPM) -> Result<(), String> {
            self.sent.lock().await.push((account_name.to_string(), message.protocol_name().to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMoneyHandler {
        calls: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl MoneyHandler for RecordingMoneyHandler {
        async fn handle_incoming_money(&self, _account_name: &str, amount_gwei: u64) {
            self.calls.lock().await.push(amount_gwei);
        }
    }

    async fn test_account(
        contract: Arc<FakeContract>,
        tx_executor: Arc<FakeTxExecutor>,
        transport: Arc<RecordingTransport>,
        money_handler: Arc<RecordingMoneyHandler>,
    ) -> PeerAccount {
        let config = Arc::new(test_config());
        let signer = Arc::new(PrivateKeySigner::random());
        let our_address = signer.address();
        PeerAccount::load_or_create(
            "alice".into(),
            config,
            contract,
            tx_executor,
            signer,
            our_address,
            transport,
            Arc::new(InMemoryStore::new()),
            money_handler,
        )
        .await
        .unwrap()
    }

    fn test_config() -> Config {
        Config {
            port: 4000,
            database_url: String::new(),
            rpc_url: String::new(),
            chain_id: 1,
            private_key: String::new(),
            contract_address: address!("0000000000000000000000000000000000000009"),
            outgoing_channel_amount_gwei: 1_000_000,
            outgoing_dispute_period: 100,
            min_incoming_dispute_period: 40,
            max_packet_amount_gwei: 10_000,
            max_balance_gwei: 1_000_000,
            channel_watcher_interval_ms: 60_000,
        }
    }

    // S1 (partial) -- sub-1-gwei claim produces no money-handler call;
    // a claim crossing a whole gwei does.
    #[tokio::test]
    async fn incoming_claim_below_one_gwei_does_not_invoke_money_handler() {
        let contract_address = address!("0000000000000000000000000000000000000009");
        let contract = Arc::new(FakeContract::new(contract_address));
        let money_handler = Arc::new(RecordingMoneyHandler::default());
        let account = test_account(contract.clone(), Arc::new(FakeTxExecutor { revert: false }), Arc::new(RecordingTransport::default()), money_handler.clone()).await;

        let sender_wallet = PrivateKeySigner::random();
        let channel_id = random_channel_id();
        contract
            .insert(
                channel_id,
                OnChainChannel {
                    sender: sender_wallet.address(),
                    receiver: account.our_address,
                    value: U256::from(1_000_000_000u64),
                    dispute_period: 100,
                    disputed_until: None,
                },
            )
            .await;

        let claim = sign_claim(&sender_wallet, contract_address, channel_id, U256::from(500_000u64)).await.unwrap();
        account.handle_claim(claim).await.unwrap();
        assert!(money_handler.calls.lock().await.is_empty());

        let claim2 = sign_claim(&sender_wallet, contract_address, channel_id, U256::from(10_000_000_000u64)).await.unwrap();
        account.handle_claim(claim2).await.unwrap();
        assert_eq!(*money_handler.calls.lock().await, vec![10]);
    }

    // S2 -- replay rejection: a claim repeating the last accepted value
    // produces no additional money-handler call and leaves state unchanged.
    #[tokio::test]
    async fn replayed_claim_is_ignored() {
        let contract_address = address!("0000000000000000000000000000000000000009");
        let contract = Arc::new(FakeContract::new(contract_address));
        let money_handler = Arc::new(RecordingMoneyHandler::default());
        let account = test_account(contract.clone(), Arc::new(FakeTxExecutor { revert: false }), Arc::new(RecordingTransport::default()), money_handler.clone()).await;

        let sender_wallet = PrivateKeySigner::random();
        let channel_id = random_channel_id();
        contract
            .insert(
                channel_id,
                OnChainChannel {
                    sender: sender_wallet.address(),
                    receiver: account.our_address,
                    value: U256::from(20_000_000_000u64),
                    dispute_period: 100,
                    disputed_until: None,
                },
            )
            .await;

        let claim = sign_claim(&sender_wallet, contract_address, channel_id, U256::from(10_000_000_000u64)).await.unwrap();
        account.handle_claim(claim.clone()).await.unwrap();
        assert_eq!(*money_handler.calls.lock().await, vec![10]);

        account.handle_claim(claim).await.unwrap();
        assert_eq!(*money_handler.calls.lock().await, vec![10]);
        assert_eq!(account.incoming.snapshot().unwrap().spent, U256::from(10_000_000_000u64));
    }

    // S3 -- duplicate channel: a second account cannot link a channel
    // already owned by the first.
    #[tokio::test]
    async fn duplicate_channel_link_is_rejected() {
        let contract_address = address!("0000000000000000000000000000000000000009");
        let contract = Arc::new(FakeContract::new(contract_address));
        let store = Arc::new(InMemoryStore::new());
        let sender_wallet = PrivateKeySigner::random();
        let channel_id = random_channel_id();

        let signer_a = Arc::new(PrivateKeySigner::random());
        let account_a = PeerAccount::load_or_create(
            "account-a".into(),
            Arc::new(test_config()),
            contract.clone(),
            Arc::new(FakeTxExecutor { revert: false }),
            signer_a.clone(),
            signer_a.address(),
            Arc::new(RecordingTransport::default()),
            store.clone(),
            Arc::new(RecordingMoneyHandler::default()),
        )
        .await
        .unwrap();

        contract
            .insert(
                channel_id,
                OnChainChannel {
                    sender: sender_wallet.address(),
                    receiver: account_a.our_address,
                    value: U256::from(20_000_000_000u64),
                    dispute_period: 100,
                    disputed_until: None,
                },
            )
            .await;

        let claim = sign_claim(&sender_wallet, contract_address, channel_id, U256::from(1_000_000_000u64)).await.unwrap();
        account_a.handle_claim(claim.clone()).await.unwrap();

        let signer_b = Arc::new(PrivateKeySigner::random());
        let account_b = PeerAccount::load_or_create(
            "account-b".into(),
            Arc::new(test_config()),
            contract.clone(),
            Arc::new(FakeTxExecutor { revert: false }),
            signer_b.clone(),
            account_a.our_address,
            Arc::new(RecordingTransport::default()),
            store.clone(),
            Arc::new(RecordingMoneyHandler::default()),
        )
        .await
        .unwrap();

        let err = account_b.handle_claim(claim).await.unwrap_err();
        assert!(matches!(err, SettlementError::ChannelAlreadyLinked { .. }));
        assert_eq!(store.incoming_channel_owner(&format!("{:x}", channel_id)).await.unwrap(), Some("account-a".to_string()));
    }

    // S4 -- PREPARE rollback on REJECT restores the prior receivable balance.
    #[tokio::test]
    async fn prepare_rollback_restores_balance_on_reject() {
        struct RejectingHandler;
        #[async_trait]
        impl DataHandler for RejectingHandler {
            async fn handle_prepare(&self, _prepare: Prepare) -> Result<PrepareResponse, String> {
                Ok(PrepareResponse::Reject(Reject::bundled("downstream failure")))
            }
        }

        let contract = Arc::new(FakeContract::new(address!("0000000000000000000000000000000000000009")));
        let account = test_account(contract, Arc::new(FakeTxExecutor { revert: false }), Arc::new(RecordingTransport::default()), Arc::new(RecordingMoneyHandler::default())).await;

        let prepare = Prepare {
            amount_gwei: 600,
            condition: [0u8; 32],
            destination: "g.alice".into(),
            data: vec![],
        };
        let response = account.handle_prepare(prepare, &RejectingHandler).await.unwrap();
        assert!(matches!(response, PrepareResponse::Reject(_)));
    }

    // S6 -- unprofitable claim: fee >= spent with no authorizer means the
    // claim transaction is never submitted and the cached channel survives.
    #[tokio::test]
    async fn unprofitable_claim_is_not_submitted() {
        let contract_address = address!("0000000000000000000000000000000000000009");
        let contract = Arc::new(FakeContract::new(contract_address));
        let account = test_account(contract.clone(), Arc::new(FakeTxExecutor { revert: false }), Arc::new(RecordingTransport::default()), Arc::new(RecordingMoneyHandler::default())).await;

        let sender_wallet = PrivateKeySigner::random();
        let channel_id = random_channel_id();
        contract
            .insert(
                channel_id,
                OnChainChannel {
                    sender: sender_wallet.address(),
                    receiver: account.our_address,
                    value: U256::from(1_000_000u64),
                    dispute_period: 100,
                    disputed_until: None,
                },
            )
            .await;
        let claim = sign_claim(&sender_wallet, contract_address, channel_id, U256::from(100_000u64)).await.unwrap();
        account.handle_claim(claim).await.unwrap();

        let err = account.claim_if_profitable(false, None).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotProfitable { .. }));
        assert!(account.incoming.snapshot().is_some());
    }

    #[tokio::test]
    async fn send_money_signs_claim_and_debits_payable_balance() {
        let contract_address = address!("0000000000000000000000000000000000000009");
        let contract = Arc::new(FakeContract::new(contract_address));
        let transport = Arc::new(RecordingTransport::default());
        let account = test_account(contract.clone(), Arc::new(FakeTxExecutor { revert: false }), transport.clone(), Arc::new(RecordingMoneyHandler::default())).await;

        let channel_id = random_channel_id();
        let outgoing = PaymentChannel::from_on_chain(
            channel_id,
            contract_address,
            &OnChainChannel {
                sender: account.our_address,
                receiver: address!("0000000000000000000000000000000000000002"),
                value: U256::from(1_000_000_000_000u64),
                dispute_period: 100,
                disputed_until: None,
            },
            U256::ZERO,
            None,
        );
        account.outgoing.add(PRIORITY_DEFAULT, move |_| async move { Ok(Some(outgoing)) }).await.unwrap().unwrap();

        account.send_money(Some(50)).await.unwrap();

        let channel = account.outgoing.snapshot().unwrap();
        assert_eq!(channel.spent, gwei_to_wei(50));
        assert!(channel.signature.is_some());
        assert_eq!(transport.sent.lock().await.len(), 1);
    }
}
