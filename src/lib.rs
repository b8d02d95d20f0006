// lib.rs - module map
//
// Leaf-first, matching §2's component table: ClaimCodec, ChannelContract,
// TxExecutor, ReducerQueue before PeerAccount; PeerAccount's collaborators
// (store, btp, ilp, model) are declared alongside it; the plugin shell and
// admin HTTP surface are the out-of-core layers on top.

pub mod claim;
pub mod config;
pub mod contract;
pub mod error;
pub mod reducer_queue;
pub mod tx_executor;

pub mod btp;
pub mod ilp;
pub mod model;
pub mod store;

pub mod channel_watcher;
pub mod peer_account;

pub mod admin;
pub mod plugin;
