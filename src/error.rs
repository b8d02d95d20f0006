// error.rs - Crate-wide error taxonomy
//
// One enum, one IntoResponse impl for the admin HTTP surface, `thiserror`
// for the rest. Every error a ReducerQueue
// reducer can produce is one of these variants; a reducer that returns Err
// leaves the state cell untouched and the error surfaces only through the
// handle the caller is awaiting.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    // =========================================================================
    // Protocol / validation errors on incoming claims
    // =========================================================================
    #[error("claim targets a different contract: expected {expected}, got {actual}")]
    WrongContract { expected: String, actual: String },

    #[error("claim signature does not recover to the channel sender")]
    InvalidClaimSignature,

    #[error("channel receiver {receiver} is not our address {ours}")]
    NotOurChannel { receiver: String, ours: String },

    #[error("channel dispute period {actual} is below minimum {minimum}")]
    DisputePeriodTooShort { actual: u64, minimum: u64 },

    #[error("channel {channel_id} is already linked to account {existing_account}")]
    ChannelAlreadyLinked {
        channel_id: String,
        existing_account: String,
    },

    #[error("claim channel id {claim_id} does not match cached channel {cached_id}")]
    ChannelIdMismatch { claim_id: String, cached_id: String },

    // =========================================================================
    // Transient chain errors
    // =========================================================================
    #[error("channel {0} not yet visible on chain after retrying")]
    ChannelNotYetVisible(String),

    #[error("channel {0} vanished from chain")]
    ChannelVanished(String),

    // =========================================================================
    // Transaction failures
    // =========================================================================
    #[error("peer's Ethereum address is unknown, cannot open an outgoing channel")]
    PeerAddressUnknown,

    #[error("fee authorization rejected: {0}")]
    FeeRejected(String),

    #[error("transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("claim is not profitable to redeem: fee {fee} >= spent {spent}")]
    NotProfitable { fee: String, spent: String },

    #[error("rpc call failed: {0}")]
    Rpc(String),

    // =========================================================================
    // ILP-level errors (mapped to typed rejects by the caller)
    // =========================================================================
    #[error("amount {received} exceeds maximum packet amount {maximum}")]
    AmountTooLarge { received: u64, maximum: u64 },

    #[error("admitting amount {amount} would exceed max balance {max_balance} (current receivable {current})")]
    InsufficientLiquidity {
        amount: u64,
        current: i64,
        max_balance: i64,
    },

    // =========================================================================
    // Store / transport / misc
    // =========================================================================
    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for SettlementError {
    fn into_response(self) -> Response {
        let status = match &self {
            SettlementError::AccountNotFound(_) => StatusCode::NOT_FOUND,

            SettlementError::WrongContract { .. }
            | SettlementError::InvalidClaimSignature
            | SettlementError::NotOurChannel { .. }
            | SettlementError::DisputePeriodTooShort { .. }
            | SettlementError::ChannelAlreadyLinked { .. }
            | SettlementError::ChannelIdMismatch { .. }
            | SettlementError::AmountTooLarge { .. }
            | SettlementError::InsufficientLiquidity { .. }
            | SettlementError::InvalidAddress(_) => StatusCode::BAD_REQUEST,

            SettlementError::ChannelNotYetVisible(_)
            | SettlementError::ChannelVanished(_)
            | SettlementError::PeerAddressUnknown
            | SettlementError::FeeRejected(_)
            | SettlementError::TransactionReverted(_)
            | SettlementError::NotProfitable { .. } => StatusCode::CONFLICT,

            SettlementError::Rpc(_)
            | SettlementError::Store(_)
            | SettlementError::Transport(_)
            | SettlementError::Database(_)
            | SettlementError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
