// ilp.rs - Minimal ILP packet representation
//
// The actual PREPARE/FULFILL/REJECT OER wire codec is out of scope
// (spec.md §1); this module defines just enough of a typed packet shape for
// PeerAccount's balance-accounting logic (§4.8/§4.9) to operate on, plus the
// F08/T04/F00 error codes (spec.md §7). The real codec is injected as a
// `dyn IlpPacketCodec` by the plugin shell.

use serde::{Deserialize, Serialize};

/// The three ILP error code families this engine ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlpErrorCode {
    /// T04: insufficient liquidity -- would exceed `max_balance`.
    T04InsufficientLiquidity,
    /// F08: packet amount exceeds `max_packet_amount`.
    F08AmountTooLarge,
    /// F00: bundled/unexpected failure while forwarding.
    F00Bundled,
}

impl IlpErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IlpErrorCode::T04InsufficientLiquidity => "T04",
            IlpErrorCode::F08AmountTooLarge => "F08",
            IlpErrorCode::F00Bundled => "F00",
        }
    }
}

/// A parsed PREPARE packet -- only the fields the settlement engine reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prepare {
    pub amount_gwei: u64,
    pub condition: [u8; 32],
    pub destination: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// A parsed FULFILL packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fulfill {
    pub fulfillment: [u8; 32],
    #[serde(default)]
    pub data: Vec<u8>,
}

/// A parsed REJECT packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reject {
    pub code: String,
    pub message: String,
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Reject {
    pub fn new(code: IlpErrorCode, message: impl Into<String>) -> Self {
        Reject {
            code: code.as_str().to_string(),
            message: message.into(),
            triggered_by: None,
            data: Vec::new(),
        }
    }

    pub fn amount_too_large(received: u64, maximum: u64) -> Self {
        Reject {
            code: IlpErrorCode::F08AmountTooLarge.as_str().to_string(),
            message: format!("amount {} exceeds maximum {}", received, maximum),
            triggered_by: None,
            data: serde_json::to_vec(&serde_json::json!({
                "receivedAmount": received.to_string(),
                "maximumAmount": maximum.to_string(),
            }))
            .unwrap_or_default(),
        }
    }

    pub fn insufficient_liquidity() -> Self {
        Reject::new(
            IlpErrorCode::T04InsufficientLiquidity,
            "would exceed maximum balance",
        )
    }

    pub fn bundled(reason: impl Into<String>) -> Self {
        Reject::new(IlpErrorCode::F00Bundled, reason)
    }

    pub fn is_t04(&self) -> bool {
        self.code == IlpErrorCode::T04InsufficientLiquidity.as_str()
    }
}

/// Outcome of forwarding a PREPARE to the local ILP stack.
pub enum PrepareResponse {
    Fulfill(Fulfill),
    Reject(Reject),
}

/// Out-of-core local ILP stack's side of the interface: forwards a parsed
/// PREPARE and returns its eventual FULFILL or REJECT. Modeled as a trait so
/// PeerAccount never depends on a concrete router. An `Err` here is an
/// uncaught exception in the local stack; the caller synthesizes an F00
/// bundled reject for it (spec.md §4.8).
#[async_trait::async_trait]
pub trait DataHandler: Send + Sync {
    async fn handle_prepare(&self, prepare: Prepare) -> Result<PrepareResponse, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_too_large_carries_both_amounts() {
        let reject = Reject::amount_too_large(1000, 500);
        assert_eq!(reject.code, "F08");
        let payload: serde_json::Value = serde_json::from_slice(&reject.data).unwrap();
        assert_eq!(payload["receivedAmount"], "1000");
        assert_eq!(payload["maximumAmount"], "500");
    }

    #[test]
    fn is_t04_detects_the_right_code() {
        assert!(Reject::insufficient_liquidity().is_t04());
        assert!(!Reject::bundled("oops").is_t04());
    }
}
