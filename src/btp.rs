// btp.rs - BTP sub-protocol wire types
//
// The BTP transport itself is out of scope (spec.md §1); this module only
// defines the typed payloads for the four named sub-protocols it carries
// (spec.md §6): plain structs plus serde, camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::claim::ClaimMessage;

/// `info` sub-protocol payload: `application/json`, `{"ethereumAddress":"0x..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoMessage {
    #[serde(rename = "ethereumAddress")]
    pub ethereum_address: String,
}

/// `requestClose` sub-protocol: `text/plain; charset=utf-8`, always empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestCloseMessage;

/// The union of sub-protocol frames a peer can send us.
#[derive(Debug, Clone)]
pub enum SubProtocolMessage {
    Info(InfoMessage),
    Claim(ClaimMessage),
    RequestClose(RequestCloseMessage),
    Ilp(Vec<u8>),
}

impl SubProtocolMessage {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            SubProtocolMessage::Info(_) => "info",
            SubProtocolMessage::Claim(_) => "machinomy",
            SubProtocolMessage::RequestClose(_) => "requestClose",
            SubProtocolMessage::Ilp(_) => "ilp",
        }
    }
}

/// Outbound side of the BTP connection. The transport and framing are
/// out-of-core (spec.md §1); this trait is the fixed interface PeerAccount
/// depends on to reach its peer.
#[async_trait::async_trait]
pub trait BtpTransport: Send + Sync {
    /// Send a sub-protocol message to the peer, without awaiting a reply.
    /// Used for outgoing claims (spec.md §4.4: "without awaiting response").
    async fn send_message(&self, account_name: &str, message: SubProtocolMessage) -> Result<(), String>;
}

/// No-op transport: drops every message. Useful where a test only cares
/// about state transitions, not what got sent over the wire.
pub struct NullTransport;

#[async_trait::async_trait]
impl BtpTransport for NullTransport {
    async fn send_message(&self, _account_name: &str, _message: SubProtocolMessage) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_match_the_btp_wire_names() {
        assert_eq!(
            SubProtocolMessage::Info(InfoMessage {
                ethereum_address: "0x0".into()
            })
            .protocol_name(),
            "info"
        );
        assert_eq!(SubProtocolMessage::RequestClose(RequestCloseMessage).protocol_name(), "requestClose");
        assert_eq!(SubProtocolMessage::Ilp(vec![]).protocol_name(), "ilp");
    }

    #[tokio::test]
    async fn null_transport_always_succeeds() {
        let transport = NullTransport;
        let result = transport
            .send_message("alice", SubProtocolMessage::RequestClose(RequestCloseMessage))
            .await;
        assert!(result.is_ok());
    }
}
