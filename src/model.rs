// model.rs - In-memory channel and account state
//
// PaymentChannel (outgoing direction) and ClaimablePaymentChannel (incoming
// direction) are the `T` of PeerAccount's two ReducerQueues (spec.md §3).
// `Option<..>` captures "no channel yet" as a tagged variant rather than a
// nullable reference, per spec.md §9's "heterogeneous queue state" note.

use alloy::primitives::{Address, Signature, B256, U256};

use crate::contract::OnChainChannel;
use crate::store::ChannelSnapshot;

/// Outgoing channel: we are the sender, the peer is the receiver.
#[derive(Debug, Clone)]
pub struct PaymentChannel {
    pub channel_id: B256,
    pub contract_address: Address,
    pub sender: Address,
    pub receiver: Address,
    pub value: U256,
    pub dispute_period: u64,
    pub disputed_until: Option<u64>,
    /// Last signed cumulative value. Invariant: `0 <= spent <= value`,
    /// monotonically non-decreasing over the channel's lifetime.
    pub spent: U256,
    pub signature: Option<Signature>,
}

impl PaymentChannel {
    pub fn from_on_chain(channel_id: B256, contract_address: Address, chain: &OnChainChannel, spent: U256, signature: Option<Signature>) -> Self {
        PaymentChannel {
            channel_id,
            contract_address,
            sender: chain.sender,
            receiver: chain.receiver,
            value: chain.value,
            dispute_period: chain.dispute_period,
            disputed_until: chain.disputed_until,
            spent,
            signature,
        }
    }

    pub fn remaining(&self) -> U256 {
        self.value.saturating_sub(self.spent)
    }

    pub fn is_disputed(&self, current_block: u64) -> bool {
        matches!(self.disputed_until, Some(until) if until > current_block)
    }

    pub fn to_snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: format!("0x{:x}", self.channel_id),
            contract_address: format!("0x{:x}", self.contract_address),
            sender: format!("0x{:x}", self.sender),
            receiver: format!("0x{:x}", self.receiver),
            value: self.value.to_string(),
            dispute_period: self.dispute_period,
            disputed_until: self.disputed_until,
            spent: self.spent.to_string(),
            signature: self.signature.map(|s| format!("0x{}", hex::encode(s.as_bytes()))),
        }
    }
}

/// Incoming channel: the peer is the sender, we are the receiver. Same
/// shape as `PaymentChannel`; a signature is required once a claim has been
/// accepted (spec.md §3).
pub type ClaimablePaymentChannel = PaymentChannel;

impl TryFrom<&ChannelSnapshot> for PaymentChannel {
    type Error = crate::error::SettlementError;

    fn try_from(snapshot: &ChannelSnapshot) -> Result<Self, Self::Error> {
        use crate::claim::{parse_address, parse_b256, parse_signature, parse_u256};

        let signature = snapshot.signature.as_deref().map(parse_signature).transpose()?;

        Ok(PaymentChannel {
            channel_id: parse_b256(&snapshot.channel_id)?,
            contract_address: parse_address(&snapshot.contract_address)?,
            sender: parse_address(&snapshot.sender)?,
            receiver: parse_address(&snapshot.receiver)?,
            value: parse_u256(&snapshot.value)?,
            dispute_period: snapshot.dispute_period,
            disputed_until: snapshot.disputed_until,
            spent: parse_u256(&snapshot.spent)?,
            signature,
        })
    }
}
