// contract.rs - ChannelContract: thin typed view over the on-chain contract
//
// Binding style follows `IStreamChannel`'s `sol!` usage: a single macro
// block generates the ABI-encoded call types, and a trait wraps it so
// PeerAccount/TxExecutor never talk to the `sol!`-generated types directly.

use alloy::network::Ethereum;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;

use crate::error::SettlementError;

sol! {
    #[sol(rpc)]
    contract IPaymentChannel {
        function open(bytes32 channelId, address receiver, uint256 disputePeriod) external payable;
        function deposit(bytes32 channelId) external payable;
        function claim(bytes32 channelId, uint256 value, bytes calldata signature) external;
        function startDispute(bytes32 channelId) external;
        function channels(bytes32 channelId) external view returns (address sender, address receiver, uint256 value, uint256 disputePeriod, uint256 disputedUntil);
    }
}

/// On-chain state of a channel, as read from the contract's `channels` view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainChannel {
    pub sender: Address,
    pub receiver: Address,
    pub value: U256,
    pub dispute_period: u64,
    /// `None` if `disputedUntil == 0` (contract convention for "not disputed").
    pub disputed_until: Option<u64>,
}

impl OnChainChannel {
    pub fn is_disputed(&self, current_block: u64) -> bool {
        matches!(self.disputed_until, Some(until) if until > current_block)
    }
}

/// A single contract call, ready for `TxExecutor` to estimate, sign and send.
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub to: Address,
    pub calldata: alloy::primitives::Bytes,
    pub value: U256,
}

/// Thin typed view over the on-chain payment channel contract.
///
/// Non-goals (spec.md §1): no ERC-20 variants, no bidirectional channels, no
/// multi-hop routing — this trait only ever addresses one contract instance
/// for one unidirectional sender->receiver relationship per channel id.
#[async_trait]
pub trait ChannelContract: Send + Sync {
    /// Our configured contract address.
    fn address(&self) -> Address;

    /// Fetch a channel's current on-chain state. `None` if it doesn't exist.
    async fn fetch(&self, channel_id: B256) -> Result<Option<OnChainChannel>, SettlementError>;

    /// Build an `open` call, escrowing `value` wei for `receiver`.
    fn build_open(&self, channel_id: B256, receiver: Address, dispute_period: u64, value: U256) -> ContractCall;

    /// Build a `deposit` call, adding `value` wei of escrow to an existing channel.
    fn build_deposit(&self, channel_id: B256, value: U256) -> ContractCall;

    /// Build a `claim` call redeeming `value` wei using `signature`.
    fn build_claim(&self, channel_id: B256, value: U256, signature: Vec<u8>) -> ContractCall;

    /// Build a `startDispute` call.
    fn build_start_dispute(&self, channel_id: B256) -> ContractCall;

    /// Current block height, used to evaluate `disputedUntil`.
    async fn current_block(&self) -> Result<u64, SettlementError>;
}

/// `alloy`-backed implementation over a JSON-RPC provider.
pub struct AlloyChannelContract<P: Provider<Ethereum> + Send + Sync> {
    contract_address: Address,
    provider: P,
}

impl<P: Provider<Ethereum> + Send + Sync> AlloyChannelContract<P> {
    pub fn new(contract_address: Address, provider: P) -> Self {
        Self {
            contract_address,
            provider,
        }
    }
}

#[async_trait]
impl<P: Provider<Ethereum> + Send + Sync> ChannelContract for AlloyChannelContract<P> {
    fn address(&self) -> Address {
        self.contract_address
    }

    async fn fetch(&self, channel_id: B256) -> Result<Option<OnChainChannel>, SettlementError> {
        let contract = IPaymentChannel::new(self.contract_address, &self.provider);
        let result = contract
            .channels(channel_id)
            .call()
            .await
            .map_err(|e| SettlementError::Rpc(format!("channels({}) failed: {}", channel_id, e)))?;

        if result.sender == Address::ZERO {
            return Ok(None);
        }

        let disputed_until = if result.disputedUntil.is_zero() {
            None
        } else {
            Some(result.disputedUntil.to::<u64>())
        };

        Ok(Some(OnChainChannel {
            sender: result.sender,
            receiver: result.receiver,
            value: result.value,
            dispute_period: result.disputePeriod.to::<u64>(),
            disputed_until,
        }))
    }

    fn build_open(&self, channel_id: B256, receiver: Address, dispute_period: u64, value: U256) -> ContractCall {
        let call = IPaymentChannel::openCall {
            channelId: channel_id,
            receiver,
            disputePeriod: U256::from(dispute_period),
        };
        ContractCall {
            to: self.contract_address,
            calldata: call.abi_encode().into(),
            value,
        }
    }

    fn build_deposit(&self, channel_id: B256, value: U256) -> ContractCall {
        let call = IPaymentChannel::depositCall { channelId: channel_id };
        ContractCall {
            to: self.contract_address,
            calldata: call.abi_encode().into(),
            value,
        }
    }

    fn build_claim(&self, channel_id: B256, value: U256, signature: Vec<u8>) -> ContractCall {
        let call = IPaymentChannel::claimCall {
            channelId: channel_id,
            value,
            signature: signature.into(),
        };
        ContractCall {
            to: self.contract_address,
            calldata: call.abi_encode().into(),
            value: U256::ZERO,
        }
    }

    fn build_start_dispute(&self, channel_id: B256) -> ContractCall {
        let call = IPaymentChannel::startDisputeCall { channelId: channel_id };
        ContractCall {
            to: self.contract_address,
            calldata: call.abi_encode().into(),
            value: U256::ZERO,
        }
    }

    async fn current_block(&self) -> Result<u64, SettlementError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| SettlementError::Rpc(format!("get_block_number failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disputed_until_in_future_is_disputed() {
        let channel = OnChainChannel {
            sender: Address::ZERO,
            receiver: Address::ZERO,
            value: U256::ZERO,
            dispute_period: 100,
            disputed_until: Some(500),
        };
        assert!(channel.is_disputed(400));
        assert!(!channel.is_disputed(500));
        assert!(!channel.is_disputed(600));
    }

    #[test]
    fn no_dispute_set_is_never_disputed() {
        let channel = OnChainChannel {
            sender: Address::ZERO,
            receiver: Address::ZERO,
            value: U256::ZERO,
            dispute_period: 100,
            disputed_until: None,
        };
        assert!(!channel.is_disputed(0));
        assert!(!channel.is_disputed(u64::MAX));
    }
}
