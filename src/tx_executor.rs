// tx_executor.rs - TxExecutor: build, fee-estimate, submit, await confirmation
//
// Grounded on the nonce/gas/confirmation handling in the r402 EVM settlement
// provider (Eip155ChainProvider::send_transaction): estimate gas, submit,
// wait for N confirmations, surface revert vs success distinctly.

use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::U256;
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;

use crate::contract::ContractCall;
use crate::error::SettlementError;

/// Outcome of a submitted-and-awaited transaction.
#[derive(Debug, Clone)]
pub enum TxOutcome {
    /// Transaction was mined and did not revert.
    Success { tx_hash: String },
    /// Transaction was mined but reverted.
    Reverted { tx_hash: String },
}

/// Caller-supplied fee authorization gate. Returns `Ok(())` to proceed,
/// `Err` (with a human reason) to abort -- mirrors spec.md's `authorize(fee)`.
#[async_trait]
pub trait FeeAuthorizer: Send + Sync {
    async fn authorize(&self, fee_wei: U256) -> Result<(), String>;
}

/// Always approves -- used when the caller has no opinion on fees (and then
/// `claimIfProfitable`'s own fee >= spent gate is the only check, per
/// spec.md §4.7).
pub struct AlwaysAuthorize;

#[async_trait]
impl FeeAuthorizer for AlwaysAuthorize {
    async fn authorize(&self, _fee_wei: U256) -> Result<(), String> {
        Ok(())
    }
}

/// Returns the current gas price, standing in for spec.md's `getGasPrice()` callback.
#[async_trait]
pub trait GasOracle: Send + Sync {
    async fn gas_price_wei(&self) -> Result<U256, SettlementError>;
}

/// Builds, estimates, submits and awaits confirmation of a transaction.
#[async_trait]
pub trait TxExecutor: Send + Sync {
    /// Estimate the total fee (gas price * gas limit) for `call`, without sending it.
    async fn estimate_fee(&self, call: &ContractCall) -> Result<U256, SettlementError>;

    /// Submit `call` (after `authorizer` approves the estimated fee) and await
    /// `confirmations` confirmations. Distinguishes revert from success.
    async fn submit(
        &self,
        call: ContractCall,
        confirmations: u64,
        authorizer: &(dyn FeeAuthorizer + Sync),
    ) -> Result<TxOutcome, SettlementError>;
}

/// `alloy`-backed implementation: a provider with gas/nonce/wallet fillers
/// already composed via `ProviderBuilder::new().wallet(wallet)...`.
pub struct AlloyTxExecutor<P: Provider<Ethereum> + Send + Sync> {
    provider: P,
    #[allow(dead_code)]
    wallet: EthereumWallet,
}

impl<P: Provider<Ethereum> + Send + Sync> AlloyTxExecutor<P> {
    pub fn new(provider: P, wallet: EthereumWallet) -> Self {
        Self { provider, wallet }
    }

    fn to_request(&self, call: &ContractCall) -> TransactionRequest {
        TransactionRequest::default()
            .with_to(call.to)
            .with_input(call.calldata.clone())
            .with_value(call.value)
    }
}

#[async_trait]
impl<P: Provider<Ethereum> + Send + Sync> TxExecutor for AlloyTxExecutor<P> {
    async fn estimate_fee(&self, call: &ContractCall) -> Result<U256, SettlementError> {
        let request = self.to_request(call);
        let gas_limit = self
            .provider
            .estimate_gas(request.clone())
            .await
            .map_err(|e| SettlementError::Rpc(format!("gas estimation failed: {}", e)))?;
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| SettlementError::Rpc(format!("gas price lookup failed: {}", e)))?;
        Ok(U256::from(gas_limit) * U256::from(gas_price))
    }

    async fn submit(
        &self,
        call: ContractCall,
        confirmations: u64,
        authorizer: &(dyn FeeAuthorizer + Sync),
    ) -> Result<TxOutcome, SettlementError> {
        let fee = self.estimate_fee(&call).await?;
        authorizer
            .authorize(fee)
            .await
            .map_err(SettlementError::FeeRejected)?;

        let request = self.to_request(&call);
        let pending = self
            .provider
            .send_transaction(request)
            .await
            .map_err(|e| SettlementError::Rpc(format!("transaction submission failed: {}", e)))?;

        let receipt = pending
            .with_required_confirmations(confirmations)
            .get_receipt()
            .await
            .map_err(|e| SettlementError::Rpc(format!("confirmation wait failed: {}", e)))?;

        let tx_hash = format!("0x{:x}", receipt.transaction_hash);
        if receipt.status() {
            Ok(TxOutcome::Success { tx_hash })
        } else {
            Ok(TxOutcome::Reverted { tx_hash })
        }
    }
}

/// Queries the provider's current gas price directly.
pub struct ProviderGasOracle<P: Provider<Ethereum> + Send + Sync> {
    provider: P,
}

impl<P: Provider<Ethereum> + Send + Sync> ProviderGasOracle<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: Provider<Ethereum> + Send + Sync> GasOracle for ProviderGasOracle<P> {
    async fn gas_price_wei(&self) -> Result<U256, SettlementError> {
        let price = self
            .provider
            .get_gas_price()
            .await
            .map_err(|e| SettlementError::Rpc(format!("gas price lookup failed: {}", e)))?;
        Ok(U256::from(price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectingAuthorizer;

    #[async_trait]
    impl FeeAuthorizer for RejectingAuthorizer {
        async fn authorize(&self, fee_wei: U256) -> Result<(), String> {
            Err(format!("fee {} too high", fee_wei))
        }
    }

    #[tokio::test]
    async fn always_authorize_approves_any_fee() {
        let auth = AlwaysAuthorize;
        assert!(auth.authorize(U256::from(u64::MAX)).await.is_ok());
    }

    #[tokio::test]
    async fn rejecting_authorizer_reports_the_fee() {
        let auth = RejectingAuthorizer;
        let err = auth.authorize(U256::from(42u64)).await.unwrap_err();
        assert!(err.contains("42"));
    }
}
