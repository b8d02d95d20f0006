// plugin.rs - AccountRouter: address -> PeerAccount dispatch
//
// spec.md §1 calls the mini-accounts dispatcher itself out-of-core; this is
// the thin routing layer a real plugin shell would drive: look up or
// lazily create the PeerAccount for an account name, then forward the BTP
// sub-protocol message or ILP PREPARE to it. One state-holds-everything
// struct, generalized from "one global channel map" to "one PeerAccount
// per account name".

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::RwLock;

use crate::btp::{BtpTransport, SubProtocolMessage};
use crate::claim::Claim;
use crate::config::Config;
use crate::contract::ChannelContract;
use crate::error::SettlementError;
use crate::ilp::{DataHandler, Prepare, PrepareResponse};
use crate::peer_account::{MoneyHandler, PeerAccount};
use crate::store::Store;
use crate::tx_executor::{FeeAuthorizer, TxExecutor};

/// Routes peer traffic to per-account state machines, creating an account
/// lazily on its first message (spec.md §3's "created on first BTP message").
#[derive(Clone)]
pub struct AccountRouter {
    accounts: Arc<RwLock<HashMap<String, PeerAccount>>>,
    config: Arc<Config>,
    contract: Arc<dyn ChannelContract>,
    tx_executor: Arc<dyn TxExecutor>,
    signer: Arc<PrivateKeySigner>,
    our_address: Address,
    transport: Arc<dyn BtpTransport>,
    store: Arc<dyn Store>,
    money_handler: Arc<dyn MoneyHandler>,
}

impl AccountRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        contract: Arc<dyn ChannelContract>,
        tx_executor: Arc<dyn TxExecutor>,
        signer: Arc<PrivateKeySigner>,
        our_address: Address,
        transport: Arc<dyn BtpTransport>,
        store: Arc<dyn Store>,
        money_handler: Arc<dyn MoneyHandler>,
    ) -> Self {
        AccountRouter {
            accounts: Arc::new(RwLock::new(HashMap::new())),
            config,
            contract,
            tx_executor,
            signer,
            our_address,
            transport,
            store,
            money_handler,
        }
    }

    /// Look up an account, creating it (from store or fresh) on first use.
    pub async fn account(&self, account_name: &str) -> Result<PeerAccount, SettlementError> {
        if let Some(account) = self.accounts.read().await.get(account_name) {
            return Ok(account.clone());
        }

        let mut accounts = self.accounts.write().await;
        if let Some(account) = accounts.get(account_name) {
            return Ok(account.clone());
        }

        let account = PeerAccount::load_or_create(
            account_name.to_string(),
            self.config.clone(),
            self.contract.clone(),
            self.tx_executor.clone(),
            self.signer.clone(),
            self.our_address,
            self.transport.clone(),
            self.store.clone(),
            self.money_handler.clone(),
        )
        .await?;
        accounts.insert(account_name.to_string(), account.clone());
        Ok(account)
    }

    /// Tear down an account: stop its watcher, drop queued work, forget it here.
    pub async fn unload(&self, account_name: &str) -> Result<(), SettlementError> {
        let account = self.accounts.write().await.remove(account_name);
        if let Some(account) = account {
            account.unload().await?;
        }
        Ok(())
    }

    /// Dispatch an incoming BTP sub-protocol frame to its account, returning
    /// a reply payload if the sub-protocol expects one (spec.md §6).
    pub async fn handle_sub_protocol(
        &self,
        account_name: &str,
        message: SubProtocolMessage,
    ) -> Result<Option<SubProtocolMessage>, SettlementError> {
        let account = self.account(account_name).await?;
        match message {
            SubProtocolMessage::Info(msg) => {
                let reply = account.handle_info(msg).await?;
                Ok(Some(SubProtocolMessage::Info(reply)))
            }
            SubProtocolMessage::Claim(msg) => {
                let claim = Claim::parse(&msg)?;
                account.handle_claim(claim).await?;
                Ok(None)
            }
            SubProtocolMessage::RequestClose(_) => {
                account.handle_request_close();
                Ok(Some(SubProtocolMessage::RequestClose(Default::default())))
            }
            SubProtocolMessage::Ilp(_) => Err(SettlementError::Internal(
                "ilp sub-protocol frames require a packet codec, supplied by the plugin shell".into(),
            )),
        }
    }

    /// Forward a parsed PREPARE to `account_name`'s balance accounting.
    pub async fn handle_prepare(
        &self,
        account_name: &str,
        prepare: Prepare,
        data_handler: &(dyn DataHandler + Sync),
    ) -> Result<PrepareResponse, SettlementError> {
        self.account(account_name).await?.handle_prepare(prepare, data_handler).await
    }

    /// React to the response of a PREPARE this node sent as a client.
    pub async fn on_prepare_response(
        &self,
        account_name: &str,
        prepare_amount_gwei: u64,
        response: &PrepareResponse,
    ) -> Result<(), SettlementError> {
        self.account(account_name).await?.on_prepare_response(prepare_amount_gwei, response).await
    }

    /// Fund (open or deposit into) `account_name`'s outgoing channel.
    pub async fn fund_outgoing_channel(
        &self,
        account_name: &str,
        value_gwei: u64,
        authorizer: Arc<dyn FeeAuthorizer>,
    ) -> Result<(), SettlementError> {
        self.account(account_name).await?.fund_outgoing_channel(value_gwei, authorizer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btp::InfoMessage;
    use crate::contract::{ContractCall, OnChainChannel};
    use crate::store::InMemoryStore;
    use crate::tx_executor::TxOutcome;
    use alloy::primitives::{address, B256, U256};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex;

    struct FakeContract {
        address: Address,
    }

    #[async_trait]
    impl ChannelContract for FakeContract {
        fn address(&self) -> Address {
            self.address
        }
        async fn fetch(&self, _channel_id: B256) -> Result<Option<OnChainChannel>, SettlementError> {
            Ok(None)
        }
        fn build_open(&self, _: B256, _: Address, _: u64, _: U256) -> ContractCall {
            ContractCall { to: self.address, calldata: Default::default(), value: U256::ZERO }
        }
        fn build_deposit(&self, _: B256, _: U256) -> ContractCall {
            ContractCall { to: self.address, calldata: Default::default(), value: U256::ZERO }
        }
        fn build_claim(&self, _: B256, _: U256, _: Vec<u8>) -> ContractCall {
            ContractCall { to: self.address, calldata: Default::default(), value: U256::ZERO }
        }
        fn build_start_dispute(&self, _: B256) -> ContractCall {
            ContractCall { to: self.address, calldata: Default::default(), value: U256::ZERO }
        }
        async fn current_block(&self) -> Result<u64, SettlementError> {
            Ok(0)
        }
    }

    struct NoopExecutor;
    #[async_trait]
    impl TxExecutor for NoopExecutor {
        async fn estimate_fee(&self, _call: &ContractCall) -> Result<U256, SettlementError> {
            Ok(U256::ZERO)
        }
        async fn submit(&self, _call: ContractCall, _confirmations: u64, _authorizer: &(dyn FeeAuthorizer + Sync)) -> Result<TxOutcome, SettlementError> {
            Ok(TxOutcome::Success { tx_hash: "0x0".into() })
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<StdHashMap<String, usize>>,
    }
    #[async_trait]
    impl BtpTransport for RecordingTransport {
        async fn send_message(&self, account_name: &str, _message: SubProtocolMessage) -> Result<(), String> {
            *self.sent.lock().await.entry(account_name.to_string()).or_insert(0) += 1;
            Ok(())
        }
    }

    struct NullMoneyHandler;
    #[async_trait]
    impl MoneyHandler for NullMoneyHandler {
        async fn handle_incoming_money(&self, _account_name: &str, _amount_gwei: u64) {}
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

    fn router() -> AccountRouter {
        let signer = Arc::new(PrivateKeySigner::random());
        AccountRouter::new(
            Arc::new(test_config()),
            Arc::new(FakeContract { address: address!("0000000000000000000000000000000000000009") }),
            Arc::new(NoopExecutor),
            signer.clone(),
            signer.address(),
            Arc::new(RecordingTransport::default()),
            Arc::new(InMemoryStore::new()),
            Arc::new(NullMoneyHandler),
        )
    }

    #[tokio::test]
    async fn account_is_created_lazily_and_reused() {
        let router = router();
        let a1 = router.account("alice").await.unwrap();
        let a2 = router.account("alice").await.unwrap();
        assert_eq!(a1.account_name, a2.account_name);
        assert_eq!(router.accounts.read().await.len(), 1);
    }

    #[tokio::test]
    async fn info_sub_protocol_replies_with_our_address() {
        let router = router();
        let reply = router
            .handle_sub_protocol("alice", SubProtocolMessage::Info(InfoMessage { ethereum_address: format!("0x{:x}", router.our_address) }))
            .await
            .unwrap();
        assert!(matches!(reply, Some(SubProtocolMessage::Info(_))));
    }

    #[tokio::test]
    async fn unload_forgets_the_account() {
        let router = router();
        router.account("alice").await.unwrap();
        router.unload("alice").await.unwrap();
        assert!(router.accounts.read().await.get("alice").is_none());
    }
}
