// main.rs - Entry point for the settlement engine
//
// Wires config -> alloy provider/signer -> Postgres store -> AccountRouter
// (load config, connect db, connect provider, build state, serve). The BTP
// transport and local ILP stack are
// out-of-core (spec.md §1): a real deployment embeds this crate's
// AccountRouter inside a plugin shell that supplies both. Here we start only
// the read-only admin surface so the engine is independently runnable.

use std::net::SocketAddr;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;
use tracing::info;

use channel_settlement_engine::admin::{self, AdminState};
use channel_settlement_engine::btp::{BtpTransport, SubProtocolMessage};
use channel_settlement_engine::config::Config;
use channel_settlement_engine::contract::{self, AlloyChannelContract};
use channel_settlement_engine::peer_account::MoneyHandler;
use channel_settlement_engine::plugin;
use channel_settlement_engine::store::{self, PostgresStore};
use channel_settlement_engine::tx_executor::{self, AlloyTxExecutor};

/// Placeholder transport until a plugin shell supplies a real BTP connection.
struct UnwiredTransport;

#[async_trait]
impl BtpTransport for UnwiredTransport {
    async fn send_message(&self, account_name: &str, message: SubProtocolMessage) -> Result<(), String> {
        tracing::warn!(
            account = account_name,
            protocol = message.protocol_name(),
            "no BTP transport wired; dropping outgoing sub-protocol message"
        );
        Ok(())
    }
}

/// Placeholder money handler until a plugin shell supplies a real callback.
struct LoggingMoneyHandler;

#[async_trait]
impl MoneyHandler for LoggingMoneyHandler {
    async fn handle_incoming_money(&self, account_name: &str, amount_gwei: u64) {
        info!(account = account_name, amount_gwei, "incoming money handler not wired; logging only");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env()?);
    let port = config.port;

    let db = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let store = PostgresStore::new(db);
    store.init().await?;
    let store: Arc<dyn store::Store> = Arc::new(store);

    let provider = ProviderBuilder::new()
        .disable_recommended_fillers()
        .connect_http(config.rpc_url.parse()?);

    let signer: PrivateKeySigner = config.private_key.parse()?;
    let our_address = signer.address();
    info!("settlement engine address: {}", our_address);

    let contract: Arc<dyn contract::ChannelContract> =
        Arc::new(AlloyChannelContract::new(config.contract_address, provider.clone()));

    let wallet = EthereumWallet::from(signer.clone());
    let signing_provider = ProviderBuilder::new().wallet(wallet.clone()).connect_http(config.rpc_url.parse()?);
    let tx_executor: Arc<dyn tx_executor::TxExecutor> = Arc::new(AlloyTxExecutor::new(signing_provider, wallet));

    // Held for the process lifetime; a real plugin shell would drive this
    // from its BTP listener instead of letting it sit idle behind the admin
    // surface.
    let _account_router = plugin::AccountRouter::new(
        config.clone(),
        contract,
        tx_executor,
        Arc::new(signer),
        our_address,
        Arc::new(UnwiredTransport),
        store.clone(),
        Arc::new(LoggingMoneyHandler),
    );

    let admin_state = AdminState { store };
    let app = admin::create_router(admin_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("admin interface listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
