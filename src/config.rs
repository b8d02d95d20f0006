// config.rs - Load configuration from environment variables
//
// Every key in spec.md's "Configuration options" table, plus the ambient
// keys the admin HTTP surface and Postgres store need.

use alloy::primitives::Address;
use std::{env::var, num::ParseIntError};

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the read-only admin HTTP server listens on.
    pub port: u16,

    /// PostgreSQL connection string for the persisted account/channel store.
    pub database_url: String,

    /// Blockchain RPC endpoint.
    pub rpc_url: String,

    /// Chain ID, used only for logging/diagnostics (claims are not EIP-155 typed).
    pub chain_id: u64,

    /// This node's private key (hex, 0x-prefixed). Signs outgoing claims and transactions.
    pub private_key: String,

    /// Address of the payment channel contract.
    pub contract_address: Address,

    /// Default escrow (gwei) when opening an outgoing channel.
    pub outgoing_channel_amount_gwei: u64,

    /// Dispute window (blocks) we impose as sender when opening a channel.
    pub outgoing_dispute_period: u64,

    /// Minimum dispute period (blocks) we accept on an incoming channel.
    pub min_incoming_dispute_period: u64,

    /// Per-PREPARE cap, in gwei.
    pub max_packet_amount_gwei: u64,

    /// Per-peer receivable ceiling, in gwei.
    pub max_balance_gwei: i64,

    /// Channel watcher poll period, in milliseconds.
    pub channel_watcher_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Config {
            port: get_env("PORT")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            database_url: get_env("DATABASE_URL")?,
            rpc_url: get_env("RPC_URL")?,

            chain_id: get_env("CHAIN_ID")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            private_key: get_env("PRIVATE_KEY")?,

            contract_address: get_env("CONTRACT_ADDRESS")?
                .parse()
                .map_err(|e| format!("invalid contract address: {}", e))?,

            outgoing_channel_amount_gwei: get_env("OUTGOING_CHANNEL_AMOUNT_GWEI")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            outgoing_dispute_period: get_env("OUTGOING_DISPUTE_PERIOD")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            min_incoming_dispute_period: get_env("MIN_INCOMING_DISPUTE_PERIOD")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            max_packet_amount_gwei: get_env("MAX_PACKET_AMOUNT_GWEI")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            max_balance_gwei: get_env("MAX_BALANCE_GWEI")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,

            channel_watcher_interval_ms: get_env("CHANNEL_WATCHER_INTERVAL_MS")?
                .parse()
                .map_err(|e: ParseIntError| e.to_string())?,
        })
    }
}

/// Helper function to get an environment variable
///
/// Returns `Result<String, String>`:
/// - `Ok(value)` if the variable exists and is not empty
/// - `Err(message)` if missing or empty
///
/// Why a helper function?
/// - `std::env::var` returns `Result<String, VarError>`
/// - We want to convert that to `Result<String, String>` with a nice message

fn get_env(key: &str) -> Result<String, String> {
    // std::env::var returns Result<String, VarError>
    // .map_err transforms the error type
    // |_| means "ignore the original error, use this message instead"
    var(key).map_err(|_| format!("Missing environment variable: {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn set_minimal_env() {
        env::set_var("PORT", "4001");
        env::set_var("DATABASE_URL", "postgres://x:x@localhost:5432/x");
        env::set_var("RPC_URL", "http://localhost:8545");
        env::set_var("CHAIN_ID", "31337");
        env::set_var(
            "PRIVATE_KEY",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff8",
        );
        env::set_var(
            "CONTRACT_ADDRESS",
            "0x5FbDB2315678afecb367f032d93F642f64180aa",
        );
        env::set_var("OUTGOING_CHANNEL_AMOUNT_GWEI", "1000000");
        env::set_var("OUTGOING_DISPUTE_PERIOD", "100");
        env::set_var("MIN_INCOMING_DISPUTE_PERIOD", "40");
        env::set_var("MAX_PACKET_AMOUNT_GWEI", "10000");
        env::set_var("MAX_BALANCE_GWEI", "1000000");
        env::set_var("CHANNEL_WATCHER_INTERVAL_MS", "60000");
    }

    #[test]
    fn loads_config_from_env() {
        set_minimal_env();
        let config = Config::from_env().expect("should load");
        assert_eq!(config.port, 4001);
        assert_eq!(config.chain_id, 31337);
        assert_eq!(config.outgoing_dispute_period, 100);
        assert_eq!(config.min_incoming_dispute_period, 40);
    }

    #[test]
    fn missing_var_yields_readable_error() {
        env::remove_var("SOME_VAR_THAT_DOES_NOT_EXIST");
        let err = get_env("SOME_VAR_THAT_DOES_NOT_EXIST").unwrap_err();
        assert!(err.contains("SOME_VAR_THAT_DOES_NOT_EXIST"));
    }
}
