// store.rs - Persisted key-value store for account and channel data
//
// spec.md §3 names two key families:
//   <accountName>:account            -> serialized PeerAccount snapshot
//   <channelId>:incoming-channel     -> accountName that owns this channel
//
// This is listed as an external collaborator in spec.md §1, but the ambient
// stack still needs a concrete backing store: an upsert pattern over
// sqlx::PgPool, keyed generically instead of per-channel-row, plus an
// in-memory implementation for tests and single-node deployments that
// matches the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::SettlementError;

/// Decimal-string big integers, plain-record channels -- the "dynamic
/// property-bag persistence" the original intercepted on every mutation,
/// replaced here by an explicit snapshot written at the end of each reducer
/// (spec.md §9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountSnapshot {
    pub account_name: String,
    pub receivable_balance_gwei: i64,
    pub payable_balance_gwei: i64,
    pub payout_amount_gwei: i64,
    pub ethereum_address: Option<String>,
    pub outgoing_channel: Option<ChannelSnapshot>,
    pub incoming_channel: Option<ChannelSnapshot>,
}

/// Plain-record channel, decimal-string big integers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub contract_address: String,
    pub sender: String,
    pub receiver: String,
    pub value: String,
    pub dispute_period: u64,
    pub disputed_until: Option<u64>,
    pub spent: String,
    pub signature: Option<String>,
}

/// Persisted key-value store backing account and channel-ownership data.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_account(&self, account_name: &str) -> Result<Option<AccountSnapshot>, SettlementError>;
    async fn put_account(&self, snapshot: &AccountSnapshot) -> Result<(), SettlementError>;
    async fn delete_account(&self, account_name: &str) -> Result<(), SettlementError>;

    /// Returns the account name the given incoming channel id is linked to, if any.
    async fn incoming_channel_owner(&self, channel_id: &str) -> Result<Option<String>, SettlementError>;

    /// Atomically links `channel_id` to `account_name` if unlinked. `ReducerQueue`
    /// serialization only excludes concurrent reducers within one account's own
    /// queue (spec.md §4.1); two different accounts can race this call for the
    /// same `channel_id`, so the insert-or-read must itself be atomic to enforce
    /// at-most-one-owner (spec.md §8 invariant 4).
    ///
    /// Returns `Ok(None)` if `account_name` now owns (or already owned)
    /// `channel_id`, or `Ok(Some(other_owner))` if some other account got
    /// there first.
    async fn link_incoming_channel(&self, channel_id: &str, account_name: &str) -> Result<Option<String>, SettlementError>;
}

/// In-memory `Store`, used by tests and by single-node deployments that
/// don't need cross-restart durability.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    accounts: Arc<RwLock<HashMap<String, AccountSnapshot>>>,
    incoming_links: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_account(&self, account_name: &str) -> Result<Option<AccountSnapshot>, SettlementError> {
        Ok(self.accounts.read().await.get(account_name).cloned())
    }

    async fn put_account(&self, snapshot: &AccountSnapshot) -> Result<(), SettlementError> {
        self.accounts
            .write()
            .await
            .insert(snapshot.account_name.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete_account(&self, account_name: &str) -> Result<(), SettlementError> {
        self.accounts.write().await.remove(account_name);
        Ok(())
    }

    async fn incoming_channel_owner(&self, channel_id: &str) -> Result<Option<String>, SettlementError> {
        Ok(self.incoming_links.read().await.get(channel_id).cloned())
    }

    async fn link_incoming_channel(&self, channel_id: &str, account_name: &str) -> Result<Option<String>, SettlementError> {
        use std::collections::hash_map::Entry;

        let mut links = self.incoming_links.write().await;
        match links.entry(channel_id.to_string()) {
            Entry::Occupied(entry) => {
                let owner = entry.get().clone();
                Ok(if owner == account_name { None } else { Some(owner) })
            }
            Entry::Vacant(entry) => {
                entry.insert(account_name.to_string());
                Ok(None)
            }
        }
    }
}

/// PostgreSQL-backed `Store`, upserted the way a `channels`/`recipients`
/// table pair upserts on conflict.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables if they don't exist. Safe to call on every startup.
    pub async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (\
                account_name TEXT PRIMARY KEY,\
                snapshot JSONB NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS incoming_channel_links (\
                channel_id TEXT PRIMARY KEY,\
                account_name TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_account(&self, account_name: &str) -> Result<Option<AccountSnapshot>, SettlementError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT snapshot FROM accounts WHERE account_name = $1")
                .bind(account_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SettlementError::Store(e.to_string()))?;

        row.map(|(json,)| serde_json::from_value(json).map_err(|e| SettlementError::Store(e.to_string())))
            .transpose()
    }

    async fn put_account(&self, snapshot: &AccountSnapshot) -> Result<(), SettlementError> {
        let json = serde_json::to_value(snapshot).map_err(|e| SettlementError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT INTO accounts (account_name, snapshot) VALUES ($1, $2) \
             ON CONFLICT (account_name) DO UPDATE SET snapshot = EXCLUDED.snapshot",
        )
        .bind(&snapshot.account_name)
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| SettlementError::Store(e.to_string()))?;
        Ok(())
    }

    async fn delete_account(&self, account_name: &str) -> Result<(), SettlementError> {
        sqlx::query("DELETE FROM accounts WHERE account_name = $1")
            .bind(account_name)
            .execute(&self.pool)
            .await
            .map_err(|e| SettlementError::Store(e.to_string()))?;
        Ok(())
    }

    async fn incoming_channel_owner(&self, channel_id: &str) -> Result<Option<String>, SettlementError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT account_name FROM incoming_channel_links WHERE channel_id = $1")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SettlementError::Store(e.to_string()))?;
        Ok(row.map(|(name,)| name))
    }

    async fn link_incoming_channel(&self, channel_id: &str, account_name: &str) -> Result<Option<String>, SettlementError> {
        sqlx::query(
            "INSERT INTO incoming_channel_links (channel_id, account_name) VALUES ($1, $2) \
             ON CONFLICT (channel_id) DO NOTHING",
        )
        .bind(channel_id)
        .bind(account_name)
        .execute(&self.pool)
        .await
        .map_err(|e| SettlementError::Store(e.to_string()))?;

        match self.incoming_channel_owner(channel_id).await? {
            Some(owner) if owner == account_name => Ok(None),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_round_trips_account_snapshot() {
        let store = InMemoryStore::new();
        let snapshot = AccountSnapshot {
            account_name: "alice".into(),
            receivable_balance_gwei: 100,
            payable_balance_gwei: -5,
            payout_amount_gwei: 0,
            ethereum_address: Some("0xabc".into()),
            outgoing_channel: None,
            incoming_channel: None,
        };
        store.put_account(&snapshot).await.unwrap();
        let fetched = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(fetched, snapshot);

        store.delete_account("alice").await.unwrap();
        assert!(store.get_account("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_store_enforces_single_reader_view_of_channel_link() {
        let store = InMemoryStore::new();
        assert!(store.incoming_channel_owner("0x01").await.unwrap().is_none());
        assert_eq!(store.link_incoming_channel("0x01", "alice").await.unwrap(), None);
        assert_eq!(
            store.incoming_channel_owner("0x01").await.unwrap(),
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn in_memory_store_rejects_second_owner_of_same_channel() {
        let store = InMemoryStore::new();
        assert_eq!(store.link_incoming_channel("0x01", "alice").await.unwrap(), None);
        assert_eq!(
            store.link_incoming_channel("0x01", "bob").await.unwrap(),
            Some("alice".to_string())
        );
        assert_eq!(
            store.incoming_channel_owner("0x01").await.unwrap(),
            Some("alice".to_string())
        );
    }

    #[tokio::test]
    async fn in_memory_store_link_is_idempotent_for_the_same_owner() {
        let store = InMemoryStore::new();
        assert_eq!(store.link_incoming_channel("0x01", "alice").await.unwrap(), None);
        assert_eq!(store.link_incoming_channel("0x01", "alice").await.unwrap(), None);
    }
}
