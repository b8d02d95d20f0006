// admin.rs - read-only HTTP introspection surface
//
// Thin-handler-calls-into-state shape with a `/health` route, but every
// route here only reads persisted state through `Store` -- this engine's
// mutating operations are driven by BTP/ILP traffic through AccountRouter,
// not HTTP (spec.md §1 lists the plugin shell, not an admin API, as the
// request surface).

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::error::SettlementError;
use crate::store::{AccountSnapshot, Store};
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<dyn Store>,
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/accounts/:name", get(get_account))
        .route("/channels/:channel_id/owner", get(get_channel_owner))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn get_account(
    Path(account_name): Path<String>,
    State(state): State<AdminState>,
) -> Result<Json<AccountSnapshot>, SettlementError> {
    let account = state
        .store
        .get_account(&account_name)
        .await?
        .ok_or_else(|| SettlementError::AccountNotFound(account_name))?;
    Ok(Json(account))
}

async fn get_channel_owner(
    Path(channel_id): Path<String>,
    State(state): State<AdminState>,
) -> Result<Json<Option<String>>, SettlementError> {
    let owner = state.store.incoming_channel_owner(&channel_id).await?;
    Ok(Json(owner))
}
