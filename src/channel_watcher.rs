// channel_watcher.rs - periodic per-account dispute detection
//
// spec.md §4.6: started lazily once an incoming claim is linked, polls the
// chain on a timer, and schedules claimIfProfitable when it finds the
// cached channel disputed. Grounded on the reference balance service's
// `tokio::select!`-driven background task shape, simplified here to a plain
// `tokio::time::interval` loop since there is no secondary wakeup source.

use std::time::Duration;

use crate::model::ClaimablePaymentChannel;
use crate::peer_account::{PeerAccount, PRIORITY_CHANNEL_WATCHER};

pub async fn run(account: PeerAccount, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.tick().await; // first tick fires immediately

    loop {
        ticker.tick().await;

        let contract = account.contract();
        let handle = account
            .incoming
            .add(PRIORITY_CHANNEL_WATCHER, move |cached: Option<ClaimablePaymentChannel>| {
                let contract = contract.clone();
                async move { tick_reducer(cached, contract).await }
            });

        let result = match handle.await {
            Ok(r) => r,
            Err(_) => break, // queue gone, account likely unloaded
        };

        match result {
            Ok(None) => break,
            Ok(Some(channel)) => match account.contract().current_block().await {
                Ok(block) if channel.is_disputed(block) => {
                    account.schedule_claim_if_profitable(true, None);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(account = %account.account_name, error = %e, "channel watcher could not read current block"),
            },
            Err(e) => tracing::debug!(account = %account.account_name, error = %e, "channel watcher reduction failed"),
        }
    }

    account.watcher_finished().await;
}

async fn tick_reducer(
    cached: Option<ClaimablePaymentChannel>,
    contract: std::sync::Arc<dyn crate::contract::ChannelContract>,
) -> Result<Option<ClaimablePaymentChannel>, crate::error::SettlementError> {
    let channel = match cached {
        Some(c) => c,
        None => return Ok(None),
    };
    match contract.fetch(channel.channel_id).await? {
        None => Ok(None),
        Some(chain) => Ok(Some(crate::model::PaymentChannel::from_on_chain(
            channel.channel_id,
            channel.contract_address,
            &chain,
            channel.spent,
            channel.signature,
        ))),
    }
}
