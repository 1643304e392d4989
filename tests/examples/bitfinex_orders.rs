//! Authenticated order placement on Bitfinex
//!
//! Reads `BFX_API_KEY` / `BFX_API_SECRET` (a `.env` file works), signs in,
//! then places a small post-only limit order far below the market and a
//! batch of two more. Use a sub-account with a tiny balance.

use bfxlink_core::prelude::*;
use bfxlink_exchanges::prelude::*;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{error, info, warn};

#[monoio::main(timer_enabled = true)]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    info!("🚀 bfxlink Bitfinex order demo");

    let config = match SessionConfig::default().with_env_credentials() {
        Ok(config) => {
            info!("✅ API credentials loaded");
            config
        }
        Err(e) => {
            error!("❌ Failed to load API credentials: {}", e);
            return Err(e.into());
        }
    };

    let session = BitfinexSession::websocket(config)?;
    session.on_account_event(|frame| {
        if let ChannelPayload::Message { tag, .. } = &frame.payload {
            info!("👤 Account update: {}", tag);
        }
    });
    session.connect()?;

    let auth = session.authenticate_with_config()?.wait().await?;
    info!("🔐 Authenticated as user {:?}", auth.user_id);

    let order = OrderRequest::limit("tBTCUSD", Decimal::new(1, 4), Decimal::new(1_000, 0)).with_post_only(true);
    match session.place_order(order)?.wait().await {
        Ok(ack) => info!("✅ Order accepted: {} (order id {:?})", ack.text, ack.order.as_ref().and_then(|o| o.id)),
        Err(e) => warn!("⚠️  Order failed: {}", e),
    }

    let batch = vec![
        OrderRequest::limit("tBTCUSD", Decimal::new(1, 4), Decimal::new(1_100, 0)),
        OrderRequest::limit("tBTCUSD", Decimal::new(1, 4), Decimal::new(1_200, 0)),
    ];
    match monoio::time::timeout(Duration::from_secs(10), session.place_orders(batch)?.wait()).await {
        Ok(Ok(responses)) => {
            for response in responses {
                info!("✅ Batch order {:?}: {}", response.correlation_id(), response.status);
            }
        }
        Ok(Err(e)) => warn!("⚠️  Batch failed: {}", e),
        Err(_) => warn!("⚠️  Batch not acknowledged within 10s"),
    }

    session.close();
    Ok(())
}
