//! Check Bitfinex API credentials and connectivity
//!
//! 1. Loads `BFX_API_KEY` / `BFX_API_SECRET` from the environment or `.env`
//! 2. Opens the WebSocket and waits for the version handshake
//! 3. Pings the server
//! 4. Authenticates and prints the granted capabilities

use bfxlink_core::prelude::*;
use bfxlink_exchanges::bitfinex::auth::{API_KEY_VAR, API_SECRET_VAR};
use bfxlink_exchanges::prelude::*;
use std::time::Duration;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[monoio::main(timer_enabled = true)]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("🚀 bfxlink Bitfinex Credentials Test");
    println!("===================================");

    dotenv::dotenv().ok();

    let credentials = match Credentials::from_env() {
        Ok(credentials) if credentials.is_valid() => credentials,
        _ => {
            eprintln!("❌ ERROR: set {API_KEY_VAR} and {API_SECRET_VAR} (a .env file works)");
            anyhow::bail!("missing credentials");
        }
    };

    let key = &credentials.api_key;
    let shown = if key.len() > 12 {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    } else {
        "<short key>".to_string()
    };
    println!("✅ Environment variables loaded");
    println!("   API Key: {shown}");
    println!();

    let session = BitfinexSession::websocket(SessionConfig::default())?;
    session.connect()?;

    println!("🏓 Pinging {}...", session.config().url);
    let started = nanos();
    let pong = monoio::time::timeout(STEP_TIMEOUT, session.ping().wait()).await??;
    println!(
        "✅ Pong cid={} after {:.1}ms (version validated: {})",
        pong.cid,
        (nanos() - started) as f64 / 1_000_000.0,
        session.session_state().version_validated
    );

    println!("🔐 Authenticating...");
    let outcome = session.authenticate(&credentials.api_key, &credentials.api_secret)?;
    match monoio::time::timeout(STEP_TIMEOUT, outcome.wait()).await? {
        Ok(auth) => {
            println!("✅ Authenticated as user {:?}", auth.user_id);
            println!("   Capabilities: {}", auth.caps);
        }
        Err(e) => {
            eprintln!("❌ Authentication failed: {e}");
            session.close();
            return Err(e.into());
        }
    }

    session.close();
    println!();
    println!("🎉 Credentials work");
    Ok(())
}
