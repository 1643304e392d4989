//! monoio runtime bootstrap
//!
//! The session engine is single-threaded: frame dispatch, expectation
//! registration and handler execution all run on the thread driving this
//! runtime. Timers are always enabled because the WebSocket pump polls its
//! outbound queue on a timeout.

use monoio::{FusionDriver, RuntimeBuilder};
use std::future::Future;
use std::io;
use tracing::info;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Thread name used in log output
    pub thread_name: String,
    /// io_uring submission queue entries
    pub entries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "bfxlink-main".to_string(),
            entries: 256,
        }
    }
}

/// Single-threaded runtime hosting a session and its transport
pub struct EngineRuntime {
    config: RuntimeConfig,
}

impl EngineRuntime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Build the runtime and drive `f` to completion on the current thread.
    pub fn start<F, Fut>(self, f: F) -> io::Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        info!("▶️  Starting runtime on {}", self.config.thread_name);
        let mut runtime = RuntimeBuilder::<FusionDriver>::new()
            .with_entries(self.config.entries)
            .enable_timer()
            .build()?;
        let result = runtime.block_on(f());
        info!("⏹️  Runtime on {} stopped", self.config.thread_name);
        Ok(result)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Default for EngineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` on a default [`EngineRuntime`]
pub fn run_engine<F, Fut>(f: F) -> io::Result<Fut::Output>
where
    F: FnOnce() -> Fut,
    Fut: Future,
{
    EngineRuntime::new().start(f)
}
