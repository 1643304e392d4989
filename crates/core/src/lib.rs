//! # bfxlink Core
//!
//! Runtime and utility layer shared by the bfxlink session engine.
//!
//! ## Architecture Principles
//!
//! 1. **Single-threaded async with monoio** - dispatch and handlers never run in parallel
//! 2. **Wall-clock timing** - microsecond nonces, millisecond correlation ids
//! 3. **Unified logging** - `tracing` everywhere, ftlog as an optional backend
//! 4. **Cheap unique ids** - nanoid tags for connection attempts

pub mod id_gen;
pub mod logging;
pub mod runtime;
pub mod timing;

// Re-export commonly used items
pub use id_gen::{CorrelationIdGenerator, SequenceGenerator, generate_id, generate_id_with_prefix};
pub use logging::init_logging;
pub use runtime::{EngineRuntime, RuntimeConfig, run_engine};
pub use timing::{PerfTimer, Timestamp, micros, millis, nanos};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::id_gen::{CorrelationIdGenerator, SequenceGenerator, generate_id, generate_id_with_prefix};
    pub use crate::logging::init_logging;
    pub use crate::runtime::{EngineRuntime, RuntimeConfig, run_engine};
    pub use crate::timing::{PerfTimer, Timestamp, micros, millis, nanos};

    pub use chrono::{DateTime, Utc};
    pub use monoio;
    pub use serde::{Deserialize, Serialize};
}
