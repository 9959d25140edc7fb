//! Sleepwatch - Per-device sleep anomaly detection over sleep-tracker APIs
//!
//! Sleepwatch pulls nightly summaries from a sleep tracker account and flags
//! unusual nights for every device through a deterministic pipeline:
//! vendor fetch (cached per day) → preprocessing → isolation-forest scoring
//! → packaging and optional alerting.
//!
//! ## Modules
//!
//! - **Plugins**: Emfit QS, Oura Ring and Eight Sleep behind one [`TrackerPlugin`] trait
//! - **Cache**: TTL-aware per-day store of raw vendor samples
//! - **Model**: Seeded isolation forest refit on every run
//! - **Orchestrator**: Multi-device run with per-device failure isolation

pub mod cache;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod plugins;
pub mod preprocess;
pub mod resolver;
pub mod stats;
pub mod types;

pub use cache::{CacheStore, FileStore, KeyValueStore, MemoryStore};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::DetectorConfig;
pub use error::{DetectorError, ErrorKind};
pub use model::AnomalyModel;
pub use orchestrator::Orchestrator;
pub use plugins::{create_plugin, Session, TrackerPlugin};
pub use preprocess::{FeatureMatrix, Preprocessor};
pub use resolver::DeviceResolver;
pub use types::{
    AnomalyResult, AnomalySource, DeviceDescriptor, DeviceReport, DeviceRunResult, FeatureRow,
    RawSample, RunReport, Stage, Vendor,
};

/// Sleepwatch version reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
