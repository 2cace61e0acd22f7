pub mod config;
pub mod context;
pub mod error;

pub use config::{MetricsConfig, PerfConfig, ResolvedScope, ScopeTable};
pub use context::{Clock, FrozenClock, LogContext, RequestSnapshot, SystemClock};
pub use error::PerfError;
