pub mod extractor;
pub mod handler;
pub mod record;
pub mod writer;

#[cfg(feature = "queue")]
pub mod queue;

pub use extractor::{ExtractError, MetricsExtractor};
pub use handler::{LogOutcome, PerformanceMetrics, Stage};
pub use record::{MetricRecord, ParsedRecord, MAX_LINE_LEN, PEER_ABSENT};
pub use writer::{AppendFileSink, LockedAppendFileSink, RecordSink, SinkError};
