//! # Ingestion
//!
//! Event-source side of the pipeline.
//!
//! Responsibilities:
//! - Replayable event logs (`MemoryEventLog`, durable `JsonlEventLog`)
//! - Iterators the dispatcher pulls from: `LiveTail` (follows the log from a
//!   checkpoint) and `HistoricalRange` (bounded `[start, end)` scan)
//! - Data-quality inspection of raw events (logged and counted, never fatal)
//! - Synthetic engagement traffic (`EventGenerator`)
//!
//! ## Usage Example
//!
//! ```ignore
//! use ingestion::{LiveTail, MemoryEventLog};
//!
//! let log = Arc::new(MemoryEventLog::new());
//! let mut tail = LiveTail::new(log.clone(), checkpoint.resume_offset());
//! while let Some(batch) = tail.next_batch(100).await? {
//!     // dispatch batch
//! }
//! ```

mod generator;
mod log;
mod metrics;
mod range;
mod tail;

pub use generator::{EventGenerator, GeneratorConfig};
pub use log::{JsonlEventLog, MemoryEventLog};
pub use metrics::{inspect_record, SourceMetrics, SourceMetricsSnapshot};
pub use range::HistoricalRange;
pub use tail::LiveTail;
