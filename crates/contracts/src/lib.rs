//! # Contracts
//!
//! Frozen interface contracts shared by every pipeline crate: the event data
//! model, delivery bookkeeping types, the configuration blueprint and the
//! traits that sit at crate seams. Business crates depend on this crate only;
//! reverse dependencies are prohibited.
//!
//! ## Offset Model
//! - Every `RawEvent` occupies a `SourceOffset` (0-based position in the log)
//! - A checkpoint is the highest offset below which every event is terminal
//!   at every sink

mod blueprint;
mod checkpoint;
mod content;
mod delivery;
mod enriched;
mod error;
mod event;
mod reference;
mod sink;
mod source;

pub use blueprint::*;
pub use checkpoint::*;
pub use content::*;
pub use delivery::*;
pub use enriched::*;
pub use error::*;
pub use event::*;
pub use reference::{LocalReferenceSource, ReferenceSource};
pub use sink::{LocalSinkWriter, SinkWriter};
pub use source::{EventLog, EventSource, LocalEventLog, LocalEventSource};
