//! Outbound streaming: block sources and the pacing engine

pub mod pacer;
pub mod source;

pub use pacer::{PacketMetadata, Pacer, PacerConfig, SegmentReport, StreamStats};
pub use source::{BlockSource, SweepSource};
