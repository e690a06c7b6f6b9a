//! Pipeline Processing Module
//!
//! Conversion of inbound envelopes into points and size/time batching of
//! those points on their way to storage.

pub mod batcher;
pub mod converter;

pub use batcher::{BatcherConfig, BatcherStatsSnapshot, PointBatcher, PointSubmitter};
pub use converter::PointConverter;
