//! Core data model for the sluice delivery pipeline.
//!
//! This crate holds the types that every other layer shares: the [`metric::MetricPoint`] value itself, cumulative
//! histogram snapshots and their delta transform, and the bounded [`buffer`] that sits between producing threads and
//! the background batcher.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod buffer;
pub mod metric;
