//! Encoding and network delivery of metric point batches.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod compression;
pub mod encoding;
pub mod net;
