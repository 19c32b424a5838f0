//! Network delivery.
mod client;
pub use self::client::{Delivery, DeliveryError, IngestClient};

pub mod retry;
pub mod transport;
