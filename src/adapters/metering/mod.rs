//! Metering API adapters.

pub mod http_client;
pub mod memory;
pub mod models;

pub use http_client::HttpMeteringClient;
pub use memory::InMemoryMeteringClient;
