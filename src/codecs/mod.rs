//! Cache codec implementations.
//!
//! Built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec)
//! trait used to turn caller values into the byte payloads the tiers store.

mod json;
pub use json::JsonCodec;
