//! Infrastructure-backed lifecycle buses.
//!
//! The bus abstraction lives in `warden-events` as pure mechanics; this
//! module provides durable implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus};
