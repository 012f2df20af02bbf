//! Shared realtime connection for analysis events.
//!
//! Many consumers receive server-pushed events over topics while sharing a
//! single STOMP-over-WebSocket connection. The connection is reference
//! counted, closed after a grace period once nobody needs it, and
//! re-established with bounded backoff when it drops.

// Infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod transport;

// Core
pub mod connection;
pub mod reconnect;
pub mod subscription;

// Consumer surface
pub mod analysis;
pub mod client;

pub use client::{ConnectionLease, RealtimeClient};
pub use error::{RealtimeError, Result};
