//! The shared connection: reference counting, grace-period teardown and
//! reconnection.

mod manager;
mod state;

pub(crate) use manager::{ConnectionManager, Request};
pub use state::{ConnectionMachine, ConnectionState, Effect};
