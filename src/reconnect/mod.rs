//! Reconnect delay policy for the shared connection

mod policy;

pub use policy::ReconnectPolicy;
