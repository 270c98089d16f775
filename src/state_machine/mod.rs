//! statig state machines.

pub mod connection_sm;
