//! Integration tests for canbus-console on the in-memory bus.
//!
//! Run with: cargo test -p canbus-console --test integration

mod harness;
mod connect;
mod session;
