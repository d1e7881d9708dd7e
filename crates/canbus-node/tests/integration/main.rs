//! Integration tests for canbus-node: a served node and client stations on
//! a loopback UDP bus.
//!
//! Run with: cargo test -p canbus-node --test integration

mod harness;
mod udp;
