//! Canbus Objects -- handlers for objects addressed to the local node.
//!
//! The dispatcher runs on the transport's delivery task, one packet at a
//! time, so handlers never race each other. Each handler answers with at
//! most one ACK or NAK. Unknown objects and request types a handler does not
//! declare are ignored, never NAKed.

pub mod console_port;
pub mod dispatcher;
pub mod handlers;
pub mod heartbeat;
pub mod tables;

pub use console_port::ConsolePort;
pub use dispatcher::{Dispatcher, ObjectHandler, Reply};
pub use heartbeat::{run_heartbeat_loop, HeartbeatConfig, HeartbeatValue};
