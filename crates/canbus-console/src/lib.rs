//! Canbus Console -- reliable requests and remote console sessions.
//!
//! `TransactionClient` turns the lossy transport into request/reply with
//! bounded retry. `Console` drives one remote console on top of it.

pub mod escape;
pub mod session;
pub mod staging;
pub mod transaction;

pub use escape::{EscapeCommand, EscapeFilter};
pub use session::{Console, ConsoleError, ConsoleEvent, ConsoleHandle, ConsoleOptions, ConsoleState};
pub use staging::{run_ack_pump, AckStaging};
pub use transaction::{Outcome, TransactionClient, TransactionError, TransactionPolicy};
