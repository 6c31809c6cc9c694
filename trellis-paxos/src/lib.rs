//! Consensus acceptor role.
//!
//! An acceptor is the per-node unit of agreement: it answers round
//! invitations with binding promises and never honors a round lower than or
//! equal to one it has already promised. The nomination/commit phase of a
//! full consensus node travels a separate path and is not handled here.

#![warn(clippy::pedantic)]

mod acceptor;

pub use acceptor::{AcceptorState, run};
