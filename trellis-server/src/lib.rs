//! Server side of the trellis coordination service.
//!
//! A [`Server`] owns the store and proposer handles and accepts connections;
//! each connection runs a [`conn::Conn`] multiplexer that carries many
//! simultaneous, independently cancellable operations over one socket.

#![warn(clippy::pedantic)]

pub mod conn;
mod server;

pub use conn::{Conn, ConnError, Poisoned};
pub use server::Server;
