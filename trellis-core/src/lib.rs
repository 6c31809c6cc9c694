//! Shared vocabulary for the trellis coordination service.
//!
//! This crate defines everything the server and its collaborators agree on:
//! the request/response protocol types, the fixed error-code enumeration,
//! revision sentinels, glob compilation for tree addressing, the framed
//! postcard codec, and the trait contracts for the replicated store and the
//! consensus proposer.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod glob;
pub mod ops;
pub mod proposer;
pub mod proto;
pub mod store;

pub use codec::PostcardCodec;
pub use glob::{BadPathError, Glob, check_path};
pub use proposer::{ProposeError, Proposer};
pub use proto::{ErrCode, Request, Response, Verb, flags};
pub use store::{CLOBBER, DIR, Event, EventKind, Getter, MISSING, Store, StoreError};
