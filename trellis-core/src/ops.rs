//! Mutation command encoding.
//!
//! Commands travel through consensus as opaque bytes; this module is the one
//! place that knows their shape. A set is `"{rev}:{path}={value}"`, a delete
//! is `"{rev}:{path}"`, and the no-op that only advances the log is `"nop"`.
//! Paths cannot contain `:` or `=`, so the value may hold arbitrary bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// The no-op command.
pub const NOP: &[u8] = b"nop";

/// Encode a set command.
#[must_use]
pub fn set(path: &str, value: &[u8], rev: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(path.len() + value.len() + 24);
    buf.put_slice(format!("{rev}:{path}=").as_bytes());
    buf.put_slice(value);
    buf.freeze()
}

/// Encode a delete command.
#[must_use]
pub fn del(path: &str, rev: i64) -> Bytes {
    Bytes::from(format!("{rev}:{path}"))
}

/// A decoded mutation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Set {
        path: String,
        value: Bytes,
        rev: i64,
    },
    Del {
        path: String,
        rev: i64,
    },
    Nop,
}

/// A command that does not decode as any known mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadMutationError;

impl fmt::Display for BadMutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bad mutation")
    }
}

impl std::error::Error for BadMutationError {}

/// Decode a mutation command.
///
/// # Errors
///
/// Returns [`BadMutationError`] if the bytes do not follow the command
/// shape.
pub fn parse(cmd: &[u8]) -> Result<Op, BadMutationError> {
    if cmd == NOP {
        return Ok(Op::Nop);
    }

    let colon = cmd.iter().position(|&b| b == b':').ok_or(BadMutationError)?;
    let rev = std::str::from_utf8(&cmd[..colon])
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(BadMutationError)?;

    let rest = &cmd[colon + 1..];
    match rest.iter().position(|&b| b == b'=') {
        Some(eq) => {
            let path = std::str::from_utf8(&rest[..eq])
                .map_err(|_| BadMutationError)?
                .to_owned();
            Ok(Op::Set {
                path,
                value: Bytes::copy_from_slice(&rest[eq + 1..]),
                rev,
            })
        }
        None => {
            let path = std::str::from_utf8(rest)
                .map_err(|_| BadMutationError)?
                .to_owned();
            Ok(Op::Del { path, rev })
        }
    }
}
