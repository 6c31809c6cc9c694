//! Request/response protocol types.
//!
//! Every frame on the wire is one [`Request`] or one [`Response`], postcard
//! encoded inside a length-delimited frame (see [`crate::codec`]). Responses
//! are correlated to requests by the client-assigned `tag`; one request may
//! produce many response frames, and the frame carrying [`flags::DONE`] is
//! always the last one for its tag.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Response flag bits.
pub mod flags {
    /// The frame carries data and may be followed by more frames.
    pub const VALID: u32 = 1;
    /// The terminal frame for this tag.
    pub const DONE: u32 = 2;
    /// Watch/walk event subtype: the path was set.
    pub const SET: u32 = 4;
    /// Watch event subtype: the path was deleted.
    pub const DEL: u32 = 8;
}

/// Request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Cancel,
    Del,
    Get,
    Getdir,
    Nop,
    Rev,
    Set,
    Stat,
    Walk,
    Watch,
}

impl Verb {
    /// The wire code for this verb.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Verb::Cancel => 1,
            Verb::Del => 2,
            Verb::Get => 3,
            Verb::Getdir => 4,
            Verb::Nop => 5,
            Verb::Rev => 6,
            Verb::Set => 7,
            Verb::Stat => 8,
            Verb::Walk => 9,
            Verb::Watch => 10,
        }
    }
}

/// The wire carried a verb code we do not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownVerb(pub u32);

impl std::fmt::Display for UnknownVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown verb code {}", self.0)
    }
}

impl std::error::Error for UnknownVerb {}

impl TryFrom<u32> for Verb {
    type Error = UnknownVerb;

    fn try_from(code: u32) -> Result<Self, UnknownVerb> {
        Ok(match code {
            1 => Verb::Cancel,
            2 => Verb::Del,
            3 => Verb::Get,
            4 => Verb::Getdir,
            5 => Verb::Nop,
            6 => Verb::Rev,
            7 => Verb::Set,
            8 => Verb::Stat,
            9 => Verb::Walk,
            10 => Verb::Watch,
            other => return Err(UnknownVerb(other)),
        })
    }
}

/// Fixed error vocabulary carried in [`Response::err_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    BadPath,
    MissingArg,
    TagInUse,
    IsDir,
    NotDir,
    NoEnt,
    TooLate,
    RevMismatch,
    Redirect,
    UnknownVerb,
    Other,
}

/// One client request frame.
///
/// The verb travels as its wire code so an unrecognized verb still decodes
/// and can be answered with [`ErrCode::UnknownVerb`] instead of killing the
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub tag: u32,
    pub verb: u32,
    pub path: Option<String>,
    pub value: Option<Bytes>,
    pub rev: Option<i64>,
    pub offset: Option<i32>,
    pub limit: Option<i32>,
    /// Target tag for the cancel verb.
    pub other_tag: Option<u32>,
}

impl Request {
    #[must_use]
    pub fn new(tag: u32, verb: Verb) -> Self {
        Request {
            tag,
            verb: verb.code(),
            ..Request::default()
        }
    }
}

/// One server response frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub tag: u32,
    pub flags: u32,
    pub err_code: Option<ErrCode>,
    pub err_detail: Option<String>,
    pub path: Option<String>,
    pub value: Option<Bytes>,
    pub rev: Option<i64>,
    pub len: Option<i32>,
}

impl Response {
    /// A response carrying only an error code.
    #[must_use]
    pub fn err(code: ErrCode) -> Self {
        Response {
            err_code: Some(code),
            ..Response::default()
        }
    }

    /// A generic wrapped error carrying the underlying message.
    #[must_use]
    pub fn other(detail: impl Into<String>) -> Self {
        Response {
            err_code: Some(ErrCode::Other),
            err_detail: Some(detail.into()),
            ..Response::default()
        }
    }

    /// A redirect pointing the client at a writable address.
    #[must_use]
    pub fn redirect(addr: impl Into<String>) -> Self {
        Response {
            err_code: Some(ErrCode::Redirect),
            err_detail: Some(addr.into()),
            ..Response::default()
        }
    }

    /// A success response carrying a revision.
    #[must_use]
    pub fn with_rev(rev: i64) -> Self {
        Response {
            rev: Some(rev),
            ..Response::default()
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.flags & flags::DONE != 0
    }
}
