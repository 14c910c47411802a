//! Textual framing codec.
//!
//! Wire format, one frame per UTF-8 string:
//!
//! ```text
//! <type-digit>["$" <id>]["~" <percent-encoded-path>] "|" [<json-body>]
//! ```
//!
//! Encoding is total. Decoding is strict: any violation of the framing or
//! per-type structural rules yields [`ParserError`] rather than a partially
//! populated frame. The codec performs no side effects.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde_json::Value;
use thiserror::Error;

/// Current protocol version, carried in every [`Frame::Welcome`].
pub const PROTOCOL_VERSION: u32 = 3;

const MAX_ID_LEN: usize = 32;
const MAX_PATH_LEN: usize = 1024;

/// Characters that must be percent-encoded in a frame's path segment.
///
/// `~` and `|` double as frame delimiters and so are escaped even though
/// they are otherwise unreserved.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

/// A bounded opaque ASCII token used for invoke/reply correlation.
///
/// Matches `[A-Za-z0-9-]{1,32}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvokeId(String);

impl InvokeId {
    /// Construct an [`InvokeId`], validating length and character set.
    ///
    /// # Errors
    ///
    /// Returns [`ParserError::InvalidId`] if `raw` is empty, longer than 32
    /// characters, or contains a character outside `[A-Za-z0-9-]`.
    pub fn new(raw: impl Into<String>) -> Result<Self, ParserError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_ID_LEN {
            return Err(ParserError::InvalidId);
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(ParserError::InvalidId);
        }
        Ok(Self(raw))
    }

    /// Borrow the underlying token.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for InvokeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// A URI-style path, `/`-prefixed and bounded to 1024 characters after
/// percent-decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(String);

impl Path {
    /// Construct a [`Path`] from an already percent-decoded string.
    ///
    /// # Errors
    ///
    /// Returns [`ParserError::InvalidPath`] if `raw` is empty, does not
    /// start with `/`, or exceeds 1024 characters.
    pub fn new(raw: impl Into<String>) -> Result<Self, ParserError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_PATH_LEN || !raw.starts_with('/') {
            return Err(ParserError::InvalidPath);
        }
        Ok(Self(raw))
    }

    /// Borrow the decoded path string.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// A decoded wire-level message.
///
/// `ParserError` is deliberately not a variant here: it is a decode failure,
/// not a frame, and is never transmitted (spec reserves type digit `11` for
/// it but it never appears on the wire).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// First frame sent on any new connection, carrying the protocol version.
    Welcome {
        /// Protocol version understood by the server.
        version: u32,
    },
    /// Client request naming a path and carrying optional JSON data.
    Invoke {
        /// Correlation id echoed in the eventual `Result`/`Error` reply.
        id: InvokeId,
        /// Target path.
        path: Path,
        /// Optional request payload.
        data: Option<Value>,
    },
    /// Successful reply to an `Invoke`.
    Result {
        /// Correlation id matching the originating `Invoke`.
        id: InvokeId,
        /// Optional result payload.
        data: Option<Value>,
    },
    /// Failed reply to an `Invoke`.
    Error {
        /// Correlation id matching the originating `Invoke`.
        id: InvokeId,
        /// Optional error payload.
        data: Option<Value>,
    },
    /// One-way server-to-client message on a path.
    Publish {
        /// Path the message was published on.
        path: Path,
        /// Optional message payload.
        data: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    Welcome = 0,
    Invoke = 1,
    Result = 2,
    Error = 3,
    Publish = 4,
}

impl FrameType {
    const fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Self::Welcome),
            1 => Some(Self::Invoke),
            2 => Some(Self::Result),
            3 => Some(Self::Error),
            4 => Some(Self::Publish),
            _ => None,
        }
    }

    const fn digit(self) -> u8 {
        match self {
            Self::Welcome => 0,
            Self::Invoke => 1,
            Self::Result => 2,
            Self::Error => 3,
            Self::Publish => 4,
        }
    }
}

/// Reason a wire string failed to decode into a [`Frame`].
///
/// Always leads to connection close; the raw offending message is reported
/// separately (see [`crate::server::ServerEvent::ParserError`]) for
/// diagnostics, since this type carries only the reason.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParserError {
    /// Frame was too short to contain a type digit and a separator.
    #[error("frame too short")]
    TooShort,
    /// First character was not a recognized type digit.
    #[error("unknown frame type")]
    UnknownType,
    /// `id` section was empty or exceeded 32 characters, or had bad characters.
    #[error("invalid id")]
    InvalidId,
    /// `path` section was empty, exceeded 1024 characters, or lacked a leading `/`.
    #[error("invalid path")]
    InvalidPath,
    /// The mandatory `|` header/body separator was absent.
    #[error("missing frame separator")]
    MissingSeparator,
    /// The body portion failed to parse as JSON.
    #[error("invalid json body")]
    InvalidBody,
    /// Per-type structural validation failed (wrong combination of id/path).
    #[error("structural mismatch: {0}")]
    StructuralMismatch(&'static str),
}

/// Encode a frame onto the wire. Total: this function never fails.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    match frame {
        Frame::Welcome { version } => encode_parts(FrameType::Welcome, None, None, Some(&Value::from(*version))),
        Frame::Invoke { id, path, data } => {
            encode_parts(FrameType::Invoke, Some(id), Some(path), data.as_ref())
        }
        Frame::Result { id, data } => encode_parts(FrameType::Result, Some(id), None, data.as_ref()),
        Frame::Error { id, data } => encode_parts(FrameType::Error, Some(id), None, data.as_ref()),
        Frame::Publish { path, data } => {
            encode_parts(FrameType::Publish, None, Some(path), data.as_ref())
        }
    }
}

fn encode_parts(ty: FrameType, id: Option<&InvokeId>, path: Option<&Path>, data: Option<&Value>) -> String {
    let mut out = String::new();
    out.push(char::from(b'0' + ty.digit()));
    if let Some(id) = id {
        out.push('$');
        out.push_str(id.as_str());
    }
    if let Some(path) = path {
        out.push('~');
        out.push_str(&utf8_percent_encode(path.as_str(), PATH_ENCODE_SET).to_string());
    }
    out.push('|');
    if let Some(data) = data {
        out.push_str(&data.to_string());
    }
    out
}

/// Decode a wire string into a [`Frame`].
///
/// # Errors
///
/// Returns a [`ParserError`] describing the first validation rule violated;
/// see module documentation for the complete list of rejected inputs.
pub fn decode(s: &str) -> Result<Frame, ParserError> {
    if s.len() < 2 {
        return Err(ParserError::TooShort);
    }
    let mut chars = s.chars();
    let first = chars.next().ok_or(ParserError::TooShort)?;
    let digit = first.to_digit(10).ok_or(ParserError::UnknownType)?;
    let ty = FrameType::from_digit(u8::try_from(digit).map_err(|_| ParserError::UnknownType)?)
        .ok_or(ParserError::UnknownType)?;

    let rest = chars.as_str();
    let sep_pos = rest.find('|').ok_or(ParserError::MissingSeparator)?;
    let (header, body_with_sep) = rest.split_at(sep_pos);
    let body_str = body_with_sep.strip_prefix('|').ok_or(ParserError::MissingSeparator)?;

    let (id_part, path_part) = split_header(header)?;

    let id = id_part.map(InvokeId::new).transpose()?;
    let path = path_part.map(decode_path).transpose()?;

    let data = if body_str.is_empty() {
        None
    } else {
        Some(serde_json::from_str::<Value>(body_str).map_err(|_| ParserError::InvalidBody)?)
    };

    build_typed_frame(ty, id, path, data)
}

fn decode_path(encoded: &str) -> Result<Path, ParserError> {
    let decoded = percent_decode_str(encoded)
        .decode_utf8()
        .map_err(|_| ParserError::InvalidPath)?;
    Path::new(decoded.into_owned())
}

/// Split the `$id~path` header section. Returns raw (still percent-encoded
/// for path) substrings; `$`/`~` may appear in any present combination but
/// `$` must precede `~` when both are present, matching the wire grammar.
fn split_header(header: &str) -> Result<(Option<&str>, Option<&str>), ParserError> {
    if header.is_empty() {
        return Ok((None, None));
    }
    if let Some(rest) = header.strip_prefix('$') {
        if let Some(tilde) = rest.find('~') {
            let (id, path_with_sep) = rest.split_at(tilde);
            let path = path_with_sep.strip_prefix('~').ok_or(ParserError::MissingSeparator)?;
            Ok((Some(id), Some(path)))
        } else {
            Ok((Some(rest), None))
        }
    } else if let Some(path) = header.strip_prefix('~') {
        Ok((None, Some(path)))
    } else {
        Err(ParserError::MissingSeparator)
    }
}

fn build_typed_frame(
    ty: FrameType,
    id: Option<InvokeId>,
    path: Option<Path>,
    data: Option<Value>,
) -> Result<Frame, ParserError> {
    match ty {
        FrameType::Welcome => {
            if id.is_some() {
                return Err(ParserError::StructuralMismatch("welcome forbids id"));
            }
            if path.is_some() {
                return Err(ParserError::StructuralMismatch("welcome forbids path"));
            }
            let version = data
                .as_ref()
                .and_then(Value::as_u64)
                .ok_or(ParserError::StructuralMismatch("welcome requires integer version body"))?;
            let version = u32::try_from(version)
                .map_err(|_| ParserError::StructuralMismatch("welcome version out of range"))?;
            Ok(Frame::Welcome { version })
        }
        FrameType::Invoke => {
            let id = id.ok_or(ParserError::StructuralMismatch("invoke requires id"))?;
            let path = path.ok_or(ParserError::StructuralMismatch("invoke requires path"))?;
            Ok(Frame::Invoke { id, path, data })
        }
        FrameType::Result => {
            let id = id.ok_or(ParserError::StructuralMismatch("result requires id"))?;
            if path.is_some() {
                return Err(ParserError::StructuralMismatch("result forbids path"));
            }
            Ok(Frame::Result { id, data })
        }
        FrameType::Error => {
            let id = id.ok_or(ParserError::StructuralMismatch("error requires id"))?;
            if path.is_some() {
                return Err(ParserError::StructuralMismatch("error forbids path"));
            }
            Ok(Frame::Error { id, data })
        }
        FrameType::Publish => {
            if id.is_some() {
                return Err(ParserError::StructuralMismatch("publish forbids id"));
            }
            let path = path.ok_or(ParserError::StructuralMismatch("publish requires path"))?;
            Ok(Frame::Publish { path, data })
        }
    }
}
