//! Error types for wxweb-client.
//!
//! One enum per operation family, each wrapping the transport-level
//! [`RequestError`]. Retry policy lives with callers; the taxonomy here only
//! classifies: [`RequestError`] and [`GatewayError::ApiResponse`] are safe to
//! retry, [`GatewayError::SessionExpired`] requires a fresh authentication,
//! everything else is terminal or a caller bug.

use std::fmt;

use wxweb_proto::CodecError;

// ─── RequestError ─────────────────────────────────────────────────────────────

/// A network-level failure: connect, timeout, TLS, or reading the body.
///
/// Deliberately opaque — every underlying HTTP failure collapses into this
/// one retryable shape.
#[derive(Debug)]
pub struct RequestError {
    message: String,
}

impl RequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request failed: {}", self.message)
    }
}

impl std::error::Error for RequestError {}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        Self::new(e.to_string())
    }
}

// ─── GatewayError ─────────────────────────────────────────────────────────────

/// The error type returned from any endpoint operation.
#[derive(Debug)]
pub enum GatewayError {
    /// Network-level failure; retryable.
    Request(RequestError),
    /// The service answered with a non-zero envelope code.
    ApiResponse { ret: i64 },
    /// Envelope code 1101: the session is gone; re-authenticate.
    SessionExpired,
    /// A chunked upload finished without the server confirming the full
    /// length.
    UploadIncomplete { reported: u64, expected: u64 },
    /// Upload of a zero-length resource was requested.
    EmptyUpload,
    /// Response body was not the shape the endpoint promises.
    Decode(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(e)         => write!(f, "{e}"),
            Self::ApiResponse { ret } => write!(f, "service returned error code {ret}"),
            Self::SessionExpired     => write!(f, "session expired"),
            Self::UploadIncomplete { reported, expected } => {
                write!(f, "upload incomplete: server has {reported} of {expected} bytes")
            }
            Self::EmptyUpload        => write!(f, "cannot upload an empty file"),
            Self::Decode(s)          => write!(f, "unexpected response shape: {s}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RequestError> for GatewayError {
    fn from(e: RequestError) -> Self {
        Self::Request(e)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl GatewayError {
    /// Whether a caller may simply repeat the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::ApiResponse { .. })
    }
}

// ─── AuthorizeError ───────────────────────────────────────────────────────────

/// Failures of the QR authorization poll.
#[derive(Debug)]
pub enum AuthorizeError {
    /// [`authorize`](crate::Client::authorize) called before
    /// [`authorize_url`](crate::Client::authorize_url) issued a QR code.
    QrNotIssued,
    /// The QR code expired before being confirmed (window code 400).
    /// Terminal; start over with a fresh QR code.
    Timeout,
    /// The status poll returned a window code this client does not know.
    UnknownWindowCode(i64),
    Gateway(GatewayError),
}

impl fmt::Display for AuthorizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QrNotIssued           => write!(f, "no QR code issued yet"),
            Self::Timeout               => write!(f, "QR code expired"),
            Self::UnknownWindowCode(c)  => write!(f, "unknown login status code {c}"),
            Self::Gateway(e)            => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AuthorizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GatewayError> for AuthorizeError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

// ─── LoginError ───────────────────────────────────────────────────────────────

/// Failures while turning an authorized QR scan into a live session.
#[derive(Debug)]
pub enum LoginError {
    /// [`login`](crate::Client::login) called before authorization completed.
    NotAuthorized,
    /// The login page refused to hand out session credentials.
    Rejected { ret: String, message: String },
    Gateway(GatewayError),
}

impl fmt::Display for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthorized          => write!(f, "not authorized; scan the QR code first"),
            Self::Rejected { ret, message } => {
                write!(f, "login rejected (ret {ret}): {message}")
            }
            Self::Gateway(e)             => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoginError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GatewayError> for LoginError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

// ─── SendError ────────────────────────────────────────────────────────────────

/// Failures while sending a composed message.
#[derive(Debug)]
pub enum SendError {
    /// The message already carries a server id; it was sent before.
    AlreadyAcknowledged,
    /// This message kind has no send endpoint.
    UnsupportedKind,
    /// The acknowledgment echoed a foreign local id.
    AckMismatch { expected: String, got: String },
    Gateway(GatewayError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyAcknowledged => write!(f, "message was already sent"),
            Self::UnsupportedKind     => write!(f, "message kind cannot be sent"),
            Self::AckMismatch { expected, got } => {
                write!(f, "acknowledge id mismatch: sent {expected}, got {got}")
            }
            Self::Gateway(e)          => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GatewayError> for SendError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl From<CodecError> for SendError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::AlreadyAcknowledged => Self::AlreadyAcknowledged,
            CodecError::AckMismatch { expected, got } => Self::AckMismatch { expected, got },
            other => Self::Gateway(GatewayError::Decode(other.to_string())),
        }
    }
}

// ─── MediaError ───────────────────────────────────────────────────────────────

/// Failures while downloading a message's media payload.
#[derive(Debug)]
pub enum MediaError {
    /// Only acknowledged messages have server-side media.
    Unacknowledged,
    /// This message kind carries no downloadable media.
    Unsupported,
    Gateway(GatewayError),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unacknowledged => write!(f, "message has no server id yet"),
            Self::Unsupported    => write!(f, "message kind carries no media"),
            Self::Gateway(e)     => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MediaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GatewayError> for MediaError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}
