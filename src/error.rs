//! Status of finished operations and the typed errors raised along the way.

use std::fmt;
use thiserror::Error;

/// Where a status code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Detected by this library; never sent over the wire.
    Internal,
    /// Reported by the server or the protocol runtime.
    Protocol,
}

/// Codes the engine produces on its own. Disjoint from LDAP result codes,
/// which are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum InternalCode {
    Success = 0,
    Unknown = -1,
    Cancelled = -2,
    NotConnected = -3,
    OutOfMemory = -4,
}

impl InternalCode {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// LDAP result code for success.
pub const SUCCESS: i64 = 0;
/// Client-side code used when a connection cannot be established.
pub const CONNECT_ERROR: i64 = 91;
/// Client-side code used when the server stops answering.
pub const SERVER_DOWN: i64 = 81;
/// Client-side code used when a response did not arrive in time.
pub const TIMEOUT: i64 = 85;
/// Client-side code used when the transport cannot express a request.
pub const NOT_SUPPORTED: i64 = 92;
/// Client-side code used for malformed responses or local protocol failures.
pub const LOCAL_ERROR: i64 = 82;

/// Human readable text for a status code. Total: unknown codes map to
/// `"Unknown error"`.
pub fn message_for_code(code: i64) -> &'static str {
    match code {
        // engine codes
        -1 => "Unknown error",
        -2 => "Operation cancelled",
        -3 => "Not connected to server",
        -4 => "Out of memory",
        // RFC 4511 result codes
        0 => "Success",
        1 => "Operations error",
        2 => "Protocol error",
        3 => "Time limit exceeded",
        4 => "Size limit exceeded",
        5 => "Compare false",
        6 => "Compare true",
        7 => "Authentication method not supported",
        8 => "Strong(er) authentication required",
        9 => "Partial results and referral received",
        10 => "Referral",
        11 => "Administrative limit exceeded",
        12 => "Critical extension is unavailable",
        13 => "Confidentiality required",
        14 => "SASL bind in progress",
        16 => "No such attribute",
        17 => "Undefined attribute type",
        18 => "Inappropriate matching",
        19 => "Constraint violation",
        20 => "Type or value exists",
        21 => "Invalid syntax",
        32 => "No such object",
        33 => "Alias problem",
        34 => "Invalid DN syntax",
        35 => "Entry is a leaf",
        36 => "Alias dereferencing problem",
        48 => "Inappropriate authentication",
        49 => "Invalid credentials",
        50 => "Insufficient access",
        51 => "Server is busy",
        52 => "Server is unavailable",
        53 => "Server is unwilling to perform",
        54 => "Loop detected",
        64 => "Naming violation",
        65 => "Object class violation",
        66 => "Operation not allowed on non-leaf",
        67 => "Operation not allowed on RDN",
        68 => "Already exists",
        69 => "Cannot modify object class",
        70 => "Results too large",
        71 => "Operation affects multiple DSAs",
        80 => "Internal (implementation specific) error",
        // client-side codes
        81 => "Can't contact LDAP server",
        82 => "Local error",
        83 => "Encoding error",
        84 => "Decoding error",
        85 => "Timed out",
        86 => "Unknown authentication method",
        87 => "Bad search filter",
        88 => "User cancelled operation",
        89 => "Bad parameter to an ldap routine",
        90 => "Out of memory",
        91 => "Connect error",
        92 => "Not supported",
        93 => "Control not found",
        94 => "No results returned",
        95 => "More results to return",
        96 => "Client loop",
        97 => "Referral limit exceeded",
        118 => "Cancelled",
        119 => "No operation to cancel",
        120 => "Too late to cancel",
        121 => "Cannot cancel",
        _ => "Unknown error",
    }
}

/// Outcome of a finished operation.
///
/// Read-only to callers; only the engine builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    kind: ErrorKind,
    code: i64,
    title: String,
    message: String,
    diagnostic: Option<String>,
}

impl Status {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    /// Short label naming the request, suitable as a dialog title.
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn is_successful(&self) -> bool {
        self.code == SUCCESS
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Internal && self.code == InternalCode::Cancelled.code()
    }

    pub(crate) fn success(title: &str) -> Self {
        Self::internal(title, InternalCode::Success, None)
    }

    pub(crate) fn internal(title: &str, code: InternalCode, diagnostic: Option<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            code: code.code(),
            title: title.to_string(),
            message: message_for_code(code.code()).to_string(),
            diagnostic: diagnostic.filter(|d| !d.is_empty()),
        }
    }

    pub(crate) fn cancelled(title: &str) -> Self {
        Self::internal(title, InternalCode::Cancelled, None)
    }

    pub(crate) fn protocol(title: &str, code: i64, diagnostic: Option<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            code,
            title: title.to_string(),
            message: message_for_code(code).to_string(),
            diagnostic: diagnostic.filter(|d| !d.is_empty()),
        }
    }

    /// Status for a failed transport call.
    pub(crate) fn from_transport(title: &str, err: &TransportError) -> Self {
        Self::protocol(title, err.code(), Some(err.to_string()))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.title, self.message, self.code)?;
        if let Some(diag) = &self.diagnostic {
            write!(f, ": {}", diag)?;
        }
        Ok(())
    }
}

/// Why a directory URL was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("unrecognized URL scheme: {0:?}")]
    BadScheme(String),
    #[error("malformed URL: {0}")]
    Malformed(String),
    #[error("invalid port: {0:?}")]
    BadPort(String),
    #[error("invalid percent-encoding in {0:?}")]
    BadEncoding(String),
    #[error("unsupported critical extension: {0}")]
    UnsupportedCriticalExtension(String),
}

/// Failure reported by a [`Connection`](crate::transport::Connection) or
/// [`Connector`](crate::transport::Connector).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport or handshake failure while opening a connection.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The established connection went away.
    #[error("server connection lost: {0}")]
    ServerDown(String),
    #[error("timed out waiting for the server")]
    Timeout,
    /// The request cannot be expressed by this transport.
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Client-side result code reported for this failure.
    pub fn code(&self) -> i64 {
        match self {
            TransportError::Connect(_) => CONNECT_ERROR,
            TransportError::ServerDown(_) => SERVER_DOWN,
            TransportError::Timeout => TIMEOUT,
            TransportError::Unsupported(_) => NOT_SUPPORTED,
            TransportError::Protocol(_) => LOCAL_ERROR,
        }
    }

    /// Whether the connection that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_) | TransportError::ServerDown(_) | TransportError::Timeout
        )
    }
}
