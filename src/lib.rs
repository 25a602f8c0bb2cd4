//! Asynchronous LDAP client sessions.
//!
//! A [`Session`] holds connection and authentication settings and at most one
//! directory connection. Each request method snapshots the settings into a new
//! [`Operation`], queues it and returns right away; the caller waits on the
//! operation, subscribes to its state or cancels it.

pub mod config;
mod engine;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod modification;
pub mod operation;
pub mod queue;
pub mod session;
pub mod tls;
pub mod transport;
pub mod url;
pub mod value;

pub use config::{BindMethod, EncryptionScheme, ProtocolScheme, ProtocolVersion, Scope, SessionConfig};
pub use entry::Entry;
pub use error::{message_for_code, ErrorKind, InternalCode, Status, TransportError, UrlError};
pub use metrics::SessionMetrics;
pub use modification::{ModOp, ModValue, Modification};
pub use operation::{Operation, OperationKind, OperationState, RenameParams, Request, SearchParams};
pub use queue::OperationQueue;
pub use session::Session;
pub use url::{test_url, Extension, LdapUrl};
pub use value::{BerValue, ImageFormat, ImageInfo};
