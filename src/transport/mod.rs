//! The protocol port the engine talks through.
//!
//! The engine never frames LDAP messages itself. It asks a [`Connector`] for a
//! [`Connection`] built from an operation's configuration snapshot and issues
//! one request at a time on it. [`ldap::LdapConnector`] is the production implementation.

pub mod ldap;
#[cfg(test)]
pub(crate) mod mock;

use crate::config::{Scope, SessionConfig};
use crate::entry::Entry;
use crate::error::TransportError;
use crate::modification::Modification;
use async_trait::async_trait;

/// Final result message of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolResult {
    pub code: u32,
    pub matched_dn: String,
    pub message: String,
    pub referrals: Vec<String>,
}

impl ProtocolResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Authentication request derived from a configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindForm {
    Anonymous,
    Simple {
        who: String,
        credentials: Vec<u8>,
    },
    Sasl {
        who: String,
        mechanism: Option<String>,
        realm: Option<String>,
        credentials: Vec<u8>,
    },
}

/// One protocol search against one base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    /// Empty requests all user attributes.
    pub attributes: Vec<String>,
    pub attributes_only: bool,
    pub size_limit: i32,
    pub time_limit: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResponse {
    pub entries: Vec<Entry>,
    /// Continuation references returned alongside entries.
    pub references: Vec<String>,
    pub result: ProtocolResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest {
    pub dn: String,
    pub new_rdn: String,
    pub new_superior: Option<String>,
    pub delete_old_rdn: bool,
}

/// Opens connections. Implementations must apply the snapshot's transport,
/// encryption, CA file, protocol version and timeouts before returning.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Connection>, TransportError>;
}

/// An open connection. Calls are never issued concurrently on one connection.
#[async_trait]
pub trait Connection: Send {
    async fn bind(&mut self, form: &BindForm) -> Result<ProtocolResult, TransportError>;

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, TransportError>;

    async fn delete(&mut self, dn: &str) -> Result<ProtocolResult, TransportError>;

    async fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<ProtocolResult, TransportError>;

    async fn rename(&mut self, request: &RenameRequest) -> Result<ProtocolResult, TransportError>;

    /// Returns the authorization identity, if the server reported one.
    async fn who_am_i(&mut self) -> Result<(ProtocolResult, Option<String>), TransportError>;

    async fn unbind(&mut self) -> Result<(), TransportError>;

    /// Gives up on the most recent request after the caller stopped waiting.
    async fn abandon(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
