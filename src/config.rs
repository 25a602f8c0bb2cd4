use crate::error::UrlError;
use crate::tls;
use crate::url::LdapUrl;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Transport selected by the URI scheme token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolScheme {
    /// `ldap://` over TCP.
    #[default]
    Ldap,
    /// `ldaps://`, TLS from the first byte.
    Ldaps,
    /// `ldapi://`, UNIX domain socket.
    Ldapi,
}

impl ProtocolScheme {
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("ldap") {
            Some(ProtocolScheme::Ldap)
        } else if token.eq_ignore_ascii_case("ldaps") {
            Some(ProtocolScheme::Ldaps)
        } else if token.eq_ignore_ascii_case("ldapi") {
            Some(ProtocolScheme::Ldapi)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolScheme::Ldap => "ldap",
            ProtocolScheme::Ldaps => "ldaps",
            ProtocolScheme::Ldapi => "ldapi",
        }
    }

    /// Port used when the URL does not carry one. `ldapi` has no port.
    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolScheme::Ldap => 389,
            ProtocolScheme::Ldaps => 636,
            ProtocolScheme::Ldapi => 0,
        }
    }

    /// Encryption a freshly selected scheme starts with.
    pub fn default_encryption(&self) -> EncryptionScheme {
        match self {
            ProtocolScheme::Ldap => EncryptionScheme::AttemptTls,
            ProtocolScheme::Ldaps => EncryptionScheme::Ssl,
            ProtocolScheme::Ldapi => EncryptionScheme::None,
        }
    }
}

impl fmt::Display for ProtocolScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Written as the bare number `2` or `3` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    V2,
    #[default]
    V3,
}

impl ProtocolVersion {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            _ => None,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(n: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_number(n).ok_or_else(|| format!("unsupported protocol_version: {} (expected 2 or 3)", n))
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version.number()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionScheme {
    None,
    /// StartTLS when the server offers it, plain text otherwise.
    #[default]
    AttemptTls,
    /// StartTLS, failing the connection if it cannot be negotiated.
    Tls,
    Ssl,
}

/// How a session authenticates. Never stored: see [`SessionConfig::bind_method`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindMethod {
    Anonymous,
    Simple,
    Sasl,
}

impl BindMethod {
    /// Bind method implied by the identity and SASL settings.
    ///
    /// | identity | mechanism | realm | method    |
    /// |----------|-----------|-------|-----------|
    /// | none     | any       | any   | Anonymous |
    /// | set      | none      | none  | Simple    |
    /// | set      | set       | any   | Sasl      |
    /// | set      | any       | set   | Sasl      |
    pub fn derive(who: Option<&str>, mechanism: Option<&str>, realm: Option<&str>) -> Self {
        match (who, mechanism, realm) {
            (None, _, _) => BindMethod::Anonymous,
            (Some(_), None, None) => BindMethod::Simple,
            (Some(_), _, _) => BindMethod::Sasl,
        }
    }
}

/// Breadth of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    #[default]
    Base,
    OneLevel,
    Subtree,
    Children,
}

impl Scope {
    /// Scope token as used in LDAP URLs.
    pub fn as_url_token(&self) -> &'static str {
        match self {
            Scope::Base => "base",
            Scope::OneLevel => "one",
            Scope::Subtree => "sub",
            Scope::Children => "children",
        }
    }

    pub fn from_url_token(token: &str) -> Option<Self> {
        [Scope::Base, Scope::OneLevel, Scope::Subtree, Scope::Children]
            .into_iter()
            .find(|s| token.eq_ignore_ascii_case(s.as_url_token()))
    }
}

/// Connection and authentication settings of a session.
///
/// A `Session` keeps one of these as its live configuration and clones it into
/// every operation it creates. Setters are plain field updates, they never touch
/// a connection.
///
/// Serializes through the YAML file layout (`uri`, `protocol_version`,
/// `encryption`, limits and a `bind` section); deserializing validates it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SessionFile", into = "SessionFile")]
pub struct SessionConfig {
    uri: String,
    scheme: ProtocolScheme,
    host: String,
    port: u16,
    protocol_version: ProtocolVersion,
    encryption: EncryptionScheme,
    ca_certificate_file: Option<PathBuf>,
    size_limit: i32,
    search_time_limit: i32,
    network_timeout: Option<Duration>,
    bind_who: Option<String>,
    bind_credentials: Option<Vec<u8>>,
    sasl_mechanism: Option<String>,
    sasl_realm: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            uri: "ldap://localhost/".to_string(),
            scheme: ProtocolScheme::Ldap,
            host: "localhost".to_string(),
            port: 389,
            protocol_version: ProtocolVersion::V3,
            encryption: EncryptionScheme::AttemptTls,
            ca_certificate_file: None,
            size_limit: 0,
            search_time_limit: 0,
            network_timeout: None,
            bind_who: None,
            bind_credentials: None,
            sasl_mechanism: None,
            sasl_realm: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("uri", &self.uri)
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol_version", &self.protocol_version)
            .field("encryption", &self.encryption)
            .field("ca_certificate_file", &self.ca_certificate_file)
            .field("size_limit", &self.size_limit)
            .field("search_time_limit", &self.search_time_limit)
            .field("network_timeout", &self.network_timeout)
            .field("bind_method", &self.bind_method())
            .field("bind_who", &self.bind_who)
            .field("bind_credentials", &self.bind_credentials.as_ref().map(|_| "<redacted>"))
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("sasl_realm", &self.sasl_realm)
            .finish()
    }
}

impl SessionConfig {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> ProtocolScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn encryption(&self) -> EncryptionScheme {
        self.encryption
    }

    pub fn ca_certificate_file(&self) -> Option<&Path> {
        self.ca_certificate_file.as_deref()
    }

    /// Maximum entries per search, 0 for no client-requested limit.
    pub fn size_limit(&self) -> i32 {
        self.size_limit
    }

    /// Server-side search time limit in seconds, 0 for none.
    pub fn search_time_limit(&self) -> i32 {
        self.search_time_limit
    }

    /// Bound on any single protocol response wait. `None` waits forever.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout
    }

    pub fn bind_method(&self) -> BindMethod {
        BindMethod::derive(
            self.bind_who.as_deref(),
            self.sasl_mechanism.as_deref(),
            self.sasl_realm.as_deref(),
        )
    }

    pub fn bind_who(&self) -> Option<&str> {
        self.bind_who.as_deref()
    }

    pub fn bind_credentials(&self) -> Option<&[u8]> {
        self.bind_credentials.as_deref()
    }

    /// Credentials as text, when they are valid UTF-8.
    pub fn bind_credentials_string(&self) -> Option<&str> {
        self.bind_credentials
            .as_deref()
            .and_then(|c| std::str::from_utf8(c).ok())
    }

    pub fn sasl_mechanism(&self) -> Option<&str> {
        self.sasl_mechanism.as_deref()
    }

    pub fn sasl_realm(&self) -> Option<&str> {
        self.sasl_realm.as_deref()
    }

    /// URL used to open a connection: scheme, host and port only.
    pub fn connection_url(&self) -> String {
        let mut url = LdapUrl::default();
        url.set_scheme(self.scheme);
        url.set_host(&self.host);
        url.set_port(self.port);
        url.connection_url()
    }

    /// Replaces the URI, deriving scheme, host, port and the scheme's default
    /// encryption from it. An invalid URI leaves the configuration untouched.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), UrlError> {
        let url: LdapUrl = uri.parse()?;
        self.uri = uri.to_string();
        self.scheme = url.scheme();
        self.host = url.host().to_string();
        self.port = url.port();
        self.encryption = url.scheme().default_encryption();
        Ok(())
    }

    /// Selects the transport and resets encryption to that transport's default.
    pub fn set_scheme(&mut self, scheme: ProtocolScheme) {
        if self.scheme != scheme && self.port == self.scheme.default_port() {
            self.port = scheme.default_port();
        }
        self.scheme = scheme;
        self.encryption = scheme.default_encryption();
        self.uri = self.connection_url();
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
        self.uri = self.connection_url();
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.uri = self.connection_url();
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn set_encryption(&mut self, encryption: EncryptionScheme) {
        self.encryption = encryption;
    }

    pub fn set_ca_certificate_file<P: Into<PathBuf>>(&mut self, path: Option<P>) {
        self.ca_certificate_file = path.map(Into::into);
    }

    pub fn set_size_limit(&mut self, limit: i32) {
        self.size_limit = limit.max(0);
    }

    pub fn set_search_time_limit(&mut self, seconds: i32) {
        self.search_time_limit = seconds.max(0);
    }

    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        self.network_timeout = timeout;
    }

    pub fn set_bind_who(&mut self, who: Option<&str>) {
        self.bind_who = who.map(str::to_string);
    }

    pub fn set_bind_credentials(&mut self, credentials: Option<&[u8]>) {
        self.bind_credentials = credentials.map(<[u8]>::to_vec);
    }

    pub fn set_bind_credentials_string(&mut self, credentials: Option<&str>) {
        self.bind_credentials = credentials.map(|c| c.as_bytes().to_vec());
    }

    pub fn set_sasl_mechanism(&mut self, mechanism: Option<&str>) {
        self.sasl_mechanism = mechanism.map(str::to_string);
    }

    pub fn set_sasl_realm(&mut self, realm: Option<&str>) {
        self.sasl_realm = realm.map(str::to_string);
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read session config: {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Parse session config YAML")
    }
}

/// On-disk shape of a session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFile {
    uri: String,
    protocol_version: Option<ProtocolVersion>,
    /// Overrides the encryption derived from the URI scheme.
    encryption: Option<EncryptionScheme>,
    ca_certificate_file: Option<PathBuf>,
    size_limit: Option<i32>,
    search_time_limit: Option<i32>,
    /// Seconds; absent or negative means wait forever.
    network_timeout: Option<i64>,
    bind: Option<BindSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BindSection {
    who: Option<String>,
    credentials: Option<String>,
    sasl_mechanism: Option<String>,
    sasl_realm: Option<String>,
}

impl SessionFile {
    fn into_config(self) -> Result<SessionConfig> {
        let mut config = SessionConfig::default();
        config
            .set_uri(&self.uri)
            .with_context(|| format!("Invalid uri: {}", self.uri))?;
        if let Some(version) = self.protocol_version {
            config.set_protocol_version(version);
        }
        if let Some(encryption) = self.encryption {
            config.set_encryption(encryption);
        }
        if let Some(path) = &self.ca_certificate_file {
            tls::validate_ca_file(path)?;
        }
        config.set_ca_certificate_file(self.ca_certificate_file);
        config.set_size_limit(self.size_limit.unwrap_or(0));
        config.set_search_time_limit(self.search_time_limit.unwrap_or(0));
        config.set_network_timeout(
            self.network_timeout
                .filter(|s| *s >= 0)
                .map(|s| Duration::from_secs(s as u64)),
        );
        if let Some(bind) = self.bind {
            config.set_bind_who(bind.who.as_deref());
            config.set_bind_credentials_string(bind.credentials.as_deref());
            config.set_sasl_mechanism(bind.sasl_mechanism.as_deref());
            config.set_sasl_realm(bind.sasl_realm.as_deref());
        }
        Ok(config)
    }
}

impl TryFrom<SessionFile> for SessionConfig {
    type Error = String;

    fn try_from(file: SessionFile) -> std::result::Result<Self, Self::Error> {
        file.into_config().map_err(|e| format!("{:#}", e))
    }
}

impl From<SessionConfig> for SessionFile {
    fn from(config: SessionConfig) -> Self {
        let has_bind = config.bind_who.is_some()
            || config.bind_credentials.is_some()
            || config.sasl_mechanism.is_some()
            || config.sasl_realm.is_some();
        let bind = has_bind.then(|| BindSection {
            credentials: config.bind_credentials_string().map(str::to_string),
            who: config.bind_who.clone(),
            sasl_mechanism: config.sasl_mechanism.clone(),
            sasl_realm: config.sasl_realm.clone(),
        });
        SessionFile {
            uri: config.uri,
            protocol_version: Some(config.protocol_version),
            encryption: Some(config.encryption),
            ca_certificate_file: config.ca_certificate_file,
            size_limit: Some(config.size_limit),
            search_time_limit: Some(config.search_time_limit),
            network_timeout: config.network_timeout.map(|d| d.as_secs() as i64),
            bind,
        }
    }
}
