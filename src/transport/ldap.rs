//! Connections backed by the `ldap3` client.
//!
//! Every connection gets its own driver task spawned with `ldap3::drive!`.
//! Limits of the underlying client surface as [`TransportError::Unsupported`]:
//! LDAPv2, SASL mechanisms other than EXTERNAL and the children search scope.

use super::*;
use crate::config::{EncryptionScheme, ProtocolScheme, ProtocolVersion};
use crate::modification::ModOp;
use crate::tls;
use crate::value::BerValue;
use ::ldap3::exop::WhoAmI;
use ::ldap3::result::ExopResult;
use ::ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod, SearchEntry, SearchOptions};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Opens `ldap3` connections from a configuration snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LdapConnector;

impl LdapConnector {
    pub fn new() -> Self {
        Self
    }

    fn settings(config: &SessionConfig, starttls: bool) -> Result<LdapConnSettings, TransportError> {
        let mut settings = LdapConnSettings::new();
        if let Some(timeout) = config.network_timeout() {
            settings = settings.set_conn_timeout(timeout);
        }
        let needs_tls = starttls || config.scheme() == ProtocolScheme::Ldaps;
        if needs_tls {
            let tls_config = tls::client_config(config.ca_certificate_file())
                .map_err(|e| TransportError::Connect(format!("{:#}", e)))?;
            settings = settings.set_config(tls_config);
        }
        Ok(settings.set_starttls(starttls))
    }

    async fn open(url: &str, settings: LdapConnSettings) -> Result<Ldap, TransportError> {
        let (conn, ldap) = LdapConnAsync::with_settings(settings, url)
            .await
            .map_err(|e| match connection_error(e) {
                TransportError::Protocol(msg) => TransportError::Connect(format!("{}: {}", url, msg)),
                other => other,
            })?;
        tokio::spawn(::ldap3::drive!(conn));
        Ok(ldap)
    }
}

#[async_trait]
impl Connector for LdapConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Connection>, TransportError> {
        if config.protocol_version() == ProtocolVersion::V2 {
            return Err(TransportError::Unsupported("LDAPv2".to_string()));
        }
        let url = config.connection_url();
        // StartTLS only applies to ldap:// connections.
        let encryption = match config.scheme() {
            ProtocolScheme::Ldap => config.encryption(),
            _ => EncryptionScheme::None,
        };
        debug!("Connecting to {} (encryption {:?})", url, encryption);
        let ldap = match encryption {
            EncryptionScheme::Tls => Self::open(&url, Self::settings(config, true)?).await?,
            EncryptionScheme::AttemptTls => match Self::open(&url, Self::settings(config, true)?).await {
                Ok(ldap) => ldap,
                Err(TransportError::Timeout) => return Err(TransportError::Timeout),
                Err(e) => {
                    warn!("StartTLS to {} failed, continuing without TLS: {}", url, e);
                    Self::open(&url, Self::settings(config, false)?).await?
                }
            },
            EncryptionScheme::None | EncryptionScheme::Ssl => {
                Self::open(&url, Self::settings(config, false)?).await?
            }
        };
        info!("Connected to {}", url);
        Ok(Box::new(LdapConnection { ldap, url }))
    }
}

struct LdapConnection {
    ldap: Ldap,
    url: String,
}

#[async_trait]
impl Connection for LdapConnection {
    async fn bind(&mut self, form: &BindForm) -> Result<ProtocolResult, TransportError> {
        let result = match form {
            BindForm::Anonymous => self.ldap.simple_bind("", "").await,
            BindForm::Simple { who, credentials } => {
                let password = std::str::from_utf8(credentials).map_err(|_| {
                    TransportError::Unsupported("simple bind with non-UTF-8 credentials".to_string())
                })?;
                self.ldap.simple_bind(who, password).await
            }
            BindForm::Sasl { mechanism, .. } => {
                let mechanism = mechanism.as_deref().unwrap_or("EXTERNAL");
                if !mechanism.eq_ignore_ascii_case("EXTERNAL") {
                    return Err(TransportError::Unsupported(format!("SASL mechanism {}", mechanism)));
                }
                self.ldap.sasl_external_bind().await
            }
        }
        .map_err(operation_error)?;
        debug!("BIND on {} returned rc={}", self.url, result.rc);
        Ok(protocol_result(result))
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, TransportError> {
        let scope = match request.scope {
            Scope::Base => ::ldap3::Scope::Base,
            Scope::OneLevel => ::ldap3::Scope::OneLevel,
            Scope::Subtree => ::ldap3::Scope::Subtree,
            Scope::Children => return Err(TransportError::Unsupported("children search scope".to_string())),
        };
        let options = SearchOptions::new()
            .sizelimit(request.size_limit)
            .timelimit(request.time_limit)
            .typesonly(request.attributes_only);
        let ::ldap3::SearchResult(raw, result) = self
            .ldap
            .with_search_options(options)
            .search(&request.base, scope, &request.filter, request.attributes.clone())
            .await
            .map_err(operation_error)?;

        let mut entries = Vec::with_capacity(raw.len());
        let mut references = Vec::new();
        for item in raw {
            if item.is_ref() {
                references.extend(::ldap3::parse_refs(item.0));
            } else if !item.is_intermediate() {
                entries.push(convert_entry(SearchEntry::construct(item)));
            }
        }
        debug!(
            "SEARCH base={} on {} returned {} entries, {} references, rc={}",
            request.base,
            self.url,
            entries.len(),
            references.len(),
            result.rc
        );
        Ok(SearchResponse {
            entries,
            references,
            result: protocol_result(result),
        })
    }

    async fn delete(&mut self, dn: &str) -> Result<ProtocolResult, TransportError> {
        let result = self.ldap.delete(dn).await.map_err(operation_error)?;
        debug!("DELETE {} on {} returned rc={}", dn, self.url, result.rc);
        Ok(protocol_result(result))
    }

    async fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<ProtocolResult, TransportError> {
        let changes: Vec<Mod<Vec<u8>>> = mods
            .iter()
            .map(|m| {
                let attr = m.attribute().as_bytes().to_vec();
                let values: HashSet<Vec<u8>> = m.encoded_values().into_iter().collect();
                match m.op() {
                    ModOp::Add => Mod::Add(attr, values),
                    ModOp::Delete => Mod::Delete(attr, values),
                    ModOp::Replace => Mod::Replace(attr, values),
                }
            })
            .collect();
        let result = self.ldap.modify(dn, changes).await.map_err(operation_error)?;
        debug!("MODIFY {} on {} returned rc={}", dn, self.url, result.rc);
        Ok(protocol_result(result))
    }

    async fn rename(&mut self, request: &RenameRequest) -> Result<ProtocolResult, TransportError> {
        let result = self
            .ldap
            .modifydn(
                &request.dn,
                &request.new_rdn,
                request.delete_old_rdn,
                request.new_superior.as_deref(),
            )
            .await
            .map_err(operation_error)?;
        debug!("MODDN {} on {} returned rc={}", request.dn, self.url, result.rc);
        Ok(protocol_result(result))
    }

    async fn who_am_i(&mut self) -> Result<(ProtocolResult, Option<String>), TransportError> {
        let ExopResult(exop, result) = self.ldap.extended(WhoAmI).await.map_err(operation_error)?;
        let authz_id = exop.val.map(|v| String::from_utf8_lossy(&v).to_string());
        debug!("EXTENDED WhoAmI on {}: {:?}", self.url, authz_id);
        Ok((protocol_result(result), authz_id))
    }

    async fn unbind(&mut self) -> Result<(), TransportError> {
        self.ldap.unbind().await.map_err(operation_error)?;
        debug!("UNBIND on {}", self.url);
        Ok(())
    }

    async fn abandon(&mut self) -> Result<(), TransportError> {
        let msgid = self.ldap.last_id();
        self.ldap.abandon(msgid).await.map_err(operation_error)?;
        debug!("ABANDON msgid={} on {}", msgid, self.url);
        Ok(())
    }
}

fn protocol_result(result: LdapResult) -> ProtocolResult {
    ProtocolResult {
        code: result.rc,
        matched_dn: result.matched,
        message: result.text,
        referrals: result.refs,
    }
}

fn convert_entry(raw: SearchEntry) -> Entry {
    let mut entry = Entry::new(raw.dn);
    for (name, values) in raw.attrs {
        entry.push_values(name, values.into_iter().map(BerValue::from));
    }
    for (name, values) in raw.bin_attrs {
        entry.push_values(name, values.into_iter().map(BerValue::new));
    }
    entry
}

/// Errors while the connection is being established.
fn connection_error(e: LdapError) -> TransportError {
    match e {
        LdapError::Timeout { .. } => TransportError::Timeout,
        other => TransportError::Protocol(other.to_string()),
    }
}

/// Errors on an established connection.
fn operation_error(e: LdapError) -> TransportError {
    match e {
        LdapError::Timeout { .. } => TransportError::Timeout,
        LdapError::Io { .. } | LdapError::EndOfStream | LdapError::OpSend { .. } | LdapError::ResultRecv { .. } => {
            TransportError::ServerDown(e.to_string())
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_protocol_result_conversion() {
        let result = LdapResult {
            rc: 32,
            matched: "dc=example,dc=com".to_string(),
            text: "no such object".to_string(),
            refs: vec!["ldap://other.example.com/".to_string()],
            ctrls: vec![],
        };
        let converted = protocol_result(result);
        assert_eq!(converted.code, 32);
        assert!(!converted.is_success());
        assert_eq!(converted.matched_dn, "dc=example,dc=com");
        assert_eq!(converted.referrals, vec!["ldap://other.example.com/".to_string()]);
    }

    #[test]
    fn test_entry_conversion_merges_text_and_binary() {
        let mut attrs = HashMap::new();
        attrs.insert("cn".to_string(), vec!["Barbara Jensen".to_string()]);
        let mut bin_attrs = HashMap::new();
        bin_attrs.insert("jpegPhoto".to_string(), vec![vec![0xff, 0xd8, 0xff, 0xe0]]);
        let entry = convert_entry(SearchEntry {
            dn: "cn=Barbara Jensen,dc=example,dc=com".to_string(),
            attrs,
            bin_attrs,
        });
        assert_eq!(entry.dn(), "cn=Barbara Jensen,dc=example,dc=com");
        assert_eq!(entry.first_string("cn"), Some("Barbara Jensen"));
        assert!(entry.values("jpegphoto")[0].is_image());
    }

    #[tokio::test]
    async fn test_ldapv2_is_unsupported() {
        let mut config = SessionConfig::default();
        config.set_protocol_version(ProtocolVersion::V2);
        let err = LdapConnector::new().connect(&config).await.err().unwrap();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = SessionConfig::default();
        config.set_uri(&format!("ldap://127.0.0.1:{}/", port)).unwrap();
        config.set_encryption(EncryptionScheme::None);
        let err = LdapConnector::new().connect(&config).await.err().unwrap();
        assert!(!matches!(err, TransportError::Unsupported(_)));
        assert!(err.is_fatal());
    }
}
