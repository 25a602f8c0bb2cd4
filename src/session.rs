//! The caller-facing session: live configuration plus request builders.

use crate::config::{BindMethod, EncryptionScheme, ProtocolScheme, ProtocolVersion, Scope, SessionConfig};
use crate::engine::SessionShared;
use crate::error::UrlError;
use crate::metrics::SessionMetrics;
use crate::modification::Modification;
use crate::operation::{Operation, RenameParams, Request, SearchParams};
use crate::queue::OperationQueue;
use crate::transport::ldap::LdapConnector;
use crate::transport::Connector;
use crate::url::LdapUrl;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A directory session owning at most one connection.
///
/// Setters only change the configuration used by operations created after
/// them. Request methods return immediately with a pending [`Operation`].
pub struct Session {
    config: ArcSwap<SessionConfig>,
    shared: Arc<SessionShared>,
    queue: OperationQueue,
    next_id: AtomicU64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::from_config(SessionConfig::default())
    }

    pub fn from_config(config: SessionConfig) -> Self {
        Self::with_queue(config, OperationQueue::default())
    }

    pub fn from_uri(uri: &str) -> Result<Self, UrlError> {
        let mut config = SessionConfig::default();
        config.set_uri(uri)?;
        Ok(Self::from_config(config))
    }

    /// A session whose operations go through `queue`, possibly shared with other sessions.
    pub fn with_queue(config: SessionConfig, queue: OperationQueue) -> Self {
        Self::with_connector(config, Arc::new(LdapConnector::new()), queue)
    }

    /// A session opening its connection through `connector`.
    pub fn with_connector(config: SessionConfig, connector: Arc<dyn Connector>, queue: OperationQueue) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            shared: Arc::new(SessionShared::new(connector)),
            queue,
            next_id: AtomicU64::new(1),
        }
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> SessionConfig {
        SessionConfig::clone(&self.config.load())
    }

    /// Applies `change` to the configuration atomically. `change` may run
    /// more than once under contention.
    pub fn update_config<F>(&self, change: F)
    where
        F: Fn(&mut SessionConfig),
    {
        self.config.rcu(|current| {
            let mut next = SessionConfig::clone(current);
            change(&mut next);
            next
        });
    }

    pub fn uri(&self) -> String {
        self.config.load().uri().to_string()
    }

    pub fn bind_method(&self) -> BindMethod {
        self.config.load().bind_method()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(self.shared.metrics())
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Replaces the URI; scheme, host, port and default encryption follow it.
    /// On error the configuration is left unchanged.
    pub fn set_uri(&self, uri: &str) -> Result<(), UrlError> {
        LdapUrl::parse(uri)?;
        self.update_config(|c| {
            let _ = c.set_uri(uri);
        });
        Ok(())
    }

    pub fn set_scheme(&self, scheme: ProtocolScheme) {
        self.update_config(|c| c.set_scheme(scheme));
    }

    pub fn set_host(&self, host: &str) {
        self.update_config(|c| c.set_host(host));
    }

    pub fn set_port(&self, port: u16) {
        self.update_config(|c| c.set_port(port));
    }

    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        self.update_config(|c| c.set_protocol_version(version));
    }

    pub fn set_encryption(&self, encryption: EncryptionScheme) {
        self.update_config(|c| c.set_encryption(encryption));
    }

    pub fn set_ca_certificate_file<P: Into<PathBuf>>(&self, path: Option<P>) {
        let path: Option<PathBuf> = path.map(Into::into);
        self.update_config(|c| c.set_ca_certificate_file(path.clone()));
    }

    pub fn set_size_limit(&self, limit: i32) {
        self.update_config(|c| c.set_size_limit(limit));
    }

    pub fn set_search_time_limit(&self, seconds: i32) {
        self.update_config(|c| c.set_search_time_limit(seconds));
    }

    pub fn set_network_timeout(&self, timeout: Option<Duration>) {
        self.update_config(|c| c.set_network_timeout(timeout));
    }

    pub fn set_bind_who(&self, who: Option<&str>) {
        self.update_config(|c| c.set_bind_who(who));
    }

    pub fn set_bind_credentials(&self, credentials: Option<&[u8]>) {
        self.update_config(|c| c.set_bind_credentials(credentials));
    }

    pub fn set_bind_credentials_string(&self, credentials: Option<&str>) {
        self.update_config(|c| c.set_bind_credentials_string(credentials));
    }

    pub fn set_sasl_mechanism(&self, mechanism: Option<&str>) {
        self.update_config(|c| c.set_sasl_mechanism(mechanism));
    }

    pub fn set_sasl_realm(&self, realm: Option<&str>) {
        self.update_config(|c| c.set_sasl_realm(realm));
    }

    /// Validates `request`, snapshots the configuration and queues the operation.
    /// An invalid request comes back already failed.
    pub fn submit(&self, request: Request) -> Operation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.config.load_full();
        if let Err(diagnostic) = request.validate() {
            debug!("Rejecting operation {} ({}): {}", id, request.kind(), diagnostic);
            return Operation::rejected(id, snapshot, request, diagnostic);
        }
        let op = Operation::new(id, snapshot, request);
        debug!("Queued operation {} ({})", id, op.kind());
        self.queue.enqueue(Arc::clone(&self.shared), op.clone());
        op
    }

    /// Connects if needed and authenticates with the current identity.
    pub fn bind(&self) -> Operation {
        self.submit(Request::Bind)
    }

    /// Drops any open connection and connects again with the current configuration.
    pub fn rebind(&self) -> Operation {
        self.submit(Request::Rebind)
    }

    pub fn unbind(&self) -> Operation {
        self.submit(Request::Unbind)
    }

    pub fn search(&self, base: &str, scope: Scope, filter: &str) -> Operation {
        self.submit(Request::Search(SearchParams::new(base, scope, filter)))
    }

    /// Searches each base in order, accumulating the results.
    pub fn search_many<I, S>(&self, bases: I, scope: Scope, filter: &str) -> Operation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(Request::Search(SearchParams::with_bases(bases, scope, filter)))
    }

    pub fn search_with(&self, params: SearchParams) -> Operation {
        self.submit(Request::Search(params))
    }

    /// Searches with the base, scope, filter and attributes of `url`. Critical
    /// extensions are not supported and reject the request.
    pub fn search_url(&self, url: &LdapUrl) -> Operation {
        let request = Request::Search(SearchParams::from_url(url));
        if let Err(e) = url.validate_extensions(&[]) {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            return Operation::rejected(id, self.config.load_full(), request, e.to_string());
        }
        self.submit(request)
    }

    pub fn delete(&self, dn: &str) -> Operation {
        self.submit(Request::Delete { dn: dn.to_string() })
    }

    pub fn rename(&self, dn: &str, new_rdn: &str, new_superior: Option<&str>, delete_old_rdn: bool) -> Operation {
        self.submit(Request::Rename(RenameParams {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
            new_superior: new_superior.map(str::to_string),
            delete_old_rdn,
        }))
    }

    pub fn modify(&self, dn: &str, modifications: Vec<Modification>) -> Operation {
        self.submit(Request::Modify {
            dn: dn.to_string(),
            modifications,
        })
    }

    pub fn who_am_i(&self) -> Operation {
        self.submit(Request::WhoAmI)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &**self.config.load())
            .field("connected", &self.is_connected())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, OperationState};
    use crate::transport::mock::{MockConnector, MockState};
    use crate::value::BerValue;
    use std::sync::atomic::Ordering;

    fn mock_session(max_concurrent: usize) -> (Arc<MockState>, Session) {
        let state = MockState::new();
        let mut config = SessionConfig::default();
        config.set_uri("ldap://ldap.example.com/").unwrap();
        config.set_bind_who(Some("cn=admin,dc=example,dc=com"));
        config.set_bind_credentials_string(Some("secret"));
        let session = Session::with_connector(
            config,
            Arc::new(MockConnector { state: state.clone() }),
            OperationQueue::new(max_concurrent),
        );
        (state, session)
    }

    #[test]
    fn test_bind_method_all_setter_orders() {
        type Step = fn(&Session);
        let steps: [(&str, Step); 3] = [
            ("who", |s| s.set_bind_who(Some("cn=admin"))),
            ("mech", |s| s.set_sasl_mechanism(Some("EXTERNAL"))),
            ("realm", |s| s.set_sasl_realm(Some("EXAMPLE.COM"))),
        ];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let session = Session::new();
            for i in order {
                (steps[i].1)(&session);
            }
            assert_eq!(session.bind_method(), BindMethod::Sasl);
            for i in order {
                match steps[i].0 {
                    "who" => session.set_bind_who(None),
                    "mech" => session.set_sasl_mechanism(None),
                    _ => session.set_sasl_realm(None),
                }
            }
            assert_eq!(session.bind_method(), BindMethod::Anonymous);
        }

        let session = Session::new();
        session.set_bind_who(Some("cn=admin"));
        assert_eq!(session.bind_method(), BindMethod::Simple);
        session.set_sasl_realm(Some("EXAMPLE.COM"));
        assert_eq!(session.bind_method(), BindMethod::Sasl);
    }

    #[test]
    fn test_set_uri_derives_transport() {
        let session = Session::new();
        session.set_uri("ldaps://ldap.example.com/").unwrap();
        let config = session.config();
        assert_eq!(config.scheme(), ProtocolScheme::Ldaps);
        assert_eq!(config.port(), 636);
        assert_eq!(config.encryption(), EncryptionScheme::Ssl);

        assert!(session.set_uri("http://ldap.example.com/").is_err());
        assert_eq!(session.uri(), "ldaps://ldap.example.com/");
    }

    #[test]
    fn test_invalid_request_fails_without_runtime() {
        let session = Session::new();
        let op = session.search_many(Vec::<String>::new(), Scope::Subtree, "(cn=*)");
        assert_eq!(op.state(), OperationState::Failed);
        assert_eq!(op.status().unwrap().title(), "Search");
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let (state, session) = mock_session(1);
        state.set_delay(Duration::from_millis(20));
        let first = session.search("ou=a,dc=example,dc=com", Scope::Subtree, "(cn=*)");
        session.set_host("other.example.com");
        session.set_size_limit(10);
        let second = session.search("ou=b,dc=example,dc=com", Scope::Subtree, "(cn=*)");

        assert_eq!(first.config().host(), "ldap.example.com");
        assert_eq!(first.config().size_limit(), 0);
        assert_eq!(second.config().size_limit(), 10);
        assert!(first.wait().await.is_successful());
        assert!(second.wait().await.is_successful());
        // The connection opened by the first operation is reused.
        assert_eq!(*state.connected_hosts.lock().unwrap(), vec!["ldap.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_full_round_of_requests() {
        let (state, session) = mock_session(2);
        assert!(session.bind().wait().await.is_successful());
        assert!(session.is_connected());

        let who = session.who_am_i();
        who.wait().await;
        assert_eq!(who.authz_id().as_deref(), Some("dn:cn=admin,dc=example,dc=com"));

        let modify = session.modify(
            "cn=jdoe,dc=example,dc=com",
            vec![Modification::replace("jpegPhoto", [BerValue::new(vec![0xff, 0xd8, 0xff])])],
        );
        assert!(modify.wait().await.is_successful());

        let rename = session.rename("cn=jdoe,dc=example,dc=com", "cn=john", None, true);
        assert!(rename.wait().await.is_successful());

        assert!(session.delete("cn=john,dc=example,dc=com").wait().await.is_successful());
        assert!(session.unbind().wait().await.is_successful());
        assert!(!session.is_connected());
        assert!(session.unbind().wait().await.is_successful());

        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        let metrics = session.metrics();
        assert_eq!(metrics.requests(OperationKind::Unbind), 2);
        assert_eq!(metrics.connections(), 1);
    }

    #[tokio::test]
    async fn test_search_url_rejects_critical_extension() {
        let (state, session) = mock_session(1);
        let url = LdapUrl::parse("ldap://ldap.example.com/dc=example,dc=com??sub?(cn=*)?!x-unknown").unwrap();
        let op = session.search_url(&url);
        assert_eq!(op.state(), OperationState::Failed);
        assert_eq!(state.calls.load(Ordering::SeqCst), 0);

        let url = LdapUrl::parse("ldap://ldap.example.com/dc=example,dc=com?cn,mail?sub?(cn=*)").unwrap();
        let op = session.search_url(&url);
        assert!(op.wait().await.is_successful());
        assert_eq!(op.entries().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_are_exclusive() {
        let (state, session) = mock_session(8);
        state.set_delay(Duration::from_millis(1));
        let session = Arc::new(session);
        let mut handles = Vec::new();
        for t in 0..4 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let ops: Vec<Operation> = (0..8)
                    .map(|i| session.search(&format!("ou={}-{},dc=example,dc=com", t, i), Scope::Base, "(objectClass=*)"))
                    .collect();
                for op in ops {
                    assert!(op.wait().await.is_successful());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(state.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(state.searched_bases.lock().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_cancel_pending_makes_no_calls() {
        let (state, session) = mock_session(1);
        let op = session.who_am_i();
        op.cancel();
        assert!(op.wait().await.is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.connects.load(Ordering::SeqCst), 0);
    }
}
