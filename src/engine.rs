//! Executes operations against a session's shared connection.
//!
//! Each operation holds the connection lock from the moment it first needs
//! the connection until it finishes, so protocol exchanges of different
//! operations never interleave. Cancellation is checked before the lock is
//! taken, right after, and at every response wait.

use crate::config::{BindMethod, SessionConfig};
use crate::error::{InternalCode, Status, TransportError};
use crate::metrics::SessionMetrics;
use crate::operation::{Operation, Outcome, Request};
use crate::transport::{
    BindForm, Connection, Connector, ProtocolResult, RenameRequest, SearchRequest,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Slot = Option<Box<dyn Connection>>;

/// State shared by a session and the operations it submitted.
pub(crate) struct SessionShared {
    connector: Arc<dyn Connector>,
    connection: Mutex<Slot>,
    connected: AtomicBool,
    metrics: Arc<SessionMetrics>,
}

impl SessionShared {
    pub(crate) fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            metrics: Arc::new(SessionMetrics::new()),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// Why an operation stopped before a protocol result was available.
#[derive(Debug)]
enum Failure {
    Cancelled,
    Config(String),
    NotConnected,
    Transport(TransportError),
}

impl Failure {
    fn into_status(self, title: &str) -> Status {
        match self {
            Failure::Cancelled => Status::cancelled(title),
            Failure::Config(diag) => Status::internal(title, InternalCode::Unknown, Some(diag)),
            Failure::NotConnected => Status::internal(title, InternalCode::NotConnected, None),
            Failure::Transport(e) => Status::from_transport(title, &e),
        }
    }
}

/// Maps the snapshot's identity and SASL settings to a bind request.
pub(crate) fn bind_form(config: &SessionConfig) -> Result<BindForm, String> {
    let credentials = config.bind_credentials().map(<[u8]>::to_vec).unwrap_or_default();
    match (config.bind_method(), config.bind_who()) {
        (BindMethod::Anonymous, _) => Ok(BindForm::Anonymous),
        (BindMethod::Simple, Some(who)) => Ok(BindForm::Simple {
            who: who.to_string(),
            credentials,
        }),
        (BindMethod::Sasl, Some(who)) => {
            let mechanism = config.sasl_mechanism().filter(|m| !m.is_empty());
            let realm = config.sasl_realm().filter(|r| !r.is_empty());
            if mechanism.is_none() && realm.is_none() {
                return Err("SASL bind requires a mechanism or a realm".to_string());
            }
            Ok(BindForm::Sasl {
                who: who.to_string(),
                mechanism: mechanism.map(str::to_string),
                realm: realm.map(str::to_string),
                credentials,
            })
        }
        (method, None) => Err(format!("{:?} bind requires an identity", method)),
    }
}

fn protocol_status(title: &str, result: &ProtocolResult) -> Status {
    if result.is_success() {
        Status::success(title)
    } else {
        let diagnostic = if result.message.is_empty() && !result.matched_dn.is_empty() {
            format!("matched DN: {}", result.matched_dn)
        } else {
            result.message.clone()
        };
        Status::protocol(title, i64::from(result.code), Some(diagnostic))
    }
}

/// Awaits one transport call, bounded by the network timeout and abandoned on cancellation.
async fn exchange<T, F>(op: &Operation, timeout: Option<Duration>, call: F) -> Result<T, Failure>
where
    F: Future<Output = Result<T, TransportError>>,
{
    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => call.await,
        }
    };
    tokio::select! {
        biased;
        _ = op.cancellation_token().cancelled() => Err(Failure::Cancelled),
        result = timed => result.map_err(Failure::Transport),
    }
}

fn checkpoint(op: &Operation) -> Result<(), Failure> {
    if op.is_cancel_requested() {
        Err(Failure::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs one dispatched operation to its terminal state.
pub(crate) async fn execute(shared: &SessionShared, op: &Operation) {
    if !op.begin() {
        debug!("Operation {} ({}) cancelled before dispatch", op.id(), op.kind());
        return;
    }
    let kind = op.kind();
    let started = Instant::now();
    shared.metrics.inc_request(kind);
    debug!("Executing operation {} ({})", op.id(), kind);

    let mut outcome = Outcome::default();
    let status = match run(shared, op, &mut outcome).await {
        Ok(status) => status,
        Err(failure) => failure.into_status(kind.title()),
    };
    shared.metrics.observe_duration(kind, started.elapsed());
    if status.is_cancelled() {
        shared.metrics.inc_cancelled(kind);
        info!("Operation {} ({}) cancelled", op.id(), kind);
    } else if !status.is_successful() {
        shared.metrics.inc_error(kind);
        warn!("Operation {} ({}) failed: {}", op.id(), kind, status);
    }
    op.finish(outcome, status);
}

async fn run(shared: &SessionShared, op: &Operation, out: &mut Outcome) -> Result<Status, Failure> {
    let kind = op.kind();
    let title = kind.title();
    checkpoint(op)?;
    let mut slot = tokio::select! {
        biased;
        _ = op.cancellation_token().cancelled() => return Err(Failure::Cancelled),
        guard = shared.connection.lock() => guard,
    };
    checkpoint(op)?;
    let slot = &mut *slot;

    match op.request() {
        Request::Unbind => {
            match slot.take() {
                Some(mut conn) => {
                    if let Err(e) = conn.unbind().await {
                        debug!("Unbind from {} failed: {}", op.config().connection_url(), e);
                    }
                    shared.set_connected(false);
                    info!("Disconnected from {}", op.config().connection_url());
                }
                None => debug!("Unbind requested while not connected"),
            }
            Ok(Status::success(title))
        }
        Request::Rebind => {
            if let Some(mut conn) = slot.take() {
                if let Err(e) = conn.unbind().await {
                    debug!("Unbind before rebind from {} failed: {}", op.config().connection_url(), e);
                }
                shared.set_connected(false);
            }
            Ok(establish(shared, op, slot)
                .await?
                .unwrap_or_else(|| Status::success(title)))
        }
        Request::Bind => {
            if slot.is_none() {
                return Ok(establish(shared, op, slot)
                    .await?
                    .unwrap_or_else(|| Status::success(title)));
            }
            let form = bind_form(op.config()).map_err(Failure::Config)?;
            let timeout = op.config().network_timeout();
            let conn = slot.as_mut().ok_or(Failure::NotConnected)?;
            let result = exchange(op, timeout, conn.bind(&form)).await;
            let result = settle(shared, op, slot, result).await?;
            debug!("BIND as {:?} on existing connection returned rc={}", op.config().bind_who(), result.code);
            Ok(protocol_status(title, &result))
        }
        request => {
            if slot.is_none() {
                if let Some(failed) = establish(shared, op, slot).await? {
                    return Ok(failed);
                }
            }
            perform(shared, op, slot, request, out).await
        }
    }
}

/// Opens a connection with the operation's snapshot and binds on it.
/// Returns the failed bind status, or `None` once connected.
async fn establish(shared: &SessionShared, op: &Operation, slot: &mut Slot) -> Result<Option<Status>, Failure> {
    let config = op.config();
    let form = bind_form(config).map_err(Failure::Config)?;
    let url = config.connection_url();
    let timeout = config.network_timeout();
    debug!("Connecting to {} for operation {}", url, op.id());

    let mut conn = match exchange(op, timeout, shared.connector.connect(config)).await {
        Ok(conn) => conn,
        Err(failure) => {
            if matches!(failure, Failure::Transport(_)) {
                shared.metrics.inc_connection_failures();
            }
            return Err(failure);
        }
    };
    shared.metrics.inc_connections();

    let result = match exchange(op, timeout, conn.bind(&form)).await {
        Ok(result) => result,
        Err(failure) => {
            if matches!(failure, Failure::Cancelled) {
                let _ = conn.abandon().await;
            }
            return Err(failure);
        }
    };
    if !result.is_success() {
        warn!("BIND to {} rejected with rc={}: {}", url, result.code, result.message);
        return Ok(Some(protocol_status(op.kind().title(), &result)));
    }
    info!("Connected to {} as {:?}", url, config.bind_who().unwrap_or("anonymous"));
    *slot = Some(conn);
    shared.set_connected(true);
    Ok(None)
}

/// Cleans up after a failed exchange on the shared connection.
async fn settle<T>(
    shared: &SessionShared,
    op: &Operation,
    slot: &mut Slot,
    result: Result<T, Failure>,
) -> Result<T, Failure> {
    match result {
        Err(Failure::Cancelled) => {
            if let Some(conn) = slot.as_mut() {
                let abandon = conn.abandon();
                let abandoned = match op.config().network_timeout() {
                    Some(limit) => tokio::time::timeout(limit, abandon)
                        .await
                        .unwrap_or(Err(TransportError::Timeout)),
                    None => abandon.await,
                };
                if let Err(e) = abandoned {
                    debug!("Abandon for operation {} failed: {}", op.id(), e);
                }
            }
            Err(Failure::Cancelled)
        }
        Err(Failure::Transport(e)) if e.is_fatal() => {
            warn!("Dropping connection to {}: {}", op.config().connection_url(), e);
            *slot = None;
            shared.set_connected(false);
            Err(Failure::Transport(e))
        }
        other => other,
    }
}

async fn perform(
    shared: &SessionShared,
    op: &Operation,
    slot: &mut Slot,
    request: &Request,
    out: &mut Outcome,
) -> Result<Status, Failure> {
    let config = op.config();
    let title = op.kind().title();
    let timeout = config.network_timeout();

    match request {
        Request::Search(params) => {
            for base in &params.bases {
                debug!(
                    "Handling SEARCH request: base={}, scope={:?}, filter={}",
                    base, params.scope, params.filter
                );
                let search = SearchRequest {
                    base: base.clone(),
                    scope: params.scope,
                    filter: params.filter.clone(),
                    attributes: params.attributes.clone(),
                    attributes_only: params.attributes_only,
                    size_limit: config.size_limit(),
                    time_limit: config.search_time_limit(),
                };
                let conn = slot.as_mut().ok_or(Failure::NotConnected)?;
                let response = exchange(op, timeout, conn.search(&search)).await;
                let response = settle(shared, op, slot, response).await?;

                out.entries.extend(response.entries);
                out.referrals.extend(response.references);
                out.referrals.extend(response.result.referrals.iter().cloned());
                if !response.result.matched_dn.is_empty() {
                    out.matched_dns.push(response.result.matched_dn.clone());
                }
                if !response.result.is_success() {
                    return Ok(protocol_status(title, &response.result));
                }
            }
            debug!("SEARCH returned {} entries", out.entries.len());
            Ok(Status::success(title))
        }
        Request::Delete { dn } => {
            debug!("Handling DELETE request: dn={}", dn);
            let conn = slot.as_mut().ok_or(Failure::NotConnected)?;
            let result = exchange(op, timeout, conn.delete(dn)).await;
            let result = settle(shared, op, slot, result).await?;
            Ok(protocol_status(title, &result))
        }
        Request::Modify { dn, modifications } => {
            debug!("Handling MODIFY request: dn={}, {} changes", dn, modifications.len());
            let conn = slot.as_mut().ok_or(Failure::NotConnected)?;
            let result = exchange(op, timeout, conn.modify(dn, modifications)).await;
            let result = settle(shared, op, slot, result).await?;
            Ok(protocol_status(title, &result))
        }
        Request::Rename(params) => {
            debug!("Handling MODDN request: dn={}, new_rdn={}", params.dn, params.new_rdn);
            let rename = RenameRequest {
                dn: params.dn.clone(),
                new_rdn: params.new_rdn.clone(),
                new_superior: params.new_superior.clone(),
                delete_old_rdn: params.delete_old_rdn,
            };
            let conn = slot.as_mut().ok_or(Failure::NotConnected)?;
            let result = exchange(op, timeout, conn.rename(&rename)).await;
            let result = settle(shared, op, slot, result).await?;
            Ok(protocol_status(title, &result))
        }
        Request::WhoAmI => {
            debug!("Handling EXTENDED WhoAmI request");
            let conn = slot.as_mut().ok_or(Failure::NotConnected)?;
            let response = exchange(op, timeout, conn.who_am_i()).await;
            let (result, authz_id) = settle(shared, op, slot, response).await?;
            out.authz_id = authz_id;
            Ok(protocol_status(title, &result))
        }
        Request::Bind | Request::Unbind | Request::Rebind => {
            Err(Failure::Config(format!("{} is not a directory request", op.kind())))
        }
    }
}

#[cfg(test)]
impl SessionShared {
    pub(crate) fn for_tests(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self::new(connector))
    }
}
