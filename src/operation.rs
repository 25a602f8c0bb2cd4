//! One queued directory request and its lifecycle.

use crate::config::{Scope, SessionConfig};
use crate::entry::Entry;
use crate::error::{InternalCode, Status};
use crate::modification::Modification;
use crate::url::LdapUrl;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Bind,
    Unbind,
    Rebind,
    Search,
    Delete,
    Rename,
    Modify,
    WhoAmI,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Bind,
        OperationKind::Unbind,
        OperationKind::Rebind,
        OperationKind::Search,
        OperationKind::Delete,
        OperationKind::Rename,
        OperationKind::Modify,
        OperationKind::WhoAmI,
    ];

    /// Human-readable title carried by the operation's status.
    pub fn title(&self) -> &'static str {
        match self {
            OperationKind::Bind => "Bind",
            OperationKind::Unbind => "Unbind",
            OperationKind::Rebind => "Rebind",
            OperationKind::Search => "Search",
            OperationKind::Delete => "Delete",
            OperationKind::Rename => "Rename",
            OperationKind::Modify => "Modify",
            OperationKind::WhoAmI => "Who Am I",
        }
    }

    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Bind => "bind",
            OperationKind::Unbind => "unbind",
            OperationKind::Rebind => "rebind",
            OperationKind::Search => "search",
            OperationKind::Delete => "delete",
            OperationKind::Rename => "rename",
            OperationKind::Modify => "modify",
            OperationKind::WhoAmI => "whoami",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Pending,
    Executing,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Parameters of a search over one or more base DNs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub bases: Vec<String>,
    pub scope: Scope,
    pub filter: String,
    /// Empty requests all user attributes.
    pub attributes: Vec<String>,
    pub attributes_only: bool,
}

impl SearchParams {
    pub fn new(base: impl Into<String>, scope: Scope, filter: impl Into<String>) -> Self {
        Self::with_bases([base.into()], scope, filter)
    }

    pub fn with_bases<I, S>(bases: I, scope: Scope, filter: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bases: bases.into_iter().map(Into::into).collect(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            attributes_only: false,
        }
    }

    /// Base, scope, filter and attributes taken from a directory URL.
    pub fn from_url(url: &LdapUrl) -> Self {
        Self {
            bases: vec![url.dn().to_string()],
            scope: url.scope(),
            filter: url.filter().to_string(),
            attributes: url.attributes().to_vec(),
            attributes_only: false,
        }
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn attributes_only(mut self, only: bool) -> Self {
        self.attributes_only = only;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameParams {
    pub dn: String,
    pub new_rdn: String,
    /// Moves the entry under a new parent when set.
    pub new_superior: Option<String>,
    pub delete_old_rdn: bool,
}

/// What an operation asks the directory to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind,
    Unbind,
    Rebind,
    Search(SearchParams),
    Delete { dn: String },
    Rename(RenameParams),
    Modify { dn: String, modifications: Vec<Modification> },
    WhoAmI,
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Bind => OperationKind::Bind,
            Request::Unbind => OperationKind::Unbind,
            Request::Rebind => OperationKind::Rebind,
            Request::Search(_) => OperationKind::Search,
            Request::Delete { .. } => OperationKind::Delete,
            Request::Rename(_) => OperationKind::Rename,
            Request::Modify { .. } => OperationKind::Modify,
            Request::WhoAmI => OperationKind::WhoAmI,
        }
    }

    /// Checks required parameters; the error is a diagnostic for the caller.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Request::Search(params) => {
                if params.bases.is_empty() {
                    return Err("search requires at least one base DN".to_string());
                }
                if params.bases.iter().any(|b| b.trim().is_empty()) {
                    return Err("search base DN must not be empty".to_string());
                }
                Ok(())
            }
            Request::Delete { dn } | Request::Modify { dn, .. } if dn.trim().is_empty() => {
                Err(format!("{} requires a DN", self.kind()))
            }
            Request::Rename(params) => {
                if params.dn.trim().is_empty() {
                    return Err("rename requires a DN".to_string());
                }
                if params.new_rdn.trim().is_empty() {
                    return Err("rename requires a new RDN".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Results gathered by the engine, committed in one step when the operation finishes.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub entries: Vec<Entry>,
    pub referrals: Vec<String>,
    pub matched_dns: Vec<String>,
    pub authz_id: Option<String>,
}

#[derive(Default)]
struct Output {
    status: Option<Status>,
    outcome: Outcome,
}

type Callback = Box<dyn FnOnce(&Operation) + Send>;

struct OperationInner {
    id: u64,
    config: Arc<SessionConfig>,
    request: Request,
    output: Mutex<Output>,
    state: watch::Sender<OperationState>,
    cancel: CancellationToken,
    tag: AtomicI64,
    object: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Vec<Callback>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one submitted request.
///
/// Cloning is cheap and every clone observes the same operation. Outputs are
/// empty until the operation reaches a terminal state and never change after.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    pub(crate) fn new(id: u64, config: Arc<SessionConfig>, request: Request) -> Self {
        let (state, _) = watch::channel(OperationState::Pending);
        Self {
            inner: Arc::new(OperationInner {
                id,
                config,
                request,
                output: Mutex::new(Output::default()),
                state,
                cancel: CancellationToken::new(),
                tag: AtomicI64::new(0),
                object: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// An operation that failed validation and never reaches the queue.
    pub(crate) fn rejected(id: u64, config: Arc<SessionConfig>, request: Request, diagnostic: String) -> Self {
        let op = Self::new(id, config, request);
        let status = Status::internal(op.kind().title(), InternalCode::Unknown, Some(diagnostic));
        op.finish(Outcome::default(), status);
        op
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.request.kind()
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Configuration captured when the operation was created.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> OperationState {
        *self.inner.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn status(&self) -> Option<Status> {
        lock(&self.inner.output).status.clone()
    }

    pub fn is_successful(&self) -> bool {
        self.status().is_some_and(|s| s.is_successful())
    }

    pub fn entries(&self) -> Vec<Entry> {
        lock(&self.inner.output).outcome.entries.clone()
    }

    pub fn referrals(&self) -> Vec<String> {
        lock(&self.inner.output).outcome.referrals.clone()
    }

    pub fn matched_dns(&self) -> Vec<String> {
        lock(&self.inner.output).outcome.matched_dns.clone()
    }

    /// Authorization identity reported by a who-am-I request.
    pub fn authz_id(&self) -> Option<String> {
        lock(&self.inner.output).outcome.authz_id.clone()
    }

    pub fn tag(&self) -> i64 {
        self.inner.tag.load(Ordering::Relaxed)
    }

    pub fn set_tag(&self, tag: i64) {
        self.inner.tag.store(tag, Ordering::Relaxed);
    }

    pub fn object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        lock(&self.inner.object).clone()
    }

    /// The associated object, if one is set and has type `T`.
    pub fn object_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.object().and_then(|o| o.downcast::<T>().ok())
    }

    pub fn set_object<T: Any + Send + Sync>(&self, object: T) {
        *lock(&self.inner.object) = Some(Arc::new(object));
    }

    pub fn clear_object(&self) {
        *lock(&self.inner.object) = None;
    }

    /// Requests cancellation. A pending operation is cancelled on the spot;
    /// an executing one stops at its next checkpoint. No effect once finished.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        self.settle(
            Outcome::default(),
            Status::cancelled(self.kind().title()),
            |s| *s == OperationState::Pending,
        );
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Receiver of state changes, starting from the current state.
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.inner.state.subscribe()
    }

    /// Waits until the operation is finished and returns its status.
    pub async fn wait(&self) -> Status {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(OperationState::is_terminal).await;
        self.status().unwrap_or_else(|| {
            Status::internal(self.kind().title(), InternalCode::Unknown, Some("no status recorded".to_string()))
        })
    }

    /// Blocking variant of [`wait`](Self::wait) for synchronous callers.
    /// Must not be called from inside an async runtime worker.
    pub fn wait_blocking(&self) -> Status {
        futures::executor::block_on(self.wait())
    }

    /// Runs `callback` once the operation finishes, or right away if it already has.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Operation) + Send + 'static,
    {
        {
            let mut callbacks = lock(&self.inner.callbacks);
            if !self.state().is_terminal() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Pending -> Executing. False if the operation was cancelled before dispatch.
    pub(crate) fn begin(&self) -> bool {
        self.inner.state.send_if_modified(|s| {
            if *s == OperationState::Pending {
                *s = OperationState::Executing;
                true
            } else {
                false
            }
        })
    }

    /// Records the final outcome. Only the first call has any effect.
    pub(crate) fn finish(&self, outcome: Outcome, status: Status) -> bool {
        self.settle(outcome, status, |s| !s.is_terminal())
    }

    fn settle(&self, outcome: Outcome, status: Status, allowed: impl Fn(&OperationState) -> bool) -> bool {
        let next = if status.is_successful() {
            OperationState::Succeeded
        } else if status.is_cancelled() {
            OperationState::Cancelled
        } else {
            OperationState::Failed
        };
        {
            // Readers woken by the state change block on this lock until outputs are in place.
            let mut output = lock(&self.inner.output);
            let changed = self.inner.state.send_if_modified(|s| {
                if allowed(s) {
                    *s = next;
                    true
                } else {
                    false
                }
            });
            if !changed {
                return false;
            }
            output.status = Some(status);
            output.outcome = outcome;
        }
        let callbacks = std::mem::take(&mut *lock(&self.inner.callbacks));
        for callback in callbacks {
            callback(self);
        }
        true
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("tag", &self.tag())
            .finish()
    }
}
