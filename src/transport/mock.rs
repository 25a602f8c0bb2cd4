//! Scripted in-memory transport for engine tests.

use super::*;
use crate::value::BerValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MockState {
    pub connects: AtomicUsize,
    /// Requests issued on any connection, binds included.
    pub calls: AtomicUsize,
    pub unbinds: AtomicUsize,
    pub abandons: AtomicUsize,
    pub overlaps: AtomicUsize,
    in_use: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_unbind: AtomicBool,
    /// Searches never answer while set.
    pub hang_searches: AtomicBool,
    pub delay: Mutex<Duration>,
    pub binds: Mutex<Vec<BindForm>>,
    pub searched_bases: Mutex<Vec<String>>,
    pub connected_hosts: Mutex<Vec<String>>,
    /// Result code to answer for a given search base.
    pub search_failures: Mutex<HashMap<String, u32>>,
    pub bind_code: Mutex<u32>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_search(&self, base: &str, code: u32) {
        self.search_failures.lock().unwrap().insert(base.to_string(), code);
    }

    async fn exchange(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.in_use.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_use.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct MockConnector {
    pub state: Arc<MockState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn Connection>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{} refused", config.connection_url())));
        }
        self.state
            .connected_hosts
            .lock()
            .unwrap()
            .push(config.host().to_string());
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn bind(&mut self, form: &BindForm) -> Result<ProtocolResult, TransportError> {
        self.state.exchange().await;
        self.state.binds.lock().unwrap().push(form.clone());
        let code = *self.state.bind_code.lock().unwrap();
        Ok(ProtocolResult::with_code(code, ""))
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchResponse, TransportError> {
        if self.state.hang_searches.load(Ordering::SeqCst) {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        self.state.exchange().await;
        self.state
            .searched_bases
            .lock()
            .unwrap()
            .push(request.base.clone());
        if let Some(code) = self.state.search_failures.lock().unwrap().get(&request.base) {
            return Ok(SearchResponse {
                entries: Vec::new(),
                references: Vec::new(),
                result: ProtocolResult {
                    code: *code,
                    matched_dn: "dc=example,dc=com".to_string(),
                    message: format!("failed on {}", request.base),
                    referrals: Vec::new(),
                },
            });
        }
        let mut entry = Entry::new(format!("cn=entry,{}", request.base));
        entry.push_values("cn".to_string(), [BerValue::from("entry")]);
        Ok(SearchResponse {
            entries: vec![entry],
            references: vec![format!("ldap://replica.example.com/{}", request.base)],
            result: ProtocolResult::success(),
        })
    }

    async fn delete(&mut self, _dn: &str) -> Result<ProtocolResult, TransportError> {
        self.state.exchange().await;
        Ok(ProtocolResult::success())
    }

    async fn modify(&mut self, _dn: &str, mods: &[Modification]) -> Result<ProtocolResult, TransportError> {
        self.state.exchange().await;
        if mods.is_empty() {
            return Ok(ProtocolResult::with_code(2, "empty modification list"));
        }
        Ok(ProtocolResult::success())
    }

    async fn rename(&mut self, request: &RenameRequest) -> Result<ProtocolResult, TransportError> {
        self.state.exchange().await;
        if request.new_rdn.contains('=') {
            Ok(ProtocolResult::success())
        } else {
            Ok(ProtocolResult::with_code(34, "invalid RDN"))
        }
    }

    async fn who_am_i(&mut self) -> Result<(ProtocolResult, Option<String>), TransportError> {
        self.state.exchange().await;
        let who = match self.state.binds.lock().unwrap().last() {
            Some(BindForm::Simple { who, .. }) | Some(BindForm::Sasl { who, .. }) => format!("dn:{}", who),
            _ => String::new(),
        };
        Ok((ProtocolResult::success(), Some(who)))
    }

    async fn unbind(&mut self) -> Result<(), TransportError> {
        self.state.unbinds.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_unbind.load(Ordering::SeqCst) {
            return Err(TransportError::ServerDown("connection reset".to_string()));
        }
        Ok(())
    }

    async fn abandon(&mut self) -> Result<(), TransportError> {
        self.state.abandons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
