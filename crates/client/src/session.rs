//! Compute session pool.
//!
//! Session startup is slow, so a small reserve of ready sessions is kept per
//! compute context. Taking a session triggers a background refill; refill
//! failures are recorded and reported only if a later caller also fails to
//! get a session synchronously.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use sasjs_config::AdapterConfig;

use crate::auth::Credentials;
use crate::error::Error;
use crate::models::{Context, HasLinks, Items, Session};
use crate::poll::state_text;
use crate::request::{Call, RequestClient};
use crate::transport::{Method, RequestBody};

pub const DEFAULT_POOL_SIZE: usize = 1;
/// Server-side wait window for session state reads.
const SESSION_STATE_WAIT_SECS: u64 = 30;

/// Shared handle to one context's session pool. Clones share the pool.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionRegistry>,
}

struct SessionRegistry {
    client: Arc<RequestClient>,
    context_name: String,
    max_pool_size: usize,
    poll_interval: Duration,
    max_error_count: u32,
    pool: Mutex<VecDeque<Session>>,
    context: Mutex<Option<Context>>,
    refill: Mutex<Option<JoinHandle<()>>>,
    refill_errors: Mutex<Vec<Error>>,
    empty_state_statuses: Mutex<HashSet<u16>>,
}

impl SessionManager {
    pub fn new(client: Arc<RequestClient>, config: &AdapterConfig) -> Self {
        Self::with_pool_size(client, config, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(client: Arc<RequestClient>, config: &AdapterConfig, max_pool_size: usize) -> Self {
        Self {
            inner: Arc::new(SessionRegistry {
                client,
                context_name: config.context_name.clone(),
                max_pool_size,
                poll_interval: config.poll_interval(),
                max_error_count: config.max_error_count,
                pool: Mutex::new(VecDeque::new()),
                context: Mutex::new(None),
                refill: Mutex::new(None),
                refill_errors: Mutex::new(Vec::new()),
                empty_state_statuses: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn context_name(&self) -> &str {
        &self.inner.context_name
    }

    /// Sessions ready in the pool.
    pub fn pool_len(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// A ready session: from the pool when possible, otherwise created now.
    /// Either way the pool is refilled in the background.
    pub fn get_session(&self, credentials: &Credentials) -> Result<Session, Error> {
        let token = credentials.access_token(&self.inner.client)?;
        self.inner.prune_expired();

        let pooled = self.inner.pool.lock().pop_front();
        if let Some(session) = pooled {
            log::debug!("using pooled session {}", session.id);
            self.spawn_refill(token);
            return Ok(session);
        }

        match self.inner.create_session(token.as_deref()) {
            Ok(session) => {
                self.inner.refill_errors.lock().clear();
                self.spawn_refill(token);
                Ok(session)
            }
            Err(e) => {
                let mut errors = std::mem::take(&mut *self.inner.refill_errors.lock());
                errors.push(e);
                Err(Error::SessionCreation { errors })
            }
        }
    }

    /// Delete the session on the server and drop it from the pool.
    pub fn clear_session(&self, id: &str, credentials: &Credentials) -> Result<(), Error> {
        let token = credentials.access_token(&self.inner.client)?;
        self.inner
            .client
            .delete(&format!("/compute/sessions/{id}"), token.as_deref())?;
        self.inner.pool.lock().retain(|s| s.id != id);
        log::debug!("cleared session {}", id);
        Ok(())
    }

    /// Value of a macro variable in a session.
    pub fn get_variable(&self, session_id: &str, name: &str, credentials: &Credentials) -> Result<Value, Error> {
        let token = credentials.access_token(&self.inner.client)?;
        let response = self.inner.client.get(
            &format!("/compute/sessions/{session_id}/variables/{name}"),
            token.as_deref(),
        )?;
        Ok(response.result)
    }

    /// Block until the background refill, if any, has finished.
    pub fn wait_for_refill(&self) {
        let handle = self.inner.refill.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("session refill thread panicked");
            }
        }
    }

    fn spawn_refill(&self, token: Option<String>) {
        if self.inner.max_pool_size == 0 {
            return;
        }
        let mut slot = self.inner.refill.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if let Some(done) = slot.take() {
            let _ = done.join();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("sasjs-session-refill".to_string())
            .spawn(move || inner.refill(token.as_deref()));
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => self.inner.refill_errors.lock().push(Error::Io(e)),
        }
    }
}

impl SessionRegistry {
    fn prune_expired(&self) {
        let now = Utc::now();
        let mut pool = self.pool.lock();
        let before = pool.len();
        pool.retain(|s| !s.is_expired(now));
        if pool.len() < before {
            log::debug!("dropped {} expired session(s)", before - pool.len());
        }
    }

    fn refill(&self, token: Option<&str>) {
        while self.pool.lock().len() < self.max_pool_size {
            match self.create_session(token) {
                Ok(session) => {
                    log::debug!("session {} added to pool", session.id);
                    self.pool.lock().push_back(session);
                }
                Err(e) => {
                    log::error!("background session refill failed: {}", e);
                    self.refill_errors.lock().push(e);
                    break;
                }
            }
        }
    }

    /// Context for `context_name`, looked up once.
    fn context(&self, token: Option<&str>) -> Result<Context, Error> {
        let mut cached = self.context.lock();
        if let Some(context) = cached.as_ref() {
            return Ok(context.clone());
        }

        let filter: String =
            url::form_urlencoded::byte_serialize(format!("eq(name,\"{}\")", self.context_name).as_bytes())
                .collect();
        let response = self
            .client
            .get(&format!("/compute/contexts?filter={filter}"), token)?;
        let contexts: Items<Context> = serde_json::from_value(response.result)?;
        let context = contexts
            .items
            .into_iter()
            .find(|c| c.name == self.context_name)
            .ok_or_else(|| Error::ContextNotFound(self.context_name.clone()))?;

        log::debug!("compute context '{}' is {}", context.name, context.id);
        *cached = Some(context.clone());
        Ok(context)
    }

    fn create_session(&self, token: Option<&str>) -> Result<Session, Error> {
        let context = self.context(token)?;
        let response = self.client.post(
            &format!("/compute/contexts/{}/sessions", context.id),
            RequestBody::Json(json!({})),
            token,
        )?;
        let etag = response.etag.clone();
        let session: Session = serde_json::from_value(response.result)?;
        log::info!("created session {} in context '{}'", session.id, context.name);
        self.wait_until_ready(session, etag.as_deref(), token)
    }

    /// Long-poll the session state until it leaves pending/running.
    /// Empty states are tolerated without limit.
    fn wait_until_ready(&self, mut session: Session, etag: Option<&str>, token: Option<&str>) -> Result<Session, Error> {
        if !matches!(session.state.as_str(), "pending" | "running" | "") {
            return self.check_ready(session);
        }

        let href = session
            .link("state")
            .ok_or_else(|| Error::missing_link("state", format!("session {}", session.id)))?
            .href
            .clone();
        let url = format!("{href}?wait={SESSION_STATE_WAIT_SECS}");
        let mut error_count = 0;

        loop {
            let mut call = Call::new(Method::Get, &url).token(token);
            if let Some(etag) = etag {
                call = call.header("If-None-Match", etag);
            }

            match self.client.send(call) {
                Ok(response) => {
                    error_count = 0;
                    let state = state_text(&response.result);
                    if state.is_empty() {
                        if self.empty_state_statuses.lock().insert(response.status) {
                            log::warn!(
                                "session {} returned an empty state (HTTP {}), retrying",
                                session.id,
                                response.status
                            );
                        }
                    } else if state != session.state {
                        log::info!("session {} state: {} -> {}", session.id, session.state, state);
                        session.state = state;
                    }
                }
                Err(e) if e.is_login_required() => return Err(e),
                Err(e) => {
                    error_count += 1;
                    log::warn!("reading state of session {} failed: {}", session.id, e);
                    if error_count > self.max_error_count {
                        return Err(e);
                    }
                }
            }

            if !matches!(session.state.as_str(), "pending" | "running" | "") {
                return self.check_ready(session);
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn check_ready(&self, session: Session) -> Result<Session, Error> {
        match session.state.as_str() {
            "failed" | "error" => Err(Error::SessionFailed {
                id: session.id,
                state: session.state,
            }),
            _ => Ok(session),
        }
    }
}
