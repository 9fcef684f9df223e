//! Job executors.
//!
//! One [`JobProtocol`] per server execution API. [`Executor`] wraps a
//! protocol with the behavior they all share: a call that needs a fresh login
//! is parked in a FIFO queue and replayed by [`Executor::resend_waiting_requests`]
//! once the caller has logged in again.

mod compute;
mod form;
mod jes;
mod sas9;
mod sasjs;
mod web;

pub use compute::ComputeExecutor;
pub use jes::JesExecutor;
pub use sas9::Sas9Executor;
pub use sasjs::{split_output, SasjsExecutor, SasjsOutput, SASJS_LOGS_SEPARATOR};
pub use web::WebExecutor;

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use sasjs_config::AdapterConfig;
use sasjs_tables::TableSet;

use crate::auth::Credentials;
use crate::error::Error;

/// `_debug` level requested by debug runs (log plus diagnostics).
pub(crate) const DEBUG_LEVEL: u32 = 131;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Compute,
    Jes,
    Web,
    Sas9,
    Sasjs,
}

/// Everything needed to run, or re-run, one job.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    /// Absolute (`/Public/app/x`) or relative to `config.app_loc`
    pub job_path: String,
    pub data: Option<TableSet>,
    pub config: AdapterConfig,
    pub credentials: Credentials,
    /// Fields of the finished job merged into the response (JES only)
    pub extra_attributes: Vec<String>,
}

impl ExecuteParams {
    pub fn new(job_path: impl Into<String>, config: AdapterConfig) -> Self {
        Self {
            job_path: job_path.into(),
            data: None,
            config,
            credentials: Credentials::None,
            extra_attributes: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: TableSet) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_extra_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Full program path: relative paths resolve under `app_loc`.
    pub fn program(&self) -> String {
        resolve_program(&self.config.app_loc, &self.job_path)
    }
}

pub fn resolve_program(app_loc: &str, job_path: &str) -> String {
    if job_path.starts_with('/') {
        job_path.to_string()
    } else {
        format!(
            "{}/{}",
            app_loc.trim_end_matches('/'),
            job_path.trim_start_matches('/')
        )
    }
}

/// Arguments common to jobs submitted through the Viya APIs.
pub(crate) fn job_arguments(config: &AdapterConfig) -> Value {
    let mut arguments = json!({
        "_contextName": config.context_name,
        "_OMITJSONLISTING": true,
        "_OMITJSONLOG": true,
        "_OMITSESSIONRESULTS": true,
        "_OMITTEXTLISTING": true,
        "_OMITTEXTLOG": true,
    });
    if config.debug {
        arguments["_OMITTEXTLOG"] = json!(false);
        arguments["_OMITSESSIONRESULTS"] = json!(false);
        arguments["_DEBUG"] = json!(DEBUG_LEVEL);
    }
    arguments
}

/// One server execution API.
pub trait JobProtocol: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Submit the job and wait for its parsed result.
    fn run(&self, params: &ExecuteParams) -> Result<Value, Error>;
}

/// Called when a call is parked waiting for a login.
pub type LoginCallback = Arc<dyn Fn() + Send + Sync>;

type Responder = mpsc::Sender<Result<Value, Error>>;

struct WaitingRequest {
    params: ExecuteParams,
    responder: Responder,
    on_login_required: LoginCallback,
}

/// A protocol plus the login-recovery queue.
pub struct Executor {
    protocol: Arc<dyn JobProtocol>,
    waiting: Mutex<VecDeque<WaitingRequest>>,
}

impl Executor {
    pub fn new(protocol: Arc<dyn JobProtocol>) -> Self {
        Self {
            protocol,
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        self.protocol.kind()
    }

    /// Run a job. If it needs a fresh login and `on_login_required` is
    /// given, the call is queued, the callback is invoked, and this blocks
    /// until the queue is replayed (returning the replayed result) or
    /// discarded (returning [`Error::LoginRequired`]). Without a callback
    /// nothing could start a login, so the error is returned as is.
    pub fn execute(
        &self,
        params: ExecuteParams,
        on_login_required: Option<LoginCallback>,
    ) -> Result<Value, Error> {
        match self.protocol.run(&params) {
            Err(e) if e.is_login_required() => {
                let Some(callback) = on_login_required else {
                    return Err(e);
                };
                log::info!("{} needs a login, queueing", params.program());
                let (responder, outcome) = mpsc::channel();
                self.waiting.lock().push_back(WaitingRequest {
                    params,
                    responder,
                    on_login_required: callback.clone(),
                });
                callback();
                outcome.recv().unwrap_or(Err(e))
            }
            other => other,
        }
    }

    /// Replay every queued call in the order it was queued. A call that
    /// needs a login again goes back on the queue.
    pub fn resend_waiting_requests(&self) {
        let queued: Vec<WaitingRequest> = self.waiting.lock().drain(..).collect();
        if !queued.is_empty() {
            log::info!("replaying {} waiting request(s)", queued.len());
        }

        for request in queued {
            match self.protocol.run(&request.params) {
                Err(e) if e.is_login_required() => {
                    log::debug!("{} still needs a login", request.params.program());
                    let callback = request.on_login_required.clone();
                    self.waiting.lock().push_back(request);
                    callback();
                }
                result => {
                    // The caller may have gone away; nothing to deliver to then.
                    let _ = request.responder.send(result);
                }
            }
        }
    }

    /// Drop queued calls; their callers get `LoginRequired`.
    pub fn discard_waiting_requests(&self) {
        let dropped = std::mem::take(&mut *self.waiting.lock());
        if !dropped.is_empty() {
            log::info!("discarded {} waiting request(s)", dropped.len());
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }
}
