//! The adapter: one request client, one session pool, one history and an
//! executor per execution API, with requests routed by server type.

use std::sync::Arc;

use serde_json::Value;

use sasjs_config::{AdapterConfig, ServerType};
use sasjs_tables::TableSet;

use crate::auth::Credentials;
use crate::error::Error;
use crate::executor::{
    ComputeExecutor, ExecuteParams, Executor, ExecutorKind, JesExecutor, LoginCallback,
    Sas9Executor, SasjsExecutor, WebExecutor,
};
use crate::history::{RequestHistory, SasjsRequest};
use crate::job_definition::JobDefinitionStore;
use crate::request::{CsrfScope, CsrfToken, RequestClient};
use crate::session::SessionManager;
use crate::transport::Transport;

/// Executor for a configuration.
pub fn route(config: &AdapterConfig) -> ExecutorKind {
    match (config.server_type, config.use_compute_api) {
        (ServerType::SasViya, Some(true)) => ExecutorKind::Compute,
        (ServerType::SasViya, Some(false)) => ExecutorKind::Jes,
        (ServerType::SasViya, None) => ExecutorKind::Web,
        (ServerType::Sas9, _) => ExecutorKind::Sas9,
        (ServerType::Sasjs, _) => ExecutorKind::Sasjs,
    }
}

pub struct Sasjs {
    config: AdapterConfig,
    client: Arc<RequestClient>,
    sessions: SessionManager,
    history: Arc<RequestHistory>,
    compute: Executor,
    jes: Executor,
    web: Executor,
    sas9: Executor,
    sasjs: Executor,
}

impl Sasjs {
    pub fn new(config: AdapterConfig) -> Result<Self, Error> {
        let client = RequestClient::new(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Adapter over a custom transport.
    pub fn with_transport(config: AdapterConfig, transport: Arc<dyn Transport>) -> Self {
        let client = RequestClient::with_transport(&config, transport);
        Self::with_client(config, client)
    }

    pub fn with_client(config: AdapterConfig, client: RequestClient) -> Self {
        let client = Arc::new(client);
        let sessions = SessionManager::new(client.clone(), &config);
        let definitions = Arc::new(JobDefinitionStore::new(client.clone()));
        let history = Arc::new(RequestHistory::new(config.request_history_limit));

        let compute = ComputeExecutor::new(
            client.clone(),
            sessions.clone(),
            definitions.clone(),
            history.clone(),
        );
        let jes = JesExecutor::new(client.clone(), definitions, history.clone());
        let web = WebExecutor::new(client.clone(), history.clone());
        let sas9 = Sas9Executor::new(client.clone(), history.clone());
        let sasjs = SasjsExecutor::new(client.clone(), history.clone());

        log::debug!(
            "adapter for {} ({:?}) routes requests to {:?}",
            config.server_url,
            config.server_type,
            route(&config)
        );

        Self {
            config,
            client,
            sessions,
            history,
            compute: Executor::new(Arc::new(compute)),
            jes: Executor::new(Arc::new(jes)),
            web: Executor::new(Arc::new(web)),
            sas9: Executor::new(Arc::new(sas9)),
            sasjs: Executor::new(Arc::new(sasjs)),
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn client(&self) -> &RequestClient {
        &self.client
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        route(&self.config)
    }

    pub fn executor(&self, kind: ExecutorKind) -> &Executor {
        match kind {
            ExecutorKind::Compute => &self.compute,
            ExecutorKind::Jes => &self.jes,
            ExecutorKind::Web => &self.web,
            ExecutorKind::Sas9 => &self.sas9,
            ExecutorKind::Sasjs => &self.sasjs,
        }
    }

    fn executors(&self) -> [&Executor; 5] {
        [&self.compute, &self.jes, &self.web, &self.sas9, &self.sasjs]
    }

    /// Run `job_path` with the adapter's configuration.
    pub fn request(
        &self,
        job_path: &str,
        data: Option<TableSet>,
        credentials: Credentials,
        on_login_required: Option<LoginCallback>,
    ) -> Result<Value, Error> {
        let mut params = ExecuteParams::new(job_path, self.config.clone()).with_credentials(credentials);
        params.data = data;
        self.execute(params, on_login_required)
    }

    /// Run with explicit parameters, routed by `params.config`.
    pub fn execute(
        &self,
        params: ExecuteParams,
        on_login_required: Option<LoginCallback>,
    ) -> Result<Value, Error> {
        self.executor(route(&params.config))
            .execute(params, on_login_required)
    }

    /// Replay calls parked for a login, on every executor.
    pub fn resend_waiting_requests(&self) {
        for executor in self.executors() {
            executor.resend_waiting_requests();
        }
    }

    pub fn discard_waiting_requests(&self) {
        for executor in self.executors() {
            executor.discard_waiting_requests();
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.executors().iter().map(|e| e.waiting_count()).sum()
    }

    /// Diagnostic history, oldest first.
    pub fn requests(&self) -> Vec<SasjsRequest> {
        self.history.requests()
    }

    pub fn clear_requests(&self) {
        self.history.clear();
    }

    pub fn csrf_token(&self, scope: CsrfScope) -> Option<CsrfToken> {
        self.client.csrf_token(scope)
    }

    /// Value of a macro variable in a compute session.
    pub fn get_variable(&self, session_id: &str, name: &str, credentials: &Credentials) -> Result<Value, Error> {
        self.sessions.get_variable(session_id, name, credentials)
    }
}
