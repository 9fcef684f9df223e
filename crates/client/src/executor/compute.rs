//! Compute API executor: submits the job's code straight into a pooled
//! compute session and reads `_webout` back from the session.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::form::EncodedTables;
use super::{job_arguments, ExecuteParams, ExecutorKind, JobProtocol};
use crate::error::Error;
use crate::history::RequestHistory;
use crate::job_definition::JobDefinitionStore;
use crate::models::{Job, Session};
use crate::poll::{fetch_full_log, fetch_job, is_in_progress, poll_job_state, PollOptions};
use crate::request::RequestClient;
use crate::session::SessionManager;
use crate::transport::RequestBody;

const JOB_DESCRIPTION: &str = "Powered by SASjs";

pub struct ComputeExecutor {
    client: Arc<RequestClient>,
    sessions: SessionManager,
    definitions: Arc<JobDefinitionStore>,
    history: Arc<RequestHistory>,
}

impl ComputeExecutor {
    pub fn new(
        client: Arc<RequestClient>,
        sessions: SessionManager,
        definitions: Arc<JobDefinitionStore>,
        history: Arc<RequestHistory>,
    ) -> Self {
        Self {
            client,
            sessions,
            definitions,
            history,
        }
    }

    fn run_in_session(
        &self,
        params: &ExecuteParams,
        session: &Session,
        tables: EncodedTables,
        token: Option<&str>,
    ) -> Result<Value, Error> {
        let program = params.program();
        let definition = self.definitions.find(&program, token)?;
        let name = program.rsplit('/').next().unwrap_or(&program);

        let mut variables = Map::new();
        variables.insert("SYS_JES_JOB_URI".into(), Value::String(definition.uri.clone()));
        variables.insert("_program".into(), Value::String(program.clone()));
        for (key, value) in tables.into_fields(&self.client, token)? {
            variables.insert(key, Value::String(value));
        }

        let body = json!({
            "name": format!("exec-{name}"),
            "description": JOB_DESCRIPTION,
            "code": definition.code_lines(),
            "variables": variables,
            "arguments": job_arguments(&params.config),
        });

        let response = self.client.post(
            &format!("/compute/sessions/{}/jobs", session.id),
            RequestBody::Json(body),
            token,
        )?;
        let etag = response.etag.clone();
        let job: Job = serde_json::from_value(response.result)?;
        log::info!("submitted {} as compute job {} in session {}", program, job.id, session.id);

        let options = PollOptions::from_config(&params.config);
        let state = poll_job_state(&self.client, &job, etag.as_deref(), &params.credentials, &options)?;

        let token = params.credentials.access_token(&self.client)?;
        let token = token.as_deref();
        if matches!(state.as_str(), "failed" | "error") {
            let job = fetch_job(&self.client, &job, token)?;
            let log = fetch_full_log(&self.client, &job, token)?;
            self.history.append(&program, &log, None);
            return Err(Error::ComputeJobExecution {
                job: Box::new(job),
                log,
            });
        }
        if is_in_progress(&state) {
            log::warn!("compute job {} still {}, reading output anyway", job.id, state);
        }

        let response = self.client.get(
            &format!("/compute/sessions/{}/filerefs/_webout/content", session.id),
            token,
        )?;
        if params.config.debug {
            let log = fetch_full_log(&self.client, &job, token)?;
            self.history.append(&program, &log, Some(&response.result));
        }
        Ok(response.result)
    }
}

/// Tables as job variables. A `;` in the payload would break macro
/// variable assignment, so such tables are uploaded as files instead.
fn encode_variables(params: &ExecuteParams) -> Result<EncodedTables, Error> {
    match params.data.as_ref().filter(|d| !d.is_empty()) {
        None => Ok(EncodedTables::none()),
        Some(data) if data.to_json_string().contains(';') => EncodedTables::files(data),
        Some(data) => EncodedTables::inline(data),
    }
}

impl JobProtocol for ComputeExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Compute
    }

    fn run(&self, params: &ExecuteParams) -> Result<Value, Error> {
        let tables = encode_variables(params)?;
        let session = self.sessions.get_session(&params.credentials)?;
        let token = params.credentials.access_token(&self.client)?;

        let result = self.run_in_session(params, &session, tables, token.as_deref());

        if let Err(e) = self.sessions.clear_session(&session.id, &params.credentials) {
            log::warn!("could not clear session {}: {}", session.id, e);
        }
        result
    }
}
