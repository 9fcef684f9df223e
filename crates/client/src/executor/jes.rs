//! Job Execution Service executor: runs a deployed job definition and reads
//! the `_webout.json` result file it produces.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::form::EncodedTables;
use super::{job_arguments, ExecuteParams, ExecutorKind, JobProtocol};
use crate::error::Error;
use crate::history::RequestHistory;
use crate::job_definition::JobDefinitionStore;
use crate::models::{HasLinks, Job};
use crate::poll::{fetch_full_log, is_in_progress, poll_job_state, state_text, PollOptions};
use crate::request::RequestClient;
use crate::transport::RequestBody;

const JOBS_PATH: &str = "/jobExecution/jobs?_action=wait";
const WEBOUT_RESULT: &str = "_webout.json";

pub struct JesExecutor {
    client: Arc<RequestClient>,
    definitions: Arc<JobDefinitionStore>,
    history: Arc<RequestHistory>,
}

impl JesExecutor {
    pub fn new(
        client: Arc<RequestClient>,
        definitions: Arc<JobDefinitionStore>,
        history: Arc<RequestHistory>,
    ) -> Self {
        Self {
            client,
            definitions,
            history,
        }
    }

    /// Finished job, both typed and as the raw document (for extra attributes).
    fn fetch_finished(&self, job: &Job, token: Option<&str>) -> Result<(Job, Value), Error> {
        let link = job
            .link("self")
            .ok_or_else(|| Error::missing_link("self", format!("job {}", job.id)))?;
        let raw = self.client.get(&link.href, token)?.result;
        let finished: Job = serde_json::from_value(raw.clone())?;
        Ok((finished, raw))
    }
}

impl JobProtocol for JesExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Jes
    }

    fn run(&self, params: &ExecuteParams) -> Result<Value, Error> {
        let tables = match params.data.as_ref().filter(|d| !d.is_empty()) {
            Some(data) => EncodedTables::files(data)?,
            None => EncodedTables::none(),
        };
        let token = params.credentials.access_token(&self.client)?;
        let program = params.program();
        let definition = self.definitions.find(&program, token.as_deref())?;
        let name = program.rsplit('/').next().unwrap_or(&program);

        let mut arguments = job_arguments(&params.config);
        arguments["_program"] = json!(program);
        for (key, value) in tables.into_fields(&self.client, token.as_deref())? {
            arguments[key] = Value::String(value);
        }

        let body = json!({
            "name": format!("exec-{name}"),
            "description": "Powered by SASjs",
            "jobDefinitionUri": definition.uri,
            "arguments": arguments,
        });
        let response = self
            .client
            .post(JOBS_PATH, RequestBody::Json(body), token.as_deref())?;
        let etag = response.etag.clone();
        let job: Job = serde_json::from_value(response.result)?;
        log::info!("submitted {} as job {}", program, job.id);

        let options = PollOptions::from_config(&params.config);
        let state = poll_job_state(&self.client, &job, etag.as_deref(), &params.credentials, &options)?;

        let token = params.credentials.access_token(&self.client)?;
        let token = token.as_deref();
        let (finished, raw) = self.fetch_finished(&job, token)?;

        if matches!(state.as_str(), "failed" | "error") {
            let log = fetch_full_log(&self.client, &finished, token)?;
            self.history.append(&program, &log, None);
            let code = finished
                .error
                .as_ref()
                .and_then(|e| e.get("errorCode"))
                .map(state_text)
                .unwrap_or_else(|| state.clone());
            return Err(Error::JobExecution {
                code,
                message: finished
                    .error_message()
                    .unwrap_or_else(|| format!("job {} {}", finished.id, state)),
                log: Some(log),
            });
        }
        if is_in_progress(&state) {
            log::warn!("job {} still {}, reading output anyway", job.id, state);
        }

        let href = finished
            .result_href(WEBOUT_RESULT)
            .ok_or_else(|| Error::Webout(format!("job {} produced no {}", finished.id, WEBOUT_RESULT)))?;
        let result = self.client.get(&format!("{href}/content"), token)?.result;

        if params.config.debug {
            let log = fetch_full_log(&self.client, &finished, token)?;
            self.history.append(&program, &log, Some(&result));
        }

        if params.extra_attributes.is_empty() {
            return Ok(result);
        }
        let mut merged = Map::new();
        merged.insert("result".to_string(), result);
        for attribute in &params.extra_attributes {
            merged.insert(attribute.clone(), raw.get(attribute).cloned().unwrap_or(Value::Null));
        }
        Ok(Value::Object(merged))
    }
}
