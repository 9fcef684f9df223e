//! Web executor: multipart POST straight to the job URL.
//!
//! The helpers here are shared with the SAS 9 and SASjs executors, which
//! submit the same form and differ only in how the response is wrapped.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use sasjs_config::{AdapterConfig, ServerType};

use super::form::{needs_file_upload, table_parts};
use super::{ExecuteParams, ExecutorKind, JobProtocol, DEBUG_LEVEL};
use crate::error::Error;
use crate::history::RequestHistory;
use crate::request::{parse_body, parse_server_error, ApiResponse, RequestClient};
use crate::transport::MultipartPart;

static IFRAME_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<iframe[^>]*\ssrc\s*=\s*["']([^"']*)["']"#).unwrap());

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Job URL for `program` on the configured server.
pub(crate) fn program_url(config: &AdapterConfig, program: &str) -> String {
    let mut url = match config.server_type {
        ServerType::SasViya => format!("{}/?_program={}", config.jobs_path(), encode(program)),
        _ => format!("{}?_program={}", config.jobs_path(), encode(program)),
    };
    if config.server_type == ServerType::SasViya && !config.context_name.is_empty() {
        url.push_str(&format!("&_contextName={}", encode(&config.context_name)));
    }
    if config.debug {
        if config.server_type == ServerType::SasViya {
            url.push_str("&_omittextlog=false&_omitsessionresults=false");
        }
        url.push_str(&format!("&_debug={DEBUG_LEVEL}"));
    }
    url
}

/// Form parts carrying the tables, inline or as files.
pub(crate) fn form_parts(params: &ExecuteParams) -> Result<Vec<MultipartPart>, Error> {
    match params.data.as_ref().filter(|d| !d.is_empty()) {
        Some(data) => {
            let as_files = needs_file_upload(params.config.server_type, data);
            if as_files {
                log::debug!("sending {} table(s) as files", data.len());
            }
            table_parts(data, as_files)
        }
        None => Ok(Vec::new()),
    }
}

/// Submit the form for `params` and return the parsed response.
pub(crate) fn submit(client: &RequestClient, params: &ExecuteParams) -> Result<(String, ApiResponse), Error> {
    let program = params.program();
    let parts = form_parts(params)?;
    let token = params.credentials.access_token(client)?;
    let url = program_url(&params.config, &program);
    let response = client.post_multipart(&url, parts, token.as_deref())?;
    Ok((program, response))
}

/// Errors a job reports inside an otherwise successful response.
pub(crate) fn check_result(result: Value) -> Result<Value, Error> {
    if let Value::String(text) = &result {
        return Err(parse_server_error(text).unwrap_or_else(|| {
            let head: String = text.chars().take(200).collect();
            Error::Webout(format!("response is not JSON: {head}"))
        }));
    }
    if result.get("errorCode").is_some() && result.get("message").is_some() {
        let text = result.to_string();
        return Err(parse_server_error(&text).unwrap_or(Error::Webout(text)));
    }
    Ok(result)
}

pub struct WebExecutor {
    client: Arc<RequestClient>,
    history: Arc<RequestHistory>,
}

impl WebExecutor {
    pub fn new(client: Arc<RequestClient>, history: Arc<RequestHistory>) -> Self {
        Self { client, history }
    }

    /// Debug pages embed the job output in an iframe; fetch it.
    fn follow_iframe(&self, page: &str, params: &ExecuteParams) -> Result<Option<Value>, Error> {
        let Some(src) = IFRAME_SRC.captures(page).and_then(|c| c.get(1)) else {
            return Ok(None);
        };
        let src = src.as_str().replace("&amp;", "&");
        log::debug!("fetching debug output from {}", src);
        let token = params.credentials.access_token(&self.client)?;
        let response = self.client.get(&src, token.as_deref())?;
        let result = match response.result {
            Value::String(text) => parse_body(&text).0,
            other => other,
        };
        Ok(Some(result))
    }
}

impl JobProtocol for WebExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Web
    }

    fn run(&self, params: &ExecuteParams) -> Result<Value, Error> {
        let (program, response) = submit(&self.client, params)?;

        if params.config.debug {
            if let Value::String(page) = &response.result {
                if let Some(result) = self.follow_iframe(page, params)? {
                    self.history.append(&program, page, Some(&result));
                    return check_result(result);
                }
                self.history.append(&program, page, None);
            } else {
                let log = response.log.as_deref().unwrap_or_default();
                self.history.append(&program, log, Some(&response.result));
            }
        }
        check_result(response.result)
    }
}
