//! SASjs server executor.
//!
//! The server answers with `webout`, then the log, then any print output,
//! joined by [`SASJS_LOGS_SEPARATOR`]. Only the webout part is returned.

use std::sync::Arc;

use serde_json::Value;

use super::web::{check_result, submit};
use super::{ExecuteParams, ExecutorKind, JobProtocol};
use crate::error::Error;
use crate::history::RequestHistory;
use crate::request::{parse_body, RequestClient};

pub const SASJS_LOGS_SEPARATOR: &str = "SASJS_LOGS_SEPARATOR_163ee17b6ff24f028928972d80a26784";

/// One response split into its three parts.
#[derive(Debug, Clone, PartialEq)]
pub struct SasjsOutput {
    pub webout: Value,
    pub log: String,
    pub print_output: String,
}

/// Split a raw server response. A body without separators is all webout.
pub fn split_output(body: &str) -> SasjsOutput {
    let mut parts = body.splitn(3, SASJS_LOGS_SEPARATOR);
    let webout = parts.next().unwrap_or_default();
    let log = parts.next().unwrap_or_default().trim().to_string();
    let print_output = parts.next().unwrap_or_default().trim().to_string();
    SasjsOutput {
        webout: parse_body(webout).0,
        log,
        print_output,
    }
}

pub struct SasjsExecutor {
    client: Arc<RequestClient>,
    history: Arc<RequestHistory>,
}

impl SasjsExecutor {
    pub fn new(client: Arc<RequestClient>, history: Arc<RequestHistory>) -> Self {
        Self { client, history }
    }
}

impl JobProtocol for SasjsExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Sasjs
    }

    fn run(&self, params: &ExecuteParams) -> Result<Value, Error> {
        let (program, response) = submit(&self.client, params)?;

        let output = match response.result {
            Value::String(body) => split_output(&body),
            webout => SasjsOutput {
                webout,
                log: response.log.unwrap_or_default(),
                print_output: String::new(),
            },
        };
        if !output.print_output.is_empty() {
            log::debug!("{} print output:\n{}", program, output.print_output);
        }
        if params.config.debug {
            let result = (!output.webout.is_string()).then_some(&output.webout);
            self.history.append(&program, &output.log, result);
        }
        check_result(output.webout)
    }
}
