//! SAS 9 stored process executor.
//!
//! Tables always travel as CSV files. Debug output wraps the JSON between
//! webout markers inside the log, which the request client unwraps.

use std::sync::Arc;

use serde_json::Value;

use super::web::{check_result, submit};
use super::{ExecuteParams, ExecutorKind, JobProtocol};
use crate::error::Error;
use crate::history::RequestHistory;
use crate::request::RequestClient;

pub struct Sas9Executor {
    client: Arc<RequestClient>,
    history: Arc<RequestHistory>,
}

impl Sas9Executor {
    pub fn new(client: Arc<RequestClient>, history: Arc<RequestHistory>) -> Self {
        Self { client, history }
    }
}

impl JobProtocol for Sas9Executor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Sas9
    }

    fn run(&self, params: &ExecuteParams) -> Result<Value, Error> {
        let (program, response) = submit(&self.client, params)?;
        if params.config.debug {
            match &response.result {
                Value::String(text) => self.history.append(&program, text, None),
                result => {
                    let log = response.log.as_deref().unwrap_or_default();
                    self.history.append(&program, log, Some(result));
                }
            }
        }
        check_result(response.result)
    }
}
