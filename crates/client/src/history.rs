//! Diagnostic history of past job runs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// One past run, as kept for debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SasjsRequest {
    pub service_link: String,
    pub timestamp: DateTime<Utc>,
    pub source_code: String,
    pub generated_code: String,
    pub log_file: String,
    /// `WORK` library manifest returned by the job, when present
    pub sas_work: Option<Value>,
}

/// Lines the SAS log echoes from the submitted program: the line number
/// sits in the first ten characters.
pub fn parse_source_code(log: &str) -> String {
    log.lines()
        .filter(|line| {
            let head: String = line.chars().take(10).collect();
            head.trim_start().starts_with(|c: char| c.is_ascii_digit())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Macro-generated lines (`MPRINT(...)`).
pub fn parse_generated_code(log: &str) -> String {
    log.lines()
        .filter(|line| line.starts_with("MPRINT"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Capped, oldest-first history. Appending past the cap evicts the oldest.
#[derive(Debug)]
pub struct RequestHistory {
    limit: usize,
    entries: Mutex<VecDeque<SasjsRequest>>,
}

impl RequestHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record a run of `program` with its log and (parsed) result.
    pub fn append(&self, program: &str, log: &str, result: Option<&Value>) {
        let entry = SasjsRequest {
            service_link: program.to_string(),
            timestamp: Utc::now(),
            source_code: parse_source_code(log),
            generated_code: parse_generated_code(log),
            log_file: log.to_string(),
            sas_work: result.and_then(|r| r.get("WORK")).cloned(),
        };

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    pub fn requests(&self) -> Vec<SasjsRequest> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
