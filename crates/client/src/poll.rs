//! Job state polling.
//!
//! Long-poll reads of a job's `state` link until it leaves the in-progress
//! states. The first phase polls at the configured interval; a job still
//! running after it is polled once a minute. Transport failures are
//! tolerated up to an error ceiling. Running out of polls is not an error:
//! the last observed state is returned.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use sasjs_config::AdapterConfig;

use crate::auth::Credentials;
use crate::error::Error;
use crate::models::{HasLinks, Job};
use crate::request::{Call, RequestClient};
use crate::transport::Method;

pub const LONG_POLL_WAIT_SECS: u64 = 300;
pub const FIRST_PHASE_MAX_POLLS: u32 = 100;
pub const SECOND_PHASE_MAX_POLLS: u32 = 1440;
pub const LOG_WINDOW: u64 = 10_000;

/// States that mean "keep polling".
pub fn is_in_progress(state: &str) -> bool {
    matches!(state, "running" | "" | "pending" | "unavailable")
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub poll_interval: Duration,
    pub second_phase_interval: Duration,
    pub max_poll_count: u32,
    pub max_error_count: u32,
    /// Append the job log to `<folder>/<job name>.log` as it grows
    pub log_folder_path: Option<PathBuf>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            second_phase_interval: Duration::from_secs(60),
            max_poll_count: 1000,
            max_error_count: 5,
            log_folder_path: None,
        }
    }
}

impl PollOptions {
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_poll_count: config.max_poll_count,
            max_error_count: config.max_error_count,
            ..Self::default()
        }
    }
}

struct Poller<'a> {
    client: &'a RequestClient,
    job: &'a Job,
    url: String,
    etag: Option<&'a str>,
    credentials: &'a Credentials,
    options: &'a PollOptions,
    state: String,
    poll_count: u32,
    error_count: u32,
    log_lines_written: u64,
}

/// Poll until the job leaves the in-progress states, returning that state.
pub fn poll_job_state(
    client: &RequestClient,
    job: &Job,
    etag: Option<&str>,
    credentials: &Credentials,
    options: &PollOptions,
) -> Result<String, Error> {
    let state_link = job
        .link("state")
        .ok_or_else(|| Error::missing_link("state", format!("job {}", job.id)))?;

    let mut poller = Poller {
        client,
        job,
        url: format!("{}?_action=wait&wait={}", state_link.href, LONG_POLL_WAIT_SECS),
        etag,
        credentials,
        options,
        state: String::new(),
        poll_count: 0,
        error_count: 0,
        log_lines_written: 0,
    };

    poller.state = match poller.fetch_state() {
        Ok(state) => state,
        Err(e) if e.is_login_required() => return Err(e),
        Err(e) => {
            log::warn!("could not read state of job {}: {}", job.id, e);
            poller.error_count = 1;
            "unavailable".to_string()
        }
    };
    if poller.state == "completed" {
        return Ok(poller.state);
    }

    let first = options.max_poll_count.min(FIRST_PHASE_MAX_POLLS);
    poller.run_phase(first, options.poll_interval)?;

    if is_in_progress(&poller.state) && poller.poll_count < options.max_poll_count {
        let second = (options.max_poll_count - poller.poll_count).min(SECOND_PHASE_MAX_POLLS);
        log::info!(
            "job {} still {} after {} polls, polling every {:?}",
            job.id,
            poller.state,
            poller.poll_count,
            options.second_phase_interval
        );
        poller.run_phase(second, options.second_phase_interval)?;
    }

    if is_in_progress(&poller.state) {
        log::warn!(
            "stopped polling job {} after {} polls, last state '{}'",
            job.id,
            poller.poll_count,
            poller.state
        );
    }
    Ok(poller.state)
}

impl Poller<'_> {
    fn run_phase(&mut self, max_polls: u32, interval: Duration) -> Result<(), Error> {
        let mut polls = 0;
        while is_in_progress(&self.state) && polls < max_polls {
            thread::sleep(interval);
            polls += 1;
            self.poll_count += 1;

            match self.fetch_state() {
                Ok(state) if state.is_empty() => self.error_count = 0,
                Ok(state) => {
                    self.error_count = 0;
                    if state != self.state {
                        log::info!("job {} state: {} -> {}", self.job.id, self.state, state);
                    }
                    self.state = state;
                    let options = self.options;
                    if let Some(folder) = &options.log_folder_path {
                        self.stream_log(folder);
                    }
                }
                Err(e) if e.is_login_required() => return Err(e),
                Err(e) => {
                    self.error_count += 1;
                    log::warn!(
                        "poll {} of job {} failed ({}/{}): {}",
                        self.poll_count,
                        self.job.id,
                        self.error_count,
                        self.options.max_error_count,
                        e
                    );
                    if self.error_count > self.options.max_error_count {
                        return Err(Error::PollFailed {
                            job_id: self.job.id.clone(),
                            source: Box::new(e),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn fetch_state(&self) -> Result<String, Error> {
        let token = self.credentials.access_token(self.client)?;
        let mut call = Call::new(Method::Get, &self.url).token(token.as_deref());
        if let Some(etag) = self.etag {
            call = call.header("If-None-Match", etag);
        }
        let response = self.client.send(call)?;
        Ok(state_text(&response.result))
    }

    fn stream_log(&mut self, folder: &Path) {
        match self.append_new_log_lines(folder) {
            Ok(written) => self.log_lines_written = written,
            Err(e) => log::warn!("could not save log of job {}: {}", self.job.id, e),
        }
    }

    fn append_new_log_lines(&self, folder: &Path) -> Result<u64, Error> {
        let token = self.credentials.access_token(self.client)?;
        let job = fetch_job(self.client, self.job, token.as_deref())?;
        let line_count = job.log_statistics.as_ref().map_or(0, |s| s.line_count);
        if line_count <= self.log_lines_written {
            return Ok(self.log_lines_written);
        }

        let lines = fetch_log_lines(
            self.client,
            &job,
            self.log_lines_written,
            line_count,
            token.as_deref(),
        )?;

        std::fs::create_dir_all(folder)?;
        let path = folder.join(format!("{}.log", self.job.name));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        for line in &lines {
            writeln!(file, "{line}")?;
        }
        log::debug!("appended {} log lines to {}", lines.len(), path.display());
        Ok(line_count)
    }
}

pub(crate) fn state_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Re-read a job through its `self` link.
pub fn fetch_job(client: &RequestClient, job: &Job, token: Option<&str>) -> Result<Job, Error> {
    let link = job
        .link("self")
        .ok_or_else(|| Error::missing_link("self", format!("job {}", job.id)))?;
    let response = client.get(&link.href, token)?;
    Ok(serde_json::from_value(response.result)?)
}

/// Log lines `[start, end)` read in windows of at most [`LOG_WINDOW`].
pub fn fetch_log_lines(
    client: &RequestClient,
    job: &Job,
    start: u64,
    end: u64,
    token: Option<&str>,
) -> Result<Vec<String>, Error> {
    let link = job
        .link("log")
        .ok_or_else(|| Error::missing_link("log", format!("job {}", job.id)))?;

    let mut lines = Vec::new();
    let mut offset = start;
    while offset < end {
        let limit = (end - offset).min(LOG_WINDOW);
        let url = format!("{}/content?start={}&limit={}", link.href, offset, limit);
        let response = client.get(&url, token)?;
        let items = response.result["items"].as_array().cloned().unwrap_or_default();
        if items.is_empty() {
            break;
        }
        lines.extend(
            items
                .iter()
                .map(|item| item["line"].as_str().unwrap_or_default().to_string()),
        );
        offset += limit;
    }
    Ok(lines)
}

/// The job's whole log as text. Empty when the job has no log.
pub fn fetch_full_log(client: &RequestClient, job: &Job, token: Option<&str>) -> Result<String, Error> {
    let job = fetch_job(client, job, token)?;
    let line_count = job.log_statistics.as_ref().map_or(0, |s| s.line_count);
    if line_count == 0 || job.link("log").is_none() {
        return Ok(String::new());
    }
    Ok(fetch_log_lines(client, &job, 0, line_count, token)?.join("\n"))
}
