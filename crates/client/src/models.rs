//! Server resources as the REST APIs return them.
//!
//! Only the fields the client reads are modelled; everything else in a
//! payload is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hypermedia link attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    #[serde(default)]
    pub method: String,
    pub rel: String,
    pub href: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default, rename = "type")]
    pub media_type: String,
}

/// Anything carrying a `links` collection.
pub trait HasLinks {
    fn links(&self) -> &[Link];

    fn link(&self, rel: &str) -> Option<&Link> {
        self.links().iter().find(|l| l.rel == rel)
    }
}

macro_rules! has_links {
    ($($ty:ty),*) => {
        $(impl HasLinks for $ty {
            fn links(&self) -> &[Link] {
                &self.links
            }
        })*
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStatistics {
    #[serde(default)]
    pub line_count: u64,
}

/// A unit of remote execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub links: Vec<Link>,
    /// Result name to href, e.g. `_webout.json`
    #[serde(default)]
    pub results: Map<String, Value>,
    #[serde(default)]
    pub log_statistics: Option<LogStatistics>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Job {
    pub fn result_href(&self, name: &str) -> Option<&str> {
        self.results.get(name).and_then(Value::as_str)
    }

    /// Message of the server-reported error, if any.
    pub fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| error.as_str().map(str::to_string))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAttributes {
    /// Seconds of inactivity after which the server drops the session
    #[serde(default)]
    pub session_inactive_timeout: Option<i64>,
}

/// A live compute session bound to one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub attributes: SessionAttributes,
    /// Local time the client received the session
    #[serde(skip, default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Expired once it has been alive for at least its inactivity timeout.
    /// Sessions without a timeout never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.attributes.session_inactive_timeout {
            Some(timeout) => (now - self.created_at).num_seconds() >= timeout,
            None => false,
        }
    }
}

/// A named compute context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMember {
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// Deployed job: its code plus where it lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub links: Vec<Link>,
    /// Folder member uri, filled in after lookup
    #[serde(skip)]
    pub uri: String,
}

impl JobDefinition {
    /// Code split into lines, CRLF normalised.
    pub fn code_lines(&self) -> Vec<String> {
        self.code
            .replace("\r\n", "\n")
            .split('\n')
            .map(str::to_string)
            .collect()
    }
}

/// A paged collection (`{"items": [...]}`).
#[derive(Debug, Clone, Deserialize)]
pub struct Items<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

has_links!(Job, Session, Context, Folder, FolderMember, JobDefinition);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_job_from_server_payload() {
        let job: Job = serde_json::from_value(json!({
            "id": "job-1",
            "name": "exec-myjob",
            "uri": "/jobExecution/jobs/job-1",
            "state": "running",
            "links": [
                { "method": "GET", "rel": "state", "href": "/jobExecution/jobs/job-1/state", "type": "text/plain" },
                { "method": "GET", "rel": "self", "href": "/jobExecution/jobs/job-1" }
            ],
            "results": { "_webout.json": "/files/files/abc" },
            "logStatistics": { "lineCount": 120 },
            "creationTimeStamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(job.link("state").unwrap().media_type, "text/plain");
        assert_eq!(job.result_href("_webout.json"), Some("/files/files/abc"));
        assert_eq!(job.log_statistics.as_ref().unwrap().line_count, 120);
        assert!(job.link("log").is_none());
    }

    #[test]
    fn test_job_error_message() {
        let job = Job {
            error: Some(json!({ "message": "ERROR: something broke" })),
            ..Job::default()
        };
        assert_eq!(job.error_message().as_deref(), Some("ERROR: something broke"));
    }

    #[test]
    fn test_session_expiry() {
        let mut session: Session = serde_json::from_value(json!({
            "id": "s1",
            "state": "idle",
            "attributes": { "sessionInactiveTimeout": 900 }
        }))
        .unwrap();

        let now = session.created_at;
        assert!(!session.is_expired(now));
        assert!(!session.is_expired(now + Duration::seconds(899)));
        assert!(session.is_expired(now + Duration::seconds(900)));

        session.attributes.session_inactive_timeout = None;
        assert!(!session.is_expired(now + Duration::days(30)));
    }

    #[test]
    fn test_code_lines_normalised() {
        let def = JobDefinition {
            code: "data a;\r\n  x=1;\nrun;".into(),
            ..JobDefinition::default()
        };
        assert_eq!(def.code_lines(), vec!["data a;", "  x=1;", "run;"]);
    }
}
