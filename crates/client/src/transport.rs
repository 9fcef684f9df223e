//! The wire seam.
//!
//! Requests are plain data so an identical call can be sent again after a
//! CSRF challenge or a transient failure. [`ReqwestTransport`] is the real
//! implementation (blocking reqwest, no Tokio runtime required).

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::multipart;
use reqwest::cookie::Jar;
use serde_json::Value;

use crate::error::Error;

/// Long-poll reads wait up to 300s server-side; leave headroom on top.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(360);
const USER_AGENT: &str = concat!("sasjs-client/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartValue {
    Text(String),
    File {
        file_name: String,
        content_type: String,
        content: String,
    },
}

/// One field of a multipart form.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub value: PartValue,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: PartValue::Text(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: PartValue::File {
                file_name: file_name.into(),
                content_type: content_type.into(),
                content: content.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
    Text {
        content_type: String,
        body: String,
    },
    Multipart(Vec<MultipartPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Why a request produced no response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Never reached the server. Safe to retry.
    Connect(String),
    Certificate(String),
    Other(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect(msg) | TransportError::Other(msg) => Error::Transport(msg),
            TransportError::Certificate(msg) => Error::Certificate(msg),
        }
    }
}

pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Store a cookie for later requests to `url`.
    fn set_cookie(&self, url: &str, cookie: &str);
}

/// Blocking reqwest client with a shared cookie jar.
pub struct ReqwestTransport {
    http: reqwest::blocking::Client,
    jar: Arc<Jar>,
}

impl ReqwestTransport {
    pub fn new(allow_insecure: bool) -> Result<Self, Error> {
        let jar = Arc::new(Jar::default());
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .cookie_provider(Arc::clone(&jar))
            .danger_accept_invalid_certs(allow_insecure)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { http, jar })
    }

    fn build(
        &self,
        request: &HttpRequest,
    ) -> Result<reqwest::blocking::RequestBuilder, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut req = self.http.request(method, &request.url);
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        req = match &request.body {
            RequestBody::Empty => req,
            RequestBody::Json(value) => req.json(value),
            RequestBody::Form(fields) => req.form(fields),
            RequestBody::Text { content_type, body } => req
                .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                .body(body.clone()),
            RequestBody::Multipart(parts) => {
                let mut form = multipart::Form::new();
                for part in parts {
                    form = match &part.value {
                        PartValue::Text(value) => form.text(part.name.clone(), value.clone()),
                        PartValue::File {
                            file_name,
                            content_type,
                            content,
                        } => {
                            let file = multipart::Part::text(content.clone())
                                .file_name(file_name.clone())
                                .mime_str(content_type)
                                .map_err(|e| TransportError::Other(e.to_string()))?;
                            form.part(part.name.clone(), file)
                        }
                    };
                }
                req.multipart(form)
            }
        };
        Ok(req)
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self.build(request)?.send().map_err(classify_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn set_cookie(&self, url: &str, cookie: &str) {
        match url::Url::parse(url) {
            Ok(url) => self.jar.add_cookie_str(cookie, &url),
            Err(e) => log::warn!("cannot set cookie for {}: {}", url, e),
        }
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        chain.push_str(": ");
        chain.push_str(&inner.to_string());
        source = inner.source();
    }

    let lower = chain.to_lowercase();
    if lower.contains("certificate") || lower.contains("unknownissuer") {
        TransportError::Certificate(chain)
    } else if err.is_connect() {
        TransportError::Connect(chain)
    } else {
        TransportError::Other(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    fn request(method: Method, url: String, body: RequestBody) -> HttpRequest {
        HttpRequest {
            method,
            url,
            headers: vec![("x-custom".into(), "1".into())],
            body,
        }
    }

    #[test]
    fn test_response_header_case_insensitive() {
        let resp = HttpResponse::new(200, "").with_header("ETag", "\"abc\"");
        assert_eq!(resp.header("etag"), Some("\"abc\""));
        assert!(resp.header("x-missing").is_none());
    }

    #[test]
    fn test_sends_json_and_headers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/compute/sessions/s1/jobs")
                .header("x-custom", "1")
                .json_body(serde_json::json!({ "name": "exec-job" }));
            then.status(201)
                .header("etag", "\"v1\"")
                .body(r#"{"id":"j1"}"#);
        });

        let transport = ReqwestTransport::new(false).unwrap();
        let resp = transport
            .send(&request(
                Method::Post,
                server.url("/compute/sessions/s1/jobs"),
                RequestBody::Json(serde_json::json!({ "name": "exec-job" })),
            ))
            .unwrap();

        mock.assert();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.header("ETag"), Some("\"v1\""));
        assert_eq!(resp.body, r#"{"id":"j1"}"#);
    }

    #[test]
    fn test_sends_multipart_file() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/SASStoredProcess/do")
                .body_includes("filename=\"people.csv\"")
                .body_includes("name:$char3.");
            then.status(200).body("{}");
        });

        let transport = ReqwestTransport::new(false).unwrap();
        transport
            .send(&request(
                Method::Post,
                server.url("/SASStoredProcess/do"),
                RequestBody::Multipart(vec![MultipartPart::file(
                    "people",
                    "people.csv",
                    "application/csv",
                    "name:$char3.\r\nAda",
                )]),
            ))
            .unwrap();
        mock.assert();
    }

    #[test]
    fn test_connection_refused_is_connect_error() {
        let transport = ReqwestTransport::new(false).unwrap();
        let err = transport
            .send(&request(
                Method::Get,
                "http://127.0.0.1:1/unreachable".into(),
                RequestBody::Empty,
            ))
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }

    #[test]
    fn test_cookie_jar_used_for_later_requests() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/data").header("cookie", "session=abc");
            then.status(200).body("ok");
        });

        let transport = ReqwestTransport::new(false).unwrap();
        transport.set_cookie(&server.base_url(), "session=abc");
        let resp = transport
            .send(&request(Method::Get, server.url("/data"), RequestBody::Empty))
            .unwrap();
        mock.assert();
        assert_eq!(resp.body, "ok");
    }
}
