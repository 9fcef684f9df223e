//! Request client.
//!
//! Wraps a [`Transport`] with the conventions every server flavor shares:
//! CSRF challenges answered once per call, 401 / `invalid_grant` / login
//! pages mapped to [`Error::LoginRequired`], 503/504 and refused connections
//! retried with exponential backoff, and response bodies parsed as JSON, then
//! as webout-wrapped JSON, then kept as raw text.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;

use sasjs_config::AdapterConfig;

use crate::error::Error;
use crate::transport::{
    HttpRequest, HttpResponse, Method, MultipartPart, RequestBody, ReqwestTransport, Transport,
    TransportError,
};

// ── Constants ───────────────────────────────────────────────────────

pub const CSRF_HEADER: &str = "x-csrf-header";
pub const DEFAULT_CSRF_TOKEN_HEADER: &str = "x-csrf-token";
pub const WEBOUT_BEGIN: &str = ">>weboutBEGIN<<";
pub const WEBOUT_END: &str = ">>weboutEND<<";

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const VERBOSE_BODY_CHARS: usize = 500;

static FORM_ACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<form[^>]*\saction\s*=\s*["']([^"']*)["']"#).unwrap());
static HIDDEN_INPUT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?is)<input[^>]*>"#).unwrap());
static INPUT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)\sname\s*=\s*["']([^"']*)["']"#).unwrap());
static INPUT_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)\svalue\s*=\s*["']([^"']*)["']"#).unwrap());
static DOCUMENT_COOKIE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"document\.cookie\s*=\s*(?:'([^']*)'|"([^"]*)")"#).unwrap());
static LOGIN_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"entityID"\s*:\s*"[^"]*log[io]n"#).unwrap());
static ERROR_CODE_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\{\s*"errorCode""#).unwrap());
static STP_NOT_FOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)Stored process not found:\s*(?:<i>)?\s*([^<\r\n]*)").unwrap());
static SAS_LOG_PRE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h2>\s*SAS Log\s*</h2>\s*<pre>(.*?)</pre>").unwrap());

// ── CSRF tokens ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub header_name: String,
    pub value: String,
}

/// Token slot. File uploads are challenged separately from everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfScope {
    General,
    File,
}

/// Both token slots. Writes replace the whole token.
#[derive(Debug, Default)]
pub struct CsrfStore {
    general: RwLock<Option<CsrfToken>>,
    file: RwLock<Option<CsrfToken>>,
}

impl CsrfStore {
    fn slot(&self, scope: CsrfScope) -> &RwLock<Option<CsrfToken>> {
        match scope {
            CsrfScope::General => &self.general,
            CsrfScope::File => &self.file,
        }
    }

    pub fn get(&self, scope: CsrfScope) -> Option<CsrfToken> {
        self.slot(scope).read().clone()
    }

    pub fn set(&self, scope: CsrfScope, token: CsrfToken) {
        *self.slot(scope).write() = Some(token);
    }

    pub fn clear(&self) {
        *self.general.write() = None;
        *self.file.write() = None;
    }
}

/// Read the challenge header pair: `X-CSRF-HEADER` names the header that
/// carries the token.
pub fn csrf_from_headers(response: &HttpResponse) -> Option<CsrfToken> {
    let header_name = response
        .header(CSRF_HEADER)
        .unwrap_or(DEFAULT_CSRF_TOKEN_HEADER)
        .to_string();
    let value = response.header(&header_name)?.to_string();
    if value.is_empty() {
        return None;
    }
    Some(CsrfToken { header_name, value })
}

// ── Retry budget ────────────────────────────────────────────────────

/// Retries left for one logical call. Never shared between calls.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    remaining: u32,
    attempt: u32,
    base_delay: Duration,
}

impl RetryBudget {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            remaining: retries,
            attempt: 0,
            base_delay,
        }
    }

    /// Backoff before the next attempt, or None once spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.base_delay * 2u32.saturating_pow(self.attempt.min(16));
        self.attempt += 1;
        Some(delay)
    }
}

// ── Responses ───────────────────────────────────────────────────────

/// A successful, parsed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub result: Value,
    pub etag: Option<String>,
    pub status: u16,
    /// SAS log that came wrapped around the result
    pub log: Option<String>,
}

impl ApiResponse {
    pub fn text(&self) -> Option<&str> {
        self.result.as_str()
    }
}

/// Parse a body: JSON first, then webout-wrapped JSON, then raw text.
pub fn parse_body(body: &str) -> (Value, Option<String>) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (Value::String(String::new()), None);
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return (value, None);
    }
    if let Some(webout) = extract_webout(body) {
        if let Ok(value) = serde_json::from_str::<Value>(webout.trim()) {
            return (value, Some(body.to_string()));
        }
    }
    (Value::String(body.to_string()), None)
}

/// Text between the webout markers, if both are present.
pub fn extract_webout(body: &str) -> Option<&str> {
    let start = body.find(WEBOUT_BEGIN)? + WEBOUT_BEGIN.len();
    let end = body[start..].find(WEBOUT_END)? + start;
    Some(&body[start..end])
}

/// Program failures the server reports in a response body.
pub fn parse_server_error(body: &str) -> Option<Error> {
    if let Some(found) = ERROR_CODE_JSON.find(body) {
        let mut stream = serde_json::Deserializer::from_str(&body[found.start()..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            let code = match &value["errorCode"] {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let message = value["message"].as_str().unwrap_or_default().to_string();
            return Some(Error::JobExecution {
                code,
                message,
                log: None,
            });
        }
    }

    if let Some(caps) = STP_NOT_FOUND.captures(body) {
        let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        return Some(Error::JobExecution {
            code: "404".to_string(),
            message: format!("Stored process not found: {path}"),
            log: None,
        });
    }

    if body.contains("Stored Process Error") && body.contains("This request completed with errors.") {
        let log = SAS_LOG_PRE
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        return Some(Error::JobExecution {
            code: "500".to_string(),
            message: "Stored Process Error: this request completed with errors".to_string(),
            log,
        });
    }

    None
}

fn is_authorize_form(body: &str) -> bool {
    FORM_ACTION
        .captures(body)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str().contains("SASLogon/oauth/authorize"))
}

/// A login form or login entity, unless the page came from a job run
/// (whose output may legitimately contain anything).
fn is_login_page(url: &str, body: &str) -> bool {
    if url.contains("/SASJobExecution") || url.contains("/SASStoredProcess") {
        return false;
    }
    let form_login = FORM_ACTION
        .captures(body)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str().contains("Logon"));
    form_login || LOGIN_ENTITY.is_match(body)
}

fn is_invalid_csrf(body: &str) -> bool {
    body.to_lowercase().contains("invalid csrf token")
}

/// Form action plus every named input, in page order.
fn parse_form(body: &str) -> Option<(String, Vec<(String, String)>)> {
    let action = FORM_ACTION.captures(body)?.get(1)?.as_str().replace("&amp;", "&");
    let fields = HIDDEN_INPUT
        .find_iter(body)
        .filter_map(|input| {
            let tag = input.as_str();
            let name = INPUT_NAME.captures(tag)?.get(1)?.as_str().to_string();
            let value = INPUT_VALUE
                .captures(tag)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some((name, value))
        })
        .collect();
    Some((action, fields))
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(VERBOSE_BODY_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// ── RequestClient ───────────────────────────────────────────────────

/// One call: everything needed to send it again.
#[derive(Debug, Clone)]
pub struct Call<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: RequestBody,
    pub token: Option<&'a str>,
    pub headers: Vec<(String, String)>,
    pub scope: CsrfScope,
}

impl<'a> Call<'a> {
    pub fn new(method: Method, path: &'a str) -> Self {
        Self {
            method,
            path,
            body: RequestBody::Empty,
            token: None,
            headers: Vec::new(),
            scope: CsrfScope::General,
        }
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn token(mut self, token: Option<&'a str>) -> Self {
        self.token = token;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn scope(mut self, scope: CsrfScope) -> Self {
        self.scope = scope;
        self
    }
}

/// HTTP client bound to one server.
pub struct RequestClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    csrf: CsrfStore,
    server_error_retries: u32,
    retry_delay: Duration,
    debug: bool,
    verbose: bool,
}

impl RequestClient {
    pub fn new(config: &AdapterConfig) -> Result<Self, Error> {
        let transport = ReqwestTransport::new(config.allow_insecure_requests)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &AdapterConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: config.base_url().to_string(),
            transport,
            csrf: CsrfStore::default(),
            server_error_retries: config.server_error_retries,
            retry_delay: RETRY_BASE_DELAY,
            debug: config.debug,
            verbose: config.verbose,
        }
    }

    /// Override the first backoff step (doubles on every retry).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn csrf_token(&self, scope: CsrfScope) -> Option<CsrfToken> {
        self.csrf.get(scope)
    }

    /// Absolute URLs pass through; paths are joined to the server URL.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    // ── Verbs ───────────────────────────────────────────────────────

    pub fn get(&self, path: &str, token: Option<&str>) -> Result<ApiResponse, Error> {
        self.send(Call::new(Method::Get, path).token(token))
    }

    pub fn post(&self, path: &str, body: RequestBody, token: Option<&str>) -> Result<ApiResponse, Error> {
        self.send(Call::new(Method::Post, path).body(body).token(token))
    }

    pub fn put(&self, path: &str, body: RequestBody, token: Option<&str>) -> Result<ApiResponse, Error> {
        self.send(Call::new(Method::Put, path).body(body).token(token))
    }

    pub fn patch(&self, path: &str, body: RequestBody, token: Option<&str>) -> Result<ApiResponse, Error> {
        self.send(Call::new(Method::Patch, path).body(body).token(token))
    }

    pub fn delete(&self, path: &str, token: Option<&str>) -> Result<ApiResponse, Error> {
        self.send(Call::new(Method::Delete, path).token(token))
    }

    /// Raw upload of one file's content. Uses the file-scoped CSRF token.
    pub fn upload_file(
        &self,
        path: &str,
        content: &str,
        content_type: &str,
        token: Option<&str>,
    ) -> Result<ApiResponse, Error> {
        let body = RequestBody::Text {
            content_type: content_type.to_string(),
            body: content.to_string(),
        };
        self.send(
            Call::new(Method::Post, path)
                .body(body)
                .token(token)
                .scope(CsrfScope::File),
        )
    }

    /// Multipart form post (job submission on the web endpoints).
    pub fn post_multipart(
        &self,
        path: &str,
        parts: Vec<MultipartPart>,
        token: Option<&str>,
    ) -> Result<ApiResponse, Error> {
        self.post(path, RequestBody::Multipart(parts), token)
    }

    // ── Core send loop ──────────────────────────────────────────────

    pub fn send(&self, call: Call<'_>) -> Result<ApiResponse, Error> {
        let url = self.url_for(call.path);
        let mut budget = RetryBudget::new(self.server_error_retries, self.retry_delay);
        let mut csrf_retried = false;
        let mut cookies_refreshed = false;
        let mut authorize_submitted = false;

        loop {
            let request = self.build_request(&call, &url);
            if self.verbose {
                log::info!("{} {}", request.method, request.url);
            } else {
                log::debug!("{} {}", request.method, request.url);
            }

            let response = match self.transport.send(&request) {
                Ok(response) => response,
                Err(TransportError::Connect(msg)) => match budget.next_delay() {
                    Some(delay) => {
                        log::warn!("{} {} failed ({}), retrying in {:?}", call.method, url, msg, delay);
                        thread::sleep(delay);
                        continue;
                    }
                    None => return Err(Error::Transport(msg)),
                },
                Err(err) => return Err(err.into()),
            };

            if self.verbose {
                log::info!(
                    "{} {} -> {}\n{}",
                    call.method,
                    url,
                    response.status,
                    excerpt(&response.body)
                );
            }

            let challenge = csrf_from_headers(&response);
            let fresh_token = challenge.is_some();
            if let Some(token) = challenge {
                self.csrf.set(call.scope, token);
            }

            let status = response.status;

            if status == 403 || status == 449 {
                if is_invalid_csrf(&response.body) {
                    if cookies_refreshed {
                        return Err(Error::InvalidCsrf);
                    }
                    cookies_refreshed = true;
                    self.refresh_cookies()?;
                    continue;
                }
                if !csrf_retried && fresh_token {
                    csrf_retried = true;
                    log::debug!("CSRF challenge on {}, retrying with token", url);
                    continue;
                }
                return Err(Error::Http {
                    status,
                    body: response.body,
                });
            }

            if status == 401 || (status == 400 && response.body.contains("invalid_grant")) {
                self.csrf.clear();
                return Err(Error::LoginRequired);
            }

            if status == 404 {
                return Err(Error::NotFound { url });
            }

            if status == 502 {
                if self.debug {
                    return Err(Error::InternalServer {
                        url,
                        status,
                        body: response.body,
                    });
                }
                log::warn!("{} {} returned 502, treating as empty", call.method, url);
                return Ok(ApiResponse {
                    result: Value::String(String::new()),
                    etag: None,
                    status,
                    log: None,
                });
            }

            if status == 503 || status == 504 {
                if let Some(delay) = budget.next_delay() {
                    log::warn!("{} {} returned {}, retrying in {:?}", call.method, url, status, delay);
                    thread::sleep(delay);
                    continue;
                }
                return Err(Error::InternalServer {
                    url,
                    status,
                    body: response.body,
                });
            }

            if is_authorize_form(&response.body) {
                if authorize_submitted {
                    return Err(Error::Authorize(url));
                }
                authorize_submitted = true;
                self.submit_authorize_form(&response.body, call.token)?;
                continue;
            }

            if is_login_page(&url, &response.body) {
                self.csrf.clear();
                return Err(Error::LoginRequired);
            }

            // 304: long-poll window ended with nothing new
            if !response.is_success() && status != 304 {
                if let Some(err) = parse_server_error(&response.body) {
                    return Err(err);
                }
                return Err(Error::Http {
                    status,
                    body: response.body,
                });
            }

            let etag = response.header("etag").map(str::to_string);
            let (result, log) = parse_body(&response.body);
            return Ok(ApiResponse {
                result,
                etag,
                status,
                log,
            });
        }
    }

    fn build_request(&self, call: &Call<'_>, url: &str) -> HttpRequest {
        let mut headers = Vec::with_capacity(call.headers.len() + 2);
        if let Some(token) = call.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if let Some(csrf) = self.csrf.get(call.scope) {
            headers.push((csrf.header_name, csrf.value));
        }
        headers.extend(call.headers.iter().cloned());

        HttpRequest {
            method: call.method,
            url: url.to_string(),
            headers,
            body: call.body.clone(),
        }
    }

    /// Fetch the landing page and copy any `document.cookie` it sets.
    fn refresh_cookies(&self) -> Result<(), Error> {
        let root = format!("{}/", self.base_url);
        log::debug!("invalid CSRF token, refreshing cookies from {}", root);
        let response = self.transport.send(&HttpRequest {
            method: Method::Get,
            url: root.clone(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        })?;

        if let Some(caps) = DOCUMENT_COOKIE.captures(&response.body) {
            if let Some(cookie) = caps.get(1).or_else(|| caps.get(2)) {
                self.transport.set_cookie(&root, cookie.as_str());
            }
        }
        Ok(())
    }

    fn submit_authorize_form(&self, body: &str, token: Option<&str>) -> Result<(), Error> {
        let (action, fields) =
            parse_form(body).ok_or_else(|| Error::Authorize("no form in page".to_string()))?;
        let url = self.url_for(&action);
        log::debug!("submitting authorization form to {}", url);

        let mut headers = Vec::new();
        if let Some(token) = token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        let response = self.transport.send(&HttpRequest {
            method: Method::Post,
            url: url.clone(),
            headers,
            body: RequestBody::Form(fields),
        })?;

        if response.status >= 400 {
            return Err(Error::Authorize(format!("{} returned {}", url, response.status)));
        }
        Ok(())
    }
}
