//! In-memory transport for state-machine tests.
//!
//! Routes match on method plus exact path (query and fragment ignored).
//! Each route serves its one-shot replies in order, then its `always`
//! reply. Unrouted requests get a 404.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::transport::{HttpRequest, HttpResponse, Method, Transport, TransportError};

pub(crate) const BASE_URL: &str = "https://sas.example.com";

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Response(HttpResponse),
    ConnectError,
}

impl Reply {
    pub(crate) fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            Reply::Response(resp) => Reply::Response(resp.with_header(name, value)),
            other => other,
        }
    }
}

pub(crate) mod reply {
    use super::*;

    pub(crate) fn json(status: u16, value: Value) -> Reply {
        Reply::Response(
            HttpResponse::new(status, value.to_string())
                .with_header("content-type", "application/json"),
        )
    }

    pub(crate) fn text(status: u16, body: &str) -> Reply {
        Reply::Response(HttpResponse::new(status, body))
    }

    pub(crate) fn connect_error() -> Reply {
        Reply::ConnectError
    }
}

struct Route {
    method: Method,
    path: String,
    queue: VecDeque<Reply>,
    always: Option<Reply>,
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<HttpRequest>>,
    cookies: Mutex<Vec<String>>,
}

/// Path of a URL: scheme and host stripped, query and fragment dropped.
pub(crate) fn path_of(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(idx) => {
            let after = &url[idx + 3..];
            after.find('/').map(|p| &after[p..]).unwrap_or("/")
        }
        None => url,
    };
    let end = rest.find(|c| c == '?' || c == '#').unwrap_or(rest.len());
    &rest[..end]
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route_mut<'a>(routes: &'a mut Vec<Route>, method: Method, path: &str) -> &'a mut Route {
        let idx = match routes.iter().position(|r| r.method == method && r.path == path) {
            Some(idx) => idx,
            None => {
                routes.push(Route {
                    method,
                    path: path.to_string(),
                    queue: VecDeque::new(),
                    always: None,
                });
                routes.len() - 1
            }
        };
        &mut routes[idx]
    }

    /// Serve `reply` once, after any earlier one-shot replies for the route.
    pub(crate) fn once(&self, method: Method, path: &str, reply: Reply) {
        let mut routes = self.routes.lock();
        Self::route_mut(&mut routes, method, path).queue.push_back(reply);
    }

    /// Serve `reply` whenever the one-shot queue is empty.
    pub(crate) fn always(&self, method: Method, path: &str, reply: Reply) {
        let mut routes = self.routes.lock();
        Self::route_mut(&mut routes, method, path).always = Some(reply);
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().clone()
    }

    pub(crate) fn requests_to(&self, method: Method, path: &str) -> Vec<HttpRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.method == method && path_of(&r.url) == path)
            .cloned()
            .collect()
    }

    pub(crate) fn count(&self, method: Method, path: &str) -> usize {
        self.requests_to(method, path).len()
    }

    pub(crate) fn cookies(&self) -> Vec<String> {
        self.cookies.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.log.lock().push(request.clone());

        let path = path_of(&request.url);
        let reply = {
            let mut routes = self.routes.lock();
            routes
                .iter_mut()
                .find(|r| r.method == request.method && r.path == path)
                .and_then(|r| r.queue.pop_front().or_else(|| r.always.clone()))
        };

        match reply {
            Some(Reply::Response(resp)) => Ok(resp),
            Some(Reply::ConnectError) => Err(TransportError::Connect("connection refused".into())),
            None => Ok(HttpResponse::new(404, format!("no route for {} {}", request.method, path))),
        }
    }

    fn set_cookie(&self, _url: &str, cookie: &str) {
        self.cookies.lock().push(cookie.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_of() {
        assert_eq!(path_of("https://sas.example.com/a/b?x=1"), "/a/b");
        assert_eq!(path_of("https://sas.example.com/files/files#rawUpload"), "/files/files");
        assert_eq!(path_of("https://sas.example.com"), "/");
        assert_eq!(path_of("/relative?q"), "/relative");
    }
}
