//! Job execution client for SAS servers (Viya, SAS 9, SASjs server).
//!
//! This crate owns the wire contract with the server: requests with CSRF and
//! login handling, job state polling, the compute session pool, and one
//! executor per execution API. [`Sasjs`] ties them together and routes each
//! request to the executor the configuration selects.
//!
//! Blocking I/O throughout. Background work (session pool refill) runs on
//! plain threads.

mod adapter;
pub mod auth;
mod error;
pub mod executor;
mod history;
mod job_definition;
mod models;
pub mod poll;
pub mod request;
mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use adapter::{route, Sasjs};
pub use auth::{AuthConfig, Credentials};
pub use error::Error;
pub use executor::{ExecuteParams, Executor, ExecutorKind, JobProtocol, LoginCallback};
pub use history::{parse_generated_code, parse_source_code, RequestHistory, SasjsRequest};
pub use job_definition::JobDefinitionStore;
pub use models::{
    Context, Folder, FolderMember, HasLinks, Items, Job, JobDefinition, Link, LogStatistics,
    Session, SessionAttributes,
};
pub use poll::{poll_job_state, PollOptions};
pub use request::{ApiResponse, CsrfScope, CsrfToken, RequestClient};
pub use session::{SessionManager, DEFAULT_POOL_SIZE};
pub use transport::{ReqwestTransport, Transport, TransportError};

pub use sasjs_config::{AdapterConfig, ServerType};
pub use sasjs_tables::{Table, TableSet};
