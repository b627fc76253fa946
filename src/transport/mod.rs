//! Board transports.
//!
//! Two ways of getting a board to the backend: a REST request/response call
//! ([`rest::RestClient`]) and a realtime event channel ([`socket::BoardSocket`]).
//! Neither defines its own wire format beyond "the whole board as JSON".

pub mod rest;
pub mod socket;

pub use rest::RestClient;
pub use socket::{BoardSocket, ClientEvent, LoopbackHub, ServerEvent};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("socket is closed")]
    Closed,
}
