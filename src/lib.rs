//! Active open-proxy and proxy-tunnel detector: a single-threaded,
//! readiness-driven engine that dials candidate endpoints, speaks HTTP
//! CONNECT to them, and correlates connect-backs on a listener to tell a
//! plain open proxy from a tunnel whose ingress and egress IPs differ.

pub mod config;
pub mod correlation;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod nonce;
pub mod probe;
pub mod queue;
pub mod ready;
pub mod sink;
mod sys;
pub mod token;

pub use config::{Cli, Config};
pub use engine::Engine;
pub use error::{EngineError, ProbeError};
