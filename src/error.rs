use std::io;

use thiserror::Error;

use crate::endpoint::Endpoint;

/// Per-probe error kinds: transport disconnect, protocol discord, deadline
/// exceeded. Caught at the dispatch boundary and turned into an unregister;
/// never propagated past the readiness loop.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("transport disconnect on {endpoint}: {source}")]
    TransportDisconnect { endpoint: Endpoint, source: io::Error },

    #[error("protocol discord on {endpoint}: {reason}")]
    ProtocolDiscord { endpoint: Endpoint, reason: &'static str },

    #[error("deadline exceeded on {endpoint}")]
    DeadlineExceeded { endpoint: Endpoint },
}

/// Subsystem-level error kinds: ingest anomaly, listener anomaly, init
/// failure. These propagate past the dispatch boundary and terminate the
/// process — `main` collapses them through `anyhow`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ingest pipe error: {0}")]
    IngestAnomaly(#[source] io::Error),

    #[error("connect-back listener error: {0}")]
    ListenerAnomaly(#[source] io::Error),

    #[error("failed to bind listener on {addr}: {source}")]
    BindFailed { addr: std::net::SocketAddrV4, source: io::Error },

    #[error("failed to open ingest pipe at {path}: {source}")]
    PipeUnusable { path: String, source: io::Error },

    #[error("epoll setup failed: {0}")]
    InitFailure(#[source] io::Error),

    #[error("epoll_wait failed: {0}")]
    ReadinessWaitFailed(#[source] io::Error),
}
