use thiserror::Error;

/// Protocol-level failures: tear down the offending link or resource, log
/// at info, never propagate to the peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("link_id {0} already has an active session")]
    DuplicateLink(String),
    #[error("no active link for link_id {0}")]
    UnknownLink(String),
    #[error("resource hash did not match the assembled data")]
    ResourceHashMismatch,
    #[error("proof did not correlate to any pending receipt or resource slot")]
    ProofMismatch,
}

/// Timeout failures: invoke the relevant callback; retriable paths consume
/// a retry budget first.
#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("no LRPROOF arrived within the handshake deadline")]
    HandshakeTimeout,
    #[error("no keepalive reply within the keepalive window")]
    KeepaliveTimeout,
    #[error("no receipt delivered within the deadline")]
    ReceiptTimeout,
    #[error("resource transfer exceeded its retry budget")]
    ResourceTimeout,
}

/// Surfaced to the immediate caller of `send`/`outbound`; never retried
/// automatically at the packet layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("interface {0} is offline")]
    InterfaceOffline(String),
    #[error("no path table entry for destination, and broadcast is disabled")]
    PathExpired,
    #[error("announce queue is full")]
    QueueFull,
}

/// Programming errors: surface loudly, never recovered silently.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("operation requires the process root to be started")]
    NotStarted,
    #[error("process root is already started")]
    AlreadyStarted,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("LRPROOF signature or derived key did not match")]
    ProofInvalid,
    #[error("peer closed the link")]
    PeerClosed,
    #[error("keepalive timed out")]
    KeepaliveTimeout,
    #[error("link was torn down locally")]
    LocalTeardown,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("resource exceeds the configured maximum size")]
    TooLarge,
    #[error("advertised part count does not match received parts")]
    PartCountMismatch,
}
