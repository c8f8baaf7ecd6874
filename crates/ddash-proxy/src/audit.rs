//! Audit logging for gate decisions.
//!
//! Logs every gated request with structured fields via `tracing`. Request
//! bodies, tunneled bytes and header values are never included.

use crate::decision::Decision;
use crate::store::Source;
use tracing::info;

/// Proxy mode for audit logging.
#[derive(Debug, Clone, Copy)]
pub enum ProxyMode {
    /// CONNECT tunnel
    Connect,
    /// Plain HTTP forwarding
    Forward,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Connect => write!(f, "connect"),
            ProxyMode::Forward => write!(f, "forward"),
        }
    }
}

/// Log the gate decision for a request.
pub fn log_decision(mode: ProxyMode, host: &str, port: u16, decision: Decision, source: Source) {
    info!(
        target: "ddash_proxy::audit",
        mode = %mode,
        host = host,
        port = port,
        decision = %decision,
        source = %source,
        "proxy request {}",
        if decision.is_allowed() { "allowed" } else { "denied" }
    );
}

/// Log a completed plain HTTP forward with the upstream status.
pub fn log_forwarded(method: &str, host: &str, port: u16, status: u16) {
    info!(
        target: "ddash_proxy::audit",
        mode = "forward",
        method = method,
        host = host,
        port = port,
        status = status,
        "forwarded response"
    );
}
