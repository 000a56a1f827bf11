// ABOUTME: Health module - TTL heartbeats and the cluster-wide instance registry.
// ABOUTME: Liveness is inferred purely from expiring health keys.

mod monitor;

pub use monitor::*;

/// This host's name, or "unknown" when it is not valid UTF-8.
pub(crate) fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
