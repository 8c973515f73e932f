use thiserror::Error;

/// Every fallible operation in the core returns one of these. The variant determines how the
/// caller reacts: fatal errors abort startup, everything else is scoped to a single tick or
/// a single directory entry and never brings the control loop down.
#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("transient cluster API error: {0}")]
    TransientApi(#[source] kube::Error),

    #[error("probe failed for {path}: {source}")]
    ProbeFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cleanup failed for {pv_name}: {reason}")]
    CleanupFailure { pv_name: String, reason: String },

    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
}

/// Classification of a cluster-API call outcome. `Conflict` and `NotFound` are treated as
/// success by callers that only care about idempotence (create-if-absent, delete-if-present).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOutcome {
    Conflict,
    NotFound,
    Transient,
    Fatal,
}

/// Classifies a `kube::Error` the way callers need to branch on it: a 409 means someone else
/// already wrote the object (treat as success for idempotent writers), a 404 means it's already
/// gone (also success for deleters), anything 5xx-shaped is worth retrying, everything else is
/// a real problem.
pub fn classify_api_error(err: &kube::Error) -> ApiOutcome {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => ApiOutcome::Conflict,
            404 => ApiOutcome::NotFound,
            500..=599 => ApiOutcome::Transient,
            _ => ApiOutcome::Fatal,
        },
        // Anything that didn't even make it to a typed API response (connection reset,
        // timeout, TLS handshake failure, ...) is worth a retry rather than a hard failure.
        _ => ApiOutcome::Transient,
    }
}

/// True if this error should be swallowed by an idempotent create/delete caller.
pub fn is_benign(err: &kube::Error) -> bool {
    matches!(
        classify_api_error(err),
        ApiOutcome::Conflict | ApiOutcome::NotFound
    )
}

pub type Result<T> = std::result::Result<T, ProvisionerError>;
