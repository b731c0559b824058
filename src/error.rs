use thiserror::Error;

/// Construction-time and programming errors surfaced to callers.
///
/// Lifecycle inconsistencies (a hook referencing a request-id the monitor
/// never saw arrive) and unknown-URL stats lookups are *not* represented
/// here: the monitor self-heals those inline, per the error taxonomy.
#[derive(Error, Debug)]
pub enum RouterError {
	#[error("policy registry has not been initialized; call PolicyRegistry::initialize first")]
	PolicyNotInitialized,
	#[error("invalid policy selector: {0}")]
	InvalidPolicySelector(String),
	#[error("session router requires a configured session header name")]
	SessionKeyMissing,
	#[error("request id must not be empty")]
	EmptyRequestId,
	#[error("internal error: {0}")]
	Internal(String),
}
