use std::sync::Arc;

use crate::framing::FramingError;

/// Errors surfaced by the pipeline to its caller.
///
/// Anything recoverable (a damaged packet, a truncated header) never gets this far.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
	#[error("missing url")]
	MissingUrl,

	#[error("unsupported transport scheme: {0}")]
	Scheme(String),

	#[error("no decoder available")]
	NoDecoder,

	#[error("already started")]
	AlreadyStarted,

	#[error("framing error: {0}")]
	Framing(#[from] FramingError),

	#[error("transport error: {0}")]
	Transport(Arc<anyhow::Error>),
}

pub type Result<T> = std::result::Result<T, Error>;
