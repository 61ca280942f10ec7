use bytes::Bytes;

use crate::{demux::MetadataEvent, playout::CatchUpEvent};

/// Why the pipeline asked its caller to fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FallbackReason {
	#[display("video decoding kept failing")]
	VideoDecode,
	#[display("the worker decoder stopped producing frames")]
	WorkerStalled,
	#[display("no decoder supports the video codec")]
	VideoUnsupported,
	#[display("audio is required but could not be decoded")]
	Audio,
}

/// Notifications from a running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
	/// The transport is connected and chunks are flowing.
	Ready,

	/// A non-fatal error; the pipeline keeps running.
	Error(String),

	/// The transport failed or closed; the pipeline has stopped.
	Network(String),

	/// The pipeline can't continue with this decoder setup.
	///
	/// There is no internal retry; the caller should restart or switch transport.
	Fallback(FallbackReason),

	/// Audio could not be configured and has been disabled for the session.
	AudioDisabled,

	/// Catch-up dropped video.
	CatchUp(CatchUpEvent),

	Metadata(MetadataEvent),

	/// An opaque control payload from the framing protocol.
	Control(Bytes),
}
