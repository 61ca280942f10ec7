use std::sync::Arc;

use bytes::Bytes;
use derive_more::Debug;
use tokio::sync::mpsc;

use crate::{AccessUnit, Track, codec::CapabilityProbe};

/// The configuration handed to a video decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfig {
	/// The codec string, WebCodecs registry syntax.
	pub codec: String,

	/// The coded size, when the SPS or the stream-info record reveals it.
	pub coded_width: Option<u32>,
	pub coded_height: Option<u32>,
}

/// The configuration handed to an audio decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
	pub codec: String,
	pub sample_rate: u32,
	pub channels: u8,

	#[debug("{:?}", description.as_ref().map(|d| d.len()))]
	pub description: Option<Bytes>,
}

/// A decoded picture, opaque to the pipeline.
#[derive(Debug, Clone)]
pub struct VideoFrame {
	pub timestamp: i64,
	#[debug("{} bytes", data.len())]
	pub data: Bytes,
}

/// Decoded audio as interleaved samples in the range -1.0..1.0.
#[derive(Debug, Clone)]
pub struct AudioFrame {
	pub timestamp: i64,
	pub sample_rate: u32,
	pub channels: u8,
	#[debug("{} samples", samples.len())]
	pub samples: Arc<[f32]>,
}

#[derive(Debug)]
pub(crate) enum Decoded {
	Video(VideoFrame),
	Audio(AudioFrame),

	/// The decoder consumed a unit without producing anything.
	Empty(Track),

	Error(Track, Arc<anyhow::Error>),
}

/// Where decoders deliver their output.
///
/// Output is asynchronous: a decoder may deliver any time after [VideoDecoder::decode] returns.
#[derive(Clone)]
pub struct Output {
	tx: mpsc::UnboundedSender<Decoded>,
}

impl Output {
	pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Decoded>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	pub fn video(&self, frame: VideoFrame) {
		self.send(Decoded::Video(frame));
	}

	pub fn audio(&self, frame: AudioFrame) {
		self.send(Decoded::Audio(frame));
	}

	/// Report that a unit produced no output.
	pub fn empty(&self, track: Track) {
		self.send(Decoded::Empty(track));
	}

	/// Report an asynchronous decode failure.
	pub fn error(&self, track: Track, err: anyhow::Error) {
		self.send(Decoded::Error(track, Arc::new(err)));
	}

	fn send(&self, decoded: Decoded) {
		// The pipeline has stopped, nobody cares anymore.
		let _ = self.tx.send(decoded);
	}
}

/// A video decoder supplied by the embedder, hardware or software.
#[async_trait::async_trait]
pub trait VideoDecoder: CapabilityProbe {
	/// (Re)configure the decoder. Called again whenever the stream's codec changes.
	async fn configure(&mut self, config: VideoConfig, output: Output) -> anyhow::Result<()>;

	/// Queue an access unit. Decoded frames are delivered through the [Output].
	async fn decode(&mut self, unit: AccessUnit) -> anyhow::Result<()>;

	async fn close(&mut self);
}

/// An audio decoder supplied by the embedder.
#[async_trait::async_trait]
pub trait AudioDecoder: Send {
	async fn configure(&mut self, config: AudioConfig, output: Output) -> anyhow::Result<()>;
	async fn decode(&mut self, unit: AccessUnit) -> anyhow::Result<()>;
	async fn close(&mut self);
}

/// Draws video and plays audio.
#[async_trait::async_trait]
pub trait Presenter: Send {
	async fn render(&mut self, frame: VideoFrame) -> anyhow::Result<()>;
	async fn play(&mut self, frame: AudioFrame) -> anyhow::Result<()>;
}

/// The decoders and presenter a pipeline dispatches to.
///
/// The hardware decoder is preferred; the worker decoder is the fallback path.
/// At least one of them is required to start.
pub struct Sinks {
	pub hardware: Option<Box<dyn VideoDecoder>>,
	pub worker: Option<Box<dyn VideoDecoder>>,
	pub audio: Option<Box<dyn AudioDecoder>>,
	pub presenter: Box<dyn Presenter>,
}

impl Sinks {
	pub fn new(presenter: impl Presenter + 'static) -> Self {
		Self {
			hardware: None,
			worker: None,
			audio: None,
			presenter: Box::new(presenter),
		}
	}

	pub fn with_hardware(mut self, decoder: impl VideoDecoder + 'static) -> Self {
		self.hardware = Some(Box::new(decoder));
		self
	}

	pub fn with_worker(mut self, decoder: impl VideoDecoder + 'static) -> Self {
		self.worker = Some(Box::new(decoder));
		self
	}

	pub fn with_audio(mut self, decoder: impl AudioDecoder + 'static) -> Self {
		self.audio = Some(Box::new(decoder));
		self
	}
}
