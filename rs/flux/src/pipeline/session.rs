use std::{
	fmt,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
	AccessUnit, Error, Result, Track,
	codec::{AudioCodec, CodecHints, Family, decide_decoder_config, family_of, split_annexb, sps_dimensions},
	demux::{Demuxer, Metadata, MetadataEvent},
	framing::{Framed, FramingDecoder},
	pipeline::{
		AudioConfig, AudioDecoder, AudioFrame, Decoded, Event, FallbackReason, Output, PipelineConfig, Presenter,
		Sinks, StatsTracker, VideoConfig, VideoDecoder, g711,
	},
	playout::{JitterBuffer, apply_catch_up},
};

// Consecutive decode failures before giving up on a path.
const MAX_DECODE_FAILURES: u32 = 3;

// Consecutive empty results tolerated from the worker path.
const MAX_EMPTY_RESULTS: u32 = 8;

/// Which video decoder is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
	Hardware,
	Worker,
}

/// State shared between the [crate::pipeline::Pipeline] handle and its task.
#[derive(Debug, Default)]
pub(crate) struct Shared {
	pub extract: AtomicBool,
	pub detected: Mutex<Detected>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Detected {
	pub sei_types: Vec<u32>,
	pub private_ids: Vec<u16>,
}

enum Input {
	Demux(Demuxer),
	Framing {
		decoder: FramingDecoder,

		// SEI carried inside framed video.
		metadata: Metadata,
	},
}

struct Video {
	hardware: Option<Box<dyn VideoDecoder>>,
	worker: Option<Box<dyn VideoDecoder>>,
	path: DecodePath,

	// The configured codec string, None until configured or after invalidation.
	configured: Option<String>,
	derived_supported: bool,

	hints: CodecHints,
	size: Option<(u32, u32)>,

	failures: u32,
	empties: u32,
}

impl Video {
	fn decoder(&mut self) -> Option<&mut Box<dyn VideoDecoder>> {
		match self.path {
			DecodePath::Hardware => self.hardware.as_mut(),
			DecodePath::Worker => self.worker.as_mut(),
		}
	}

	// Move from the hardware decoder to the worker, returning false if that's not possible.
	async fn switch_to_worker(&mut self) -> bool {
		if self.path == DecodePath::Worker || self.worker.is_none() {
			return false;
		}

		if let Some(hardware) = self.hardware.as_mut() {
			hardware.close().await;
		}

		tracing::warn!("switching to the worker decoder");
		self.path = DecodePath::Worker;
		self.configured = None;
		self.failures = 0;
		self.empties = 0;
		true
	}
}

struct Audio {
	decoder: Option<Box<dyn AudioDecoder>>,

	// Configuration is attempted once per session.
	attempted: bool,
	disabled: bool,
	failures: u32,
}

/// The per-connection state, owned and mutated only by the pipeline task.
pub(crate) struct Session {
	config: PipelineConfig,
	input: Input,

	jitter: JitterBuffer,
	latest: Option<i64>,

	video: Video,
	audio: Audio,
	presenter: Box<dyn Presenter>,
	output: Output,

	// Set once the caller has been asked to fall back; nothing is decoded afterwards.
	fallback: bool,

	extract: bool,
	staged: Vec<MetadataEvent>,

	shared: Arc<Shared>,
	stats: StatsTracker,
	events: mpsc::UnboundedSender<Event>,
}

impl Session {
	pub fn new(
		config: PipelineConfig,
		sinks: Sinks,
		output: Output,
		events: mpsc::UnboundedSender<Event>,
		stats: StatsTracker,
		shared: Arc<Shared>,
	) -> Result<Self> {
		let path = match (&sinks.hardware, &sinks.worker) {
			(Some(_), _) => DecodePath::Hardware,
			(None, Some(_)) => DecodePath::Worker,
			(None, None) => return Err(Error::NoDecoder),
		};

		// Extraction may have been toggled before the pipeline started.
		let extract = shared.extract.load(Ordering::Relaxed);

		let input = match config.framing {
			true => {
				let mut metadata = Metadata::new(config.metadata());
				metadata.policy.extract = extract;
				Input::Framing {
					decoder: FramingDecoder::new(config.max_frame_size),
					metadata,
				}
			}
			false => {
				let mut demux = config.demux();
				demux.metadata.extract = extract;
				Input::Demux(Demuxer::new(config.format, demux))
			}
		};

		Ok(Self {
			jitter: JitterBuffer::new(config.max_duration_ms, config.max_frame_count),
			latest: None,
			video: Video {
				hardware: sinks.hardware,
				worker: sinks.worker,
				path,
				configured: None,
				derived_supported: false,
				hints: CodecHints::default(),
				size: None,
				failures: 0,
				empties: 0,
			},
			audio: Audio {
				decoder: sinks.audio,
				attempted: false,
				disabled: false,
				failures: 0,
			},
			presenter: sinks.presenter,
			output,
			fallback: false,
			extract,
			staged: Vec::new(),
			input,
			config,
			shared,
			stats,
			events,
		})
	}

	pub fn emit(&self, event: Event) {
		let _ = self.events.send(event);
	}

	/// Process one chunk to completion.
	///
	/// Only systemic failures are returned; everything else is logged or reported as an event.
	pub async fn chunk(&mut self, chunk: Bytes) -> Result<()> {
		self.stats.record_bytes(chunk.len());
		self.apply_extraction();

		match &mut self.input {
			Input::Demux(demuxer) => {
				let units = demuxer.demux(&chunk);
				self.staged.extend(demuxer.take_metadata());
				self.process(units).await;
			}
			Input::Framing { decoder, metadata } => {
				let frames = decoder.decode(&chunk)?;
				for frame in &frames {
					if let Framed::Unit(unit) = frame {
						scan_sei(metadata, unit);
					}
				}
				self.staged.extend(metadata.take());
				self.frames(frames).await;
			}
		}

		self.publish_detected();
		self.flush_metadata();

		Ok(())
	}

	/// Drain everything at the end of the stream.
	pub async fn finish(&mut self) {
		if let Input::Demux(demuxer) = &mut self.input {
			let units = demuxer.flush();
			self.staged.extend(demuxer.take_metadata());
			self.process(units).await;
		}

		for unit in self.jitter.pop_until(i64::MAX) {
			self.decode_video(unit).await;
		}

		self.publish_detected();
		self.flush_metadata();
	}

	pub async fn close(&mut self) {
		self.jitter.clear();

		if let Some(decoder) = self.video.hardware.as_mut() {
			decoder.close().await;
		}
		if let Some(decoder) = self.video.worker.as_mut() {
			decoder.close().await;
		}
		if let Some(decoder) = self.audio.decoder.as_mut() {
			decoder.close().await;
		}
	}

	fn apply_extraction(&mut self) {
		let extract = self.shared.extract.load(Ordering::Relaxed);
		if extract == self.extract {
			return;
		}

		tracing::debug!(extract, "metadata extraction changed");
		self.extract = extract;
		match &mut self.input {
			Input::Demux(demuxer) => demuxer.set_extraction(extract),
			Input::Framing { metadata, .. } => metadata.policy.extract = extract,
		}
	}

	async fn frames(&mut self, frames: Vec<Framed>) {
		let mut units = Vec::new();

		for frame in frames {
			match frame {
				Framed::Unit(unit) => units.push(unit),
				Framed::StreamInfo { info, invalidated } => {
					// Units before the record belong to the previous configuration.
					self.process(std::mem::take(&mut units)).await;

					self.video.hints = info.codec_hints();
					self.video.size = info.width.zip(info.height);

					if invalidated && self.video.configured.is_some() {
						tracing::info!(codec = ?info.video_codec, "stream info changed, reconfiguring");
						self.video.configured = None;
					}
				}
				Framed::Control(payload) => self.emit(Event::Control(payload)),
				Framed::Invalid(err) => self.emit(Event::Error(format!("framing: {err}"))),
			}
		}

		self.process(units).await;
	}

	async fn process(&mut self, units: Vec<AccessUnit>) {
		let mut video = Vec::new();

		for unit in units {
			if unit.is_video() {
				if self.discontinuity(unit.timestamp) {
					// Play out the old timeline before starting over.
					let held = self.jitter.pop_until(i64::MAX);
					for unit in held.into_iter().chain(video.drain(..)) {
						self.decode_video(unit).await;
					}
					self.latest = None;
				}

				self.latest = Some(self.latest.map_or(unit.timestamp, |latest| latest.max(unit.timestamp)));
				video.push(unit);
			} else {
				self.decode_audio(unit).await;
			}
		}

		let Some(latest) = self.latest else {
			return;
		};

		let trimmed = self.jitter.push(video);
		let lagging = self.jitter.drop_lagging(latest);
		let due = self.jitter.pop_until(latest - self.config.jitter_delay_ms);

		let catch_up = apply_catch_up(
			due,
			self.config.catch_up,
			latest,
			self.config.max_duration_ms,
			self.config.max_frame_count,
		);

		self.stats.record_dropped(trimmed + lagging + catch_up.dropped);
		if let Some(event) = catch_up.event {
			self.emit(Event::CatchUp(event));
		}

		for unit in catch_up.kept {
			self.decode_video(unit).await;
		}
	}

	// A jump backwards by more than the buffer span: a clock reset, a new framing base or a PTS wrap.
	fn discontinuity(&self, timestamp: i64) -> bool {
		let Some(latest) = self.latest else {
			return false;
		};

		if timestamp >= latest - self.config.max_duration_ms {
			return false;
		}

		tracing::warn!(timestamp, latest, held = self.jitter.len(), "timestamp discontinuity");
		true
	}

	async fn decode_video(&mut self, unit: AccessUnit) {
		if self.fallback {
			return;
		}

		if self.video.configured.is_none() {
			if !unit.keyframe {
				tracing::trace!(timestamp = unit.timestamp, "waiting for a keyframe");
				self.stats.record_dropped(1);
				return;
			}

			if !self.configure_video(&unit).await {
				return;
			}
		}

		let Some(decoder) = self.video.decoder() else {
			return;
		};

		if let Err(err) = decoder.decode(unit).await {
			self.video_failure(err).await;
		}
	}

	async fn configure_video(&mut self, unit: &AccessUnit) -> bool {
		loop {
			let path = self.video.path;

			match self.try_configure_video(unit).await {
				Ok(codec) => {
					tracing::info!(?path, %codec, "configured video decoder");
					self.video.configured = Some(codec);
					self.video.failures = 0;
					self.video.empties = 0;
					return true;
				}
				Err(err) => {
					tracing::warn!(?path, %err, "failed to configure video decoder");
					if self.video.switch_to_worker().await {
						continue;
					}

					self.emit(Event::Error(format!("video: {err:#}")));
					self.request_fallback(FallbackReason::VideoUnsupported);
					return false;
				}
			}
		}
	}

	async fn try_configure_video(&mut self, unit: &AccessUnit) -> anyhow::Result<String> {
		// The worker negotiates with H.265 permitted.
		let allow_h265 = self.config.allow_h265 || self.video.path == DecodePath::Worker;
		let output = self.output.clone();

		let video = &mut self.video;
		let decoder = match video.path {
			DecodePath::Hardware => video.hardware.as_deref_mut(),
			DecodePath::Worker => video.worker.as_deref_mut(),
		}
		.context("no video decoder")?;

		let decision = decide_decoder_config(unit, &video.hints, allow_h265, &*decoder).await;
		video.derived_supported = decision.derived_supported;

		let Some(codec) = decision.codec else {
			anyhow::bail!(
				"unsupported codec {}: {}",
				decision.derived.as_deref().unwrap_or("unknown"),
				decision.reason
			);
		};

		let size = match (decision.family, decision.parameter_sets.sps.as_deref()) {
			(Some(Family::H264), Some(sps)) => sps_dimensions(sps),
			_ => None,
		}
		.or(video.size);

		let config = VideoConfig {
			codec: codec.clone(),
			coded_width: size.map(|(width, _)| width),
			coded_height: size.map(|(_, height)| height),
		};

		decoder.configure(config, output).await?;
		Ok(codec)
	}

	async fn video_failure(&mut self, err: impl fmt::Display) {
		self.video.failures += 1;
		tracing::warn!(path = ?self.video.path, failures = self.video.failures, %err, "video decode failed");

		// The hardware decoder accepted a codec the bitstream doesn't actually match.
		if self.video.path == DecodePath::Hardware && !self.video.derived_supported && self.video.switch_to_worker().await
		{
			return;
		}

		if self.video.failures >= MAX_DECODE_FAILURES {
			self.request_fallback(FallbackReason::VideoDecode);
		}
	}

	async fn decode_audio(&mut self, unit: AccessUnit) {
		if self.fallback || self.audio.disabled {
			return;
		}

		let codec = match unit.codec.as_deref().map(str::parse::<AudioCodec>) {
			Some(Ok(codec)) => codec,
			Some(Err(err)) => {
				tracing::trace!(%err, "dropping audio with an unknown codec");
				return;
			}
			None => {
				tracing::trace!(timestamp = unit.timestamp, "dropping audio without a codec");
				return;
			}
		};

		if let Some(samples) = g711::decode(&codec, &unit.payload) {
			let frame = AudioFrame {
				timestamp: unit.timestamp,
				sample_rate: unit.sample_rate.unwrap_or(8000),
				channels: unit.channels.unwrap_or(1),
				samples: samples.into(),
			};

			self.stats.record_audio(frame.timestamp);
			if let Err(err) = self.presenter.play(frame).await {
				tracing::warn!(%err, "failed to play audio");
			}
			return;
		}

		if !self.audio.attempted {
			self.audio.attempted = true;

			if let Err(err) = self.configure_audio(&codec, &unit).await {
				self.audio_unavailable(err).await;
				return;
			}
		}

		let Some(decoder) = self.audio.decoder.as_mut() else {
			return;
		};

		match decoder.decode(unit).await {
			Ok(()) => {}
			Err(err) => self.audio_failure(err).await,
		}
	}

	async fn configure_audio(&mut self, codec: &AudioCodec, unit: &AccessUnit) -> anyhow::Result<()> {
		let output = self.output.clone();
		let decoder = self.audio.decoder.as_mut().context("no audio decoder")?;

		if codec.requires_description() && unit.description.is_none() {
			anyhow::bail!("{codec} requires a decoder description");
		}

		let config = AudioConfig {
			codec: codec.to_string(),
			sample_rate: unit.sample_rate.unwrap_or(48000),
			channels: unit.channels.unwrap_or(2),
			description: unit.description.clone(),
		};

		tracing::info!(?config, "configuring audio decoder");
		decoder.configure(config, output).await
	}

	async fn audio_failure(&mut self, err: impl fmt::Display) {
		self.audio.failures += 1;
		tracing::warn!(failures = self.audio.failures, %err, "audio decode failed");

		if self.audio.failures >= MAX_DECODE_FAILURES {
			self.audio_unavailable(anyhow::anyhow!("too many decode failures")).await;
		}
	}

	async fn audio_unavailable(&mut self, err: anyhow::Error) {
		tracing::warn!(%err, optional = self.config.audio_optional, "audio unavailable");
		self.emit(Event::Error(format!("audio: {err:#}")));

		if !self.config.audio_optional {
			self.request_fallback(FallbackReason::Audio);
			return;
		}

		self.audio.disabled = true;
		if let Some(decoder) = self.audio.decoder.as_mut() {
			decoder.close().await;
		}
		self.emit(Event::AudioDisabled);
	}

	/// Handle output delivered by a decoder.
	pub async fn output(&mut self, decoded: Decoded) {
		match decoded {
			Decoded::Video(frame) => {
				self.video.failures = 0;
				self.video.empties = 0;
				self.stats.record_video(frame.timestamp);

				if let Err(err) = self.presenter.render(frame).await {
					tracing::warn!(%err, "failed to render video");
				}
			}
			Decoded::Audio(frame) => {
				self.audio.failures = 0;
				self.stats.record_audio(frame.timestamp);

				if let Err(err) = self.presenter.play(frame).await {
					tracing::warn!(%err, "failed to play audio");
				}
			}
			Decoded::Empty(Track::Video) if self.video.path == DecodePath::Worker => {
				self.video.empties += 1;
				tracing::debug!(empties = self.video.empties, "worker produced no frame");

				if self.video.empties > MAX_EMPTY_RESULTS {
					self.request_fallback(FallbackReason::WorkerStalled);
				}
			}
			Decoded::Empty(_) => {}
			Decoded::Error(Track::Video, err) => self.video_failure(err).await,
			Decoded::Error(Track::Audio, err) => self.audio_failure(err).await,
		}
	}

	fn request_fallback(&mut self, reason: FallbackReason) {
		if self.fallback {
			return;
		}

		tracing::warn!(%reason, "requesting fallback");
		self.fallback = true;
		self.emit(Event::Fallback(reason));
	}

	fn publish_detected(&mut self) {
		let detected = match &mut self.input {
			Input::Demux(demuxer) => Detected {
				sei_types: demuxer.detected_sei_types(),
				private_ids: demuxer.detected_private_ids(),
			},
			Input::Framing { metadata, .. } => Detected {
				sei_types: metadata.sei_types(),
				private_ids: Vec::new(),
			},
		};
		*self.shared.detected.lock() = detected;
	}

	// Deliver the staged metadata in presentation order, after the chunk's frames.
	fn flush_metadata(&mut self) {
		let mut staged = std::mem::take(&mut self.staged);
		staged.sort_by_key(|event| event.timestamp());

		for event in staged {
			self.emit(Event::Metadata(event));
		}
	}
}

// Framed video is Annex B; the family comes from the signalled codec, or from the first NAL when there is none.
fn scan_sei(metadata: &mut Metadata, unit: &AccessUnit) {
	if !unit.is_video() {
		return;
	}

	let family = match unit.codec.as_deref().and_then(family_of) {
		Some(family) => Some(family),
		None => split_annexb(&unit.payload).find_map(Family::detect),
	};

	if let Some(family) = family {
		metadata.sei_in(family, &unit.payload, unit.timestamp);
	}
}
