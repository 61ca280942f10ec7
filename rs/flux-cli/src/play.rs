use std::{path::PathBuf, time::Duration};

use clap::{ArgMatches, Args};
use flux::{
	AccessUnit, Track,
	codec::CapabilityProbe,
	pipeline::{
		AudioConfig, AudioDecoder, AudioFrame, Event, Output, Pipeline, PipelineConfig, PipelineState, Presenter, Sinks,
		VideoConfig, VideoDecoder, VideoFrame,
	},
};

#[derive(Args, Clone, Debug)]
pub struct PlayArgs {
	/// Load the pipeline config from a TOML file. Flags given explicitly take precedence.
	#[arg(long)]
	pub config: Option<PathBuf>,

	#[command(flatten)]
	pub pipeline: PipelineConfig,

	/// Codec prefixes the hardware decoder accepts; everything else goes to the worker.
	#[arg(long, value_delimiter = ',', default_value = "avc1")]
	pub hardware: Vec<String>,

	/// How often to log stats, in seconds.
	#[arg(long, default_value_t = 1)]
	pub stats_interval: u64,
}

/// A decoder that accepts whatever it is configured to and passes units straight through.
struct PassthroughVideo {
	name: &'static str,
	accept: Vec<String>,
	output: Option<Output>,
}

#[async_trait::async_trait]
impl CapabilityProbe for PassthroughVideo {
	async fn is_supported(&self, codec: &str) -> bool {
		self.accept.iter().any(|prefix| codec.starts_with(prefix.as_str()))
	}
}

#[async_trait::async_trait]
impl VideoDecoder for PassthroughVideo {
	async fn configure(&mut self, config: VideoConfig, output: Output) -> anyhow::Result<()> {
		tracing::info!(decoder = self.name, ?config, "configured video");
		self.output = Some(output);
		Ok(())
	}

	async fn decode(&mut self, unit: AccessUnit) -> anyhow::Result<()> {
		let output = self.output.as_ref().ok_or_else(|| anyhow::anyhow!("not configured"))?;
		output.video(VideoFrame {
			timestamp: unit.timestamp,
			data: unit.payload,
		});
		Ok(())
	}

	async fn close(&mut self) {
		tracing::debug!(decoder = self.name, "closed video");
		self.output = None;
	}
}

struct PassthroughAudio {
	output: Option<Output>,
}

#[async_trait::async_trait]
impl AudioDecoder for PassthroughAudio {
	async fn configure(&mut self, config: AudioConfig, output: Output) -> anyhow::Result<()> {
		tracing::info!(?config, "configured audio");
		self.output = Some(output);
		Ok(())
	}

	async fn decode(&mut self, unit: AccessUnit) -> anyhow::Result<()> {
		// Nothing to decode with; report it as consumed.
		if let Some(output) = &self.output {
			output.empty(Track::Audio);
		}
		tracing::trace!(timestamp = unit.timestamp, size = unit.payload.len(), "audio unit");
		Ok(())
	}

	async fn close(&mut self) {
		self.output = None;
	}
}

struct LogPresenter;

#[async_trait::async_trait]
impl Presenter for LogPresenter {
	async fn render(&mut self, frame: VideoFrame) -> anyhow::Result<()> {
		tracing::trace!(timestamp = frame.timestamp, ?frame, "render");
		Ok(())
	}

	async fn play(&mut self, frame: AudioFrame) -> anyhow::Result<()> {
		tracing::trace!(timestamp = frame.timestamp, samples = frame.samples.len(), "play");
		Ok(())
	}
}

pub async fn play(args: PlayArgs, matches: &ArgMatches) -> anyhow::Result<()> {
	let config = match &args.config {
		Some(path) => crate::config::load(path, &args.pipeline, matches)?,
		None => args.pipeline.clone(),
	};

	let sinks = Sinks::new(LogPresenter)
		.with_hardware(PassthroughVideo {
			name: "hardware",
			accept: args.hardware.clone(),
			output: None,
		})
		.with_worker(PassthroughVideo {
			name: "worker",
			accept: vec!["avc1".to_string(), "hev1".to_string(), "hvc1".to_string()],
			output: None,
		})
		.with_audio(PassthroughAudio { output: None });

	let (mut pipeline, mut events) = Pipeline::new(config, sinks);
	pipeline.start().await?;

	let mut interval = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));

	loop {
		tokio::select! {
			Some(event) = events.recv() => log_event(event),
			_ = interval.tick() => {
				let stats = pipeline.stats();
				tracing::info!(
					bitrate_kbps = format!("{:.1}", stats.bitrate_kbps),
					fps = format!("{:.1}", stats.fps),
					audio_fps = format!("{:.1}", stats.audio_fps),
					av_sync_ms = ?stats.av_sync_ms,
					dropped = stats.dropped,
					"stats"
				);
			}
			_ = tokio::signal::ctrl_c() => {
				tracing::info!("interrupted");
				pipeline.stop().await;
				break;
			}
		}

		if matches!(pipeline.state(), PipelineState::Stopped | PipelineState::Faulted) {
			break;
		}
	}

	pipeline.closed().await;
	while let Ok(event) = events.try_recv() {
		log_event(event);
	}

	match pipeline.state() {
		PipelineState::Faulted => anyhow::bail!("pipeline faulted"),
		_ => Ok(()),
	}
}

fn log_event(event: Event) {
	match event {
		Event::Error(err) => tracing::error!(%err, "pipeline error"),
		Event::Network(reason) => tracing::warn!(%reason, "network"),
		Event::Fallback(reason) => tracing::warn!(%reason, "fallback requested"),
		Event::CatchUp(event) => tracing::debug!(?event, "caught up"),
		Event::Metadata(event) => tracing::info!(?event, "metadata"),
		event => tracing::info!(?event, "event"),
	}
}
