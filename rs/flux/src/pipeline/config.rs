use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
	demux::{DemuxConfig, DemuxFormat, MetadataPolicy},
	playout::CatchUpMode,
};

/// Everything needed to run a [crate::pipeline::Pipeline].
///
/// Usable as command line arguments (flattened into a CLI command) or loaded from TOML.
#[derive(clap::Args, Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PipelineConfig {
	/// The WebSocket URL to read from, `ws://` or `wss://`.
	#[arg(long, env = "FLUX_URL")]
	pub url: Option<Url>,

	/// The container format of the stream.
	#[arg(long, value_enum, default_value_t = DemuxFormat::Flv, env = "FLUX_FORMAT")]
	pub format: DemuxFormat,

	/// The stream uses the TLV framing instead of a container.
	#[arg(long)]
	pub framing: bool,

	/// How to shed video when the client falls behind.
	#[arg(long, value_enum, default_value_t = CatchUpMode::DropToKey)]
	pub catch_up: CatchUpMode,

	/// The longest span of video to buffer before shedding.
	#[arg(long, default_value_t = 1000)]
	pub max_duration_ms: i64,

	/// The most video units to buffer before shedding.
	#[arg(long, default_value_t = 60)]
	pub max_frame_count: usize,

	/// Hold video back by this much behind the newest timestamp.
	#[arg(long, default_value_t = 0)]
	pub jitter_delay_ms: i64,

	/// Allow H.265 on the hardware decoder.
	#[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
	pub allow_h265: bool,

	/// Keep playing video when the audio decoder can't be configured.
	#[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
	pub audio_optional: bool,

	/// Only report which metadata streams exist, without their payloads.
	#[arg(long)]
	pub detect_only: bool,

	/// Deliver metadata payloads even in detect-only mode.
	#[arg(long)]
	pub extract_metadata: bool,

	/// The synthesised frame interval for raw Annex B streams.
	#[arg(long, default_value_t = 40)]
	pub annexb_frame_interval_ms: i64,

	/// The largest frame accepted in framing mode.
	#[arg(long, default_value_t = 8 * 1024 * 1024)]
	pub max_frame_size: usize,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			url: None,
			format: DemuxFormat::Flv,
			framing: false,
			catch_up: CatchUpMode::DropToKey,
			max_duration_ms: 1000,
			max_frame_count: 60,
			jitter_delay_ms: 0,
			allow_h265: true,
			audio_optional: true,
			detect_only: false,
			extract_metadata: false,
			annexb_frame_interval_ms: 40,
			max_frame_size: 8 * 1024 * 1024,
		}
	}
}

impl PipelineConfig {
	pub fn demux(&self) -> DemuxConfig {
		DemuxConfig {
			metadata: self.metadata(),
			annexb_frame_interval_ms: self.annexb_frame_interval_ms,
		}
	}

	pub fn metadata(&self) -> MetadataPolicy {
		MetadataPolicy {
			detect_only: self.detect_only,
			extract: self.extract_metadata,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		config: PipelineConfig,
	}

	#[test]
	fn cli_defaults_match() {
		let cli = Cli::try_parse_from(["flux"]).unwrap();
		let defaults = PipelineConfig::default();

		assert_eq!(cli.config.format, defaults.format);
		assert_eq!(cli.config.catch_up, defaults.catch_up);
		assert_eq!(cli.config.max_duration_ms, defaults.max_duration_ms);
		assert_eq!(cli.config.max_frame_count, defaults.max_frame_count);
		assert_eq!(cli.config.allow_h265, defaults.allow_h265);
		assert_eq!(cli.config.audio_optional, defaults.audio_optional);
		assert_eq!(cli.config.max_frame_size, defaults.max_frame_size);
	}

	#[test]
	fn cli_flags() {
		let cli = Cli::try_parse_from([
			"flux",
			"--url",
			"wss://example.com/live",
			"--format",
			"ts",
			"--catch-up",
			"drop-bp",
			"--allow-h265",
			"false",
		])
		.unwrap();

		assert_eq!(cli.config.url.unwrap().scheme(), "wss");
		assert_eq!(cli.config.format, DemuxFormat::Ts);
		assert_eq!(cli.config.catch_up, CatchUpMode::DropBp);
		assert!(!cli.config.allow_h265);
	}

	#[test]
	fn serde_partial() {
		let json = r#"{"format":"annex-b","catch-up":"latest","jitter-delay-ms":100}"#;
		let config: PipelineConfig = serde_json::from_str(json).unwrap();

		assert_eq!(config.format, DemuxFormat::AnnexB);
		assert_eq!(config.catch_up, CatchUpMode::Latest);
		assert_eq!(config.jitter_delay_ms, 100);
		assert_eq!(config.max_frame_count, 60);
	}
}
