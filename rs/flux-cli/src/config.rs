use std::path::Path;

use anyhow::Context;
use clap::{ArgMatches, parser::ValueSource};
use flux::pipeline::PipelineConfig;

/// Load a pipeline config from a TOML file, then apply any flags given explicitly.
///
/// Flags left at their defaults don't override the file.
pub fn load(path: &Path, cli: &PipelineConfig, matches: &ArgMatches) -> anyhow::Result<PipelineConfig> {
	let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
	let mut table: toml::Table = toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;

	let flags = toml::Table::try_from(cli).context("failed to serialize flags")?;
	for id in matches.ids() {
		if !matches!(
			matches.value_source(id.as_str()),
			Some(ValueSource::CommandLine | ValueSource::EnvVariable)
		) {
			continue;
		}

		let key = id.as_str().replace('_', "-");
		if let Some(value) = flags.get(&key) {
			tracing::debug!(%key, %value, "flag overrides config file");
			table.insert(key, value.clone());
		}
	}

	let config: PipelineConfig = table.try_into().context("invalid config")?;
	tracing::trace!(?config, "final config");

	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::{CommandFactory, FromArgMatches, Parser};
	use flux::{demux::DemuxFormat, playout::CatchUpMode};
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		pipeline: PipelineConfig,
	}

	fn load_with(file: &str, args: &[&str]) -> PipelineConfig {
		static NEXT: AtomicUsize = AtomicUsize::new(0);
		let id = NEXT.fetch_add(1, Ordering::Relaxed);
		let path = std::env::temp_dir().join(format!("flux-config-{}-{id}.toml", std::process::id()));
		std::fs::write(&path, file).unwrap();

		let matches = Cli::command().get_matches_from(std::iter::once("flux").chain(args.iter().copied()));
		let cli = Cli::from_arg_matches(&matches).unwrap();

		let config = load(&path, &cli.pipeline, &matches).unwrap();
		std::fs::remove_file(&path).unwrap();
		config
	}

	#[test]
	fn file_then_flags() {
		let file = r#"
			url = "wss://example.com/live"
			format = "ts"
			catch-up = "drop-b"
			max-duration-ms = 3000
		"#;

		let config = load_with(file, &["--max-duration-ms", "500"]);
		assert_eq!(config.url.unwrap().as_str(), "wss://example.com/live");
		assert_eq!(config.format, DemuxFormat::Ts);
		assert_eq!(config.catch_up, CatchUpMode::DropB);
		assert_eq!(config.max_duration_ms, 500);

		// Untouched by either.
		assert_eq!(config.max_frame_count, 60);
	}

	#[test]
	fn defaults_do_not_override() {
		let config = load_with("format = \"ps\"\n", &[]);
		assert_eq!(config.format, DemuxFormat::Ps);
	}
}
