use clap::Args;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Logging flags shared by every command.
#[derive(Args, Clone, Debug)]
pub struct Log {
	/// The default level; RUST_LOG directives take precedence.
	#[arg(long = "log-level", default_value_t = tracing::Level::INFO, env = "FLUX_LOG_LEVEL", global = true)]
	pub level: tracing::Level,
}

impl Log {
	pub fn level(&self) -> LevelFilter {
		LevelFilter::from_level(self.level)
	}

	pub fn init(&self) {
		let filter = EnvFilter::builder()
			.with_default_directive(self.level().into())
			.from_env_lossy()
			.add_directive("tungstenite=warn".parse().unwrap())
			.add_directive("tokio_tungstenite=warn".parse().unwrap());

		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.init();
	}
}
