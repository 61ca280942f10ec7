mod config;
mod inspect;
mod log;
mod play;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use inspect::*;
use log::*;
use play::*;

#[derive(Parser, Clone)]
#[command(name = "flux", version, about)]
pub struct Cli {
	#[command(flatten)]
	log: Log,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Clone)]
pub enum Command {
	/// Demux a recorded stream and print what's inside.
	Inspect(InspectArgs),

	/// Connect to a live stream and run the full pipeline with pass-through decoders.
	Play(PlayArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let matches = Cli::command().get_matches();
	let cli = Cli::from_arg_matches(&matches)?;
	cli.log.init();

	match cli.command {
		Command::Inspect(args) => inspect(args).await,
		Command::Play(args) => {
			let matches = matches.subcommand_matches("play").unwrap_or(&matches);
			play(args, matches).await
		}
	}
}
