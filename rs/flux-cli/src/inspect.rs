use std::path::PathBuf;

use anyhow::Context;
use bytes::BytesMut;
use clap::Args;
use flux::{
	AccessUnit, Track,
	codec::{ParameterSets, derive_codec_string},
	demux::{DemuxConfig, DemuxFormat, Demuxer, MetadataEvent, MetadataPolicy},
	framing::{Framed, FramingDecoder},
};
use tokio::io::AsyncReadExt;

#[derive(Args, Clone, Debug)]
pub struct InspectArgs {
	/// The file to read.
	pub path: PathBuf,

	/// The container format, guessed from the extension if omitted.
	#[arg(long, value_enum)]
	pub format: Option<DemuxFormat>,

	/// Parse the file as the framing protocol instead of a container.
	#[arg(long)]
	pub framing: bool,

	/// Feed the parser in chunks of this many bytes.
	#[arg(long, default_value_t = 64 * 1024)]
	pub chunk_size: usize,

	/// Print metadata payloads, not just their detection.
	#[arg(long)]
	pub extract_metadata: bool,

	/// Print every access unit instead of a summary.
	#[arg(long)]
	pub units: bool,
}

#[derive(Default)]
struct Summary {
	video: usize,
	audio: usize,
	keyframes: usize,
	bytes: usize,
	first: Option<i64>,
	last: Option<i64>,
	codecs: Vec<String>,
}

impl Summary {
	fn unit(&mut self, unit: &AccessUnit, verbose: bool) {
		match unit.track {
			Track::Video => self.video += 1,
			Track::Audio => self.audio += 1,
		}
		if unit.is_video() && unit.keyframe {
			self.keyframes += 1;
		}
		self.bytes += unit.payload.len();
		self.first = Some(self.first.map_or(unit.timestamp, |t| t.min(unit.timestamp)));
		self.last = Some(self.last.map_or(unit.timestamp, |t| t.max(unit.timestamp)));

		let codec = match unit.track {
			Track::Video if unit.keyframe => {
				derive_codec_string(&ParameterSets::scan(&unit.payload), unit.codec.as_deref()).or(unit.codec.clone())
			}
			_ => unit.codec.clone(),
		};
		if let Some(codec) = codec {
			if !self.codecs.contains(&codec) {
				self.codecs.push(codec);
			}
		}

		if verbose {
			println!(
				"{:?} ts={} key={} size={} codec={}",
				unit.track,
				unit.timestamp,
				unit.keyframe,
				unit.payload.len(),
				unit.codec.as_deref().unwrap_or("-"),
			);
		}
	}

	fn print(&self) {
		println!("video units: {} ({} keyframes)", self.video, self.keyframes);
		println!("audio units: {}", self.audio);
		println!("payload bytes: {}", self.bytes);
		if let (Some(first), Some(last)) = (self.first, self.last) {
			println!("timestamps: {first}..{last} ms");
		}
		println!("codecs: {}", self.codecs.join(", "));
	}
}

fn metadata(event: &MetadataEvent) {
	match event {
		MetadataEvent::SeiDetected { payload_type, timestamp } => {
			println!("sei detected: type={payload_type} ts={timestamp}")
		}
		MetadataEvent::Sei {
			payload_type,
			timestamp,
			payload,
		} => println!("sei: type={payload_type} ts={timestamp} {}", preview(payload)),
		MetadataEvent::PrivateDataDetected {
			id,
			stream_type,
			timestamp,
		} => println!("private data detected: id={id} type={stream_type:#04x} ts={timestamp}"),
		MetadataEvent::PrivateData {
			id,
			stream_type,
			timestamp,
			payload,
		} => println!(
			"private data: id={id} type={stream_type:#04x} ts={timestamp} {}",
			preview(payload)
		),
	}
}

// At most 32 bytes of hex.
fn preview(payload: &[u8]) -> String {
	let shown = &payload[..payload.len().min(32)];
	match shown.len() < payload.len() {
		true => format!("{}... ({} bytes)", hex::encode(shown), payload.len()),
		false => hex::encode(shown),
	}
}

enum Parser {
	Demux(Demuxer),
	Framing(FramingDecoder),
}

pub async fn inspect(args: InspectArgs) -> anyhow::Result<()> {
	let mut parser = match args.framing {
		true => Parser::Framing(FramingDecoder::new(usize::MAX)),
		false => {
			let format = match args.format {
				Some(format) => format,
				None => DemuxFormat::guess(&args.path.to_string_lossy())
					.context("unknown file extension, pass --format")?,
			};

			let config = DemuxConfig {
				metadata: MetadataPolicy {
					detect_only: !args.extract_metadata,
					extract: args.extract_metadata,
				},
				..Default::default()
			};

			tracing::info!(%format, path = %args.path.display(), "inspecting");
			Parser::Demux(Demuxer::new(format, config))
		}
	};

	let mut file = tokio::fs::File::open(&args.path)
		.await
		.with_context(|| format!("failed to open {}", args.path.display()))?;

	let mut summary = Summary::default();
	let mut buffer = BytesMut::with_capacity(args.chunk_size);

	loop {
		buffer.clear();
		let mut chunk = (&mut file).take(args.chunk_size as u64);
		if chunk.read_buf(&mut buffer).await? == 0 {
			break;
		}

		match &mut parser {
			Parser::Demux(demuxer) => {
				for unit in demuxer.demux(&buffer) {
					summary.unit(&unit, args.units);
				}
				demuxer.take_metadata().iter().for_each(metadata);
			}
			Parser::Framing(framing) => {
				for frame in framing.decode(&buffer)? {
					match frame {
						Framed::Unit(unit) => summary.unit(&unit, args.units),
						Framed::StreamInfo { info, invalidated } => {
							println!("stream info: {info:?} (invalidated: {invalidated})")
						}
						Framed::Control(payload) => println!("control: {}", preview(&payload)),
						Framed::Invalid(err) => println!("invalid record: {err}"),
					}
				}
			}
		}
	}

	if let Parser::Demux(demuxer) = &mut parser {
		for unit in demuxer.flush() {
			summary.unit(&unit, args.units);
		}
		demuxer.take_metadata().iter().for_each(metadata);

		let sei = demuxer.detected_sei_types();
		if !sei.is_empty() {
			println!("sei types: {sei:?}");
		}
		let private = demuxer.detected_private_ids();
		if !private.is_empty() {
			println!("private data streams: {private:?}");
		}
	}

	summary.print();
	Ok(())
}
