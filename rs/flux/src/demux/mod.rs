//! Container demultiplexers.
//!
//! Every demuxer is fed successive chunks of a live stream and tolerates any split point.
//! Whatever doesn't form a complete structural unit (tag, packet, NAL) is kept as leftover and
//! reparsed when the next chunk arrives.
//!
//! Supplemental enhancement messages and private data streams are surfaced separately, see [MetadataEvent].
mod adts;
mod annexb;
mod flv;
pub(crate) mod pes;
mod ps;
mod sei;
pub(crate) mod ts;

pub use annexb::*;
pub use flv::*;
pub use ps::*;
pub use sei::*;
pub use ts::*;

use std::{collections::HashSet, fmt, path::Path, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{AccessUnit, codec::Family};

/// The container format of the incoming byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DemuxFormat {
	#[default]
	Flv,
	Ts,
	Ps,
	AnnexB,
}

impl DemuxFormat {
	/// Guess the format from a file name or URL path.
	pub fn guess(path: &str) -> Option<Self> {
		let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
		Some(match ext.as_str() {
			"flv" => Self::Flv,
			"ts" | "m2ts" | "mts" => Self::Ts,
			"ps" | "mpg" | "mpeg" | "vob" => Self::Ps,
			"h264" | "264" | "h265" | "265" | "hevc" | "avc" => Self::AnnexB,
			_ => return None,
		})
	}
}

impl fmt::Display for DemuxFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Flv => write!(f, "flv"),
			Self::Ts => write!(f, "ts"),
			Self::Ps => write!(f, "ps"),
			Self::AnnexB => write!(f, "annex-b"),
		}
	}
}

impl FromStr for DemuxFormat {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		<Self as clap::ValueEnum>::from_str(s, true)
	}
}

/// Controls which metadata events are delivered.
///
/// Detection notifications always fire. Payload events are suppressed only in detect-only mode
/// while extraction is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataPolicy {
	pub detect_only: bool,
	pub extract: bool,
}

impl MetadataPolicy {
	pub fn deliver(&self) -> bool {
		!self.detect_only || self.extract
	}
}

/// Out-of-band metadata found alongside the media.
#[derive(Clone, PartialEq, derive_more::Debug)]
pub enum MetadataEvent {
	/// The first SEI message of this payload type in the stream.
	SeiDetected { payload_type: u32, timestamp: i64 },

	/// A complete SEI message.
	Sei {
		payload_type: u32,
		timestamp: i64,
		#[debug("{} bytes", payload.len())]
		payload: Bytes,
	},

	/// The first sight of a private data stream.
	PrivateDataDetected { id: u16, stream_type: u8, timestamp: i64 },

	/// One PES payload from a private data stream.
	PrivateData {
		id: u16,
		stream_type: u8,
		timestamp: i64,
		#[debug("{} bytes", payload.len())]
		payload: Bytes,
	},
}

impl MetadataEvent {
	pub fn timestamp(&self) -> i64 {
		match self {
			Self::SeiDetected { timestamp, .. }
			| Self::Sei { timestamp, .. }
			| Self::PrivateDataDetected { timestamp, .. }
			| Self::PrivateData { timestamp, .. } => *timestamp,
		}
	}
}

/// Per-instance metadata state: the one-shot detection sets and the staged events.
#[derive(Debug, Default)]
pub(crate) struct Metadata {
	pub policy: MetadataPolicy,
	sei_types: HashSet<u32>,
	private_ids: HashSet<u16>,
	events: Vec<MetadataEvent>,
}

impl Metadata {
	pub fn new(policy: MetadataPolicy) -> Self {
		Self {
			policy,
			..Default::default()
		}
	}

	/// Parse every message out of an SEI NAL unit.
	pub fn sei(&mut self, family: Family, nal: &[u8], timestamp: i64) {
		for message in sei_messages(family, nal) {
			if self.sei_types.insert(message.payload_type) {
				tracing::debug!(payload_type = message.payload_type, "detected sei");
				self.events.push(MetadataEvent::SeiDetected {
					payload_type: message.payload_type,
					timestamp,
				});
			}

			if self.policy.deliver() {
				self.events.push(MetadataEvent::Sei {
					payload_type: message.payload_type,
					timestamp,
					payload: message.payload,
				});
			}
		}
	}

	/// Scan an Annex B payload for SEI NAL units.
	pub fn sei_in(&mut self, family: Family, payload: &[u8], timestamp: i64) {
		for nal in crate::codec::split_annexb(payload) {
			if family.is_sei(nal) {
				self.sei(family, nal, timestamp);
			}
		}
	}

	/// Register a private data stream, firing the detection event the first time.
	pub fn register_private(&mut self, id: u16, stream_type: u8, timestamp: i64) {
		if self.private_ids.insert(id) {
			tracing::debug!(id, stream_type, "detected private data stream");
			self.events.push(MetadataEvent::PrivateDataDetected {
				id,
				stream_type,
				timestamp,
			});
		}
	}

	pub fn private(&mut self, id: u16, stream_type: u8, timestamp: i64, payload: Bytes) {
		self.register_private(id, stream_type, timestamp);

		if self.policy.deliver() && !payload.is_empty() {
			self.events.push(MetadataEvent::PrivateData {
				id,
				stream_type,
				timestamp,
				payload,
			});
		}
	}

	pub fn take(&mut self) -> Vec<MetadataEvent> {
		std::mem::take(&mut self.events)
	}

	pub fn sei_types(&self) -> Vec<u32> {
		let mut types: Vec<_> = self.sei_types.iter().copied().collect();
		types.sort_unstable();
		types
	}

	pub fn private_ids(&self) -> Vec<u16> {
		let mut ids: Vec<_> = self.private_ids.iter().copied().collect();
		ids.sort_unstable();
		ids
	}
}

/// Settings shared by every demuxer.
#[derive(Debug, Clone, Copy)]
pub struct DemuxConfig {
	pub metadata: MetadataPolicy,

	/// The synthesised frame duration for raw Annex B streams.
	pub annexb_frame_interval_ms: i64,
}

impl Default for DemuxConfig {
	fn default() -> Self {
		Self {
			metadata: MetadataPolicy::default(),
			annexb_frame_interval_ms: 40,
		}
	}
}

/// A demuxer for one of the supported containers, chosen at construction.
pub enum Demuxer {
	Flv(Flv),
	Ts(Ts),
	Ps(Ps),
	AnnexB(AnnexB),
}

impl Demuxer {
	pub fn new(format: DemuxFormat, config: DemuxConfig) -> Self {
		match format {
			DemuxFormat::Flv => Self::Flv(Flv::new(config)),
			DemuxFormat::Ts => Self::Ts(Ts::new(config)),
			DemuxFormat::Ps => Self::Ps(Ps::new(config)),
			DemuxFormat::AnnexB => Self::AnnexB(AnnexB::new(config)),
		}
	}

	pub fn format(&self) -> DemuxFormat {
		match self {
			Self::Flv(_) => DemuxFormat::Flv,
			Self::Ts(_) => DemuxFormat::Ts,
			Self::Ps(_) => DemuxFormat::Ps,
			Self::AnnexB(_) => DemuxFormat::AnnexB,
		}
	}

	/// Parse the next chunk, returning every access unit completed by it.
	pub fn demux(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
		match self {
			Self::Flv(d) => d.demux(chunk),
			Self::Ts(d) => d.demux(chunk),
			Self::Ps(d) => d.demux(chunk),
			Self::AnnexB(d) => d.demux(chunk),
		}
	}

	/// Emit anything still pending at the end of the stream.
	pub fn flush(&mut self) -> Vec<AccessUnit> {
		match self {
			Self::Flv(d) => d.flush(),
			Self::Ts(d) => d.flush(),
			Self::Ps(d) => d.flush(),
			Self::AnnexB(d) => d.flush(),
		}
	}

	/// Drain the metadata events staged since the last call.
	pub fn take_metadata(&mut self) -> Vec<MetadataEvent> {
		self.metadata().take()
	}

	pub fn set_extraction(&mut self, extract: bool) {
		self.metadata().policy.extract = extract;
	}

	pub fn detected_sei_types(&mut self) -> Vec<u32> {
		self.metadata().sei_types()
	}

	pub fn detected_private_ids(&mut self) -> Vec<u16> {
		self.metadata().private_ids()
	}

	fn metadata(&mut self) -> &mut Metadata {
		match self {
			Self::Flv(d) => &mut d.metadata,
			Self::Ts(d) => &mut d.metadata,
			Self::Ps(d) => &mut d.metadata,
			Self::AnnexB(d) => &mut d.metadata,
		}
	}
}
