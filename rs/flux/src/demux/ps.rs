use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
	AccessUnit,
	codec::{Family, START_CODE},
	demux::{
		DemuxConfig, Metadata,
		adts::is_adts,
		pes::{AudioKind, Role, audio_units, contains_keyframe, parse_pes},
	},
};

const PACK_HEADER: u8 = 0xba;
const SYSTEM_HEADER: u8 = 0xbb;
const STREAM_MAP: u8 = 0xbc;
const END_CODE: u8 = 0xb9;
const PRIVATE_STREAM_1: u8 = 0xbd;
const METADATA_STREAM: u8 = 0xfc;

// A video frame spread over one or more PES packets.
struct Frame {
	timestamp: i64,
	payload: BytesMut,
}

/// Demuxes an MPEG program stream, including GB28181 style streams.
///
/// Stream ids imply the role (0xE0-0xEF video, 0xC0-0xDF audio), refined by the program stream map when present.
pub struct Ps {
	// Bytes that haven't formed a complete pack header or PES packet yet.
	buffer: BytesMut,

	// Stream types learned from the program stream map, keyed by stream id.
	stream_types: HashMap<u8, u8>,

	// Set from the stream map, otherwise detected from the first NAL.
	family: Option<Family>,

	video: Option<Frame>,
	last_pts: i64,

	pub(crate) metadata: Metadata,
}

impl Ps {
	pub fn new(config: DemuxConfig) -> Self {
		Self {
			buffer: BytesMut::new(),
			stream_types: HashMap::new(),
			family: None,
			video: None,
			last_pts: 0,
			metadata: Metadata::new(config.metadata),
		}
	}

	pub fn video_family(&self) -> Option<Family> {
		self.family
	}

	pub fn demux(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
		self.buffer.extend_from_slice(chunk);

		let mut units = Vec::new();

		loop {
			// Find the next 00 00 01 prefix.
			match self.buffer.windows(3).position(|w| w == [0, 0, 1]) {
				Some(0) => {}
				Some(skip) => {
					tracing::trace!(skip, "skipping bytes before start code");
					self.buffer.advance(skip);
				}
				None => {
					// Keep a possible partial prefix.
					let keep = self.buffer.len().min(2);
					self.buffer.advance(self.buffer.len() - keep);
					break;
				}
			}

			let Some(size) = self.unit_size() else {
				break;
			};

			let unit = self.buffer.split_to(size).freeze();
			self.unit(unit, &mut units);
		}

		// The open frame may continue in a PES without a PTS, so only a new PTS, an end code or flush closes it.
		units
	}

	pub fn flush(&mut self) -> Vec<AccessUnit> {
		self.buffer.clear();
		self.emit_video().into_iter().collect()
	}

	// The size of the start-code-prefixed unit at the front of the buffer, if it is all here.
	fn unit_size(&self) -> Option<usize> {
		let id = *self.buffer.get(3)?;

		let size = match id {
			PACK_HEADER => {
				let marker = *self.buffer.get(4)?;
				if marker & 0xc0 == 0x40 {
					// MPEG-2: 14 bytes plus stuffing.
					14 + (*self.buffer.get(13)? & 0x07) as usize
				} else {
					// MPEG-1
					12
				}
			}
			END_CODE => 4,
			0xbb..=0xff => {
				let length = u16::from_be_bytes([*self.buffer.get(4)?, *self.buffer.get(5)?]) as usize;
				6 + length
			}
			_ => {
				// Not a system start code: most likely a start code inside video data we lost sync with.
				tracing::trace!(id, "unexpected start code");
				3
			}
		};

		(self.buffer.len() >= size).then_some(size)
	}

	fn unit(&mut self, unit: Bytes, units: &mut Vec<AccessUnit>) {
		match unit[3] {
			PACK_HEADER | SYSTEM_HEADER => {}
			END_CODE => units.extend(self.emit_video()),
			STREAM_MAP => self.stream_map(&unit),
			0xe0..=0xef => self.video_pes(unit, units),
			0xc0..=0xdf => self.audio_pes(unit, units),
			id @ (PRIVATE_STREAM_1 | METADATA_STREAM) => self.private_pes(id, unit),
			_ => {}
		}
	}

	// program_stream_map, ISO/IEC 13818-1 2.5.4
	fn stream_map(&mut self, unit: &[u8]) {
		let parse = || -> Option<Vec<(u8, u8)>> {
			let info_length = u16::from_be_bytes([*unit.get(8)?, *unit.get(9)?]) as usize;
			let map = unit.get(10 + info_length..)?;
			let map_length = u16::from_be_bytes([*map.first()?, *map.get(1)?]) as usize;
			let mut entries = map.get(2..2 + map_length)?;

			let mut streams = Vec::new();
			while entries.len() >= 4 {
				let stream_type = entries[0];
				let id = entries[1];
				let info_length = u16::from_be_bytes([entries[2], entries[3]]) as usize;
				streams.push((id, stream_type));
				entries = entries.get(4 + info_length..).unwrap_or_default();
			}
			Some(streams)
		};

		let Some(streams) = parse() else {
			tracing::trace!("invalid program stream map");
			return;
		};

		for (id, stream_type) in streams {
			if let Some(Role::Video(family)) = Role::from_stream_type(stream_type) {
				self.family = Some(family);
			}

			if self.stream_types.insert(id, stream_type) != Some(stream_type) {
				tracing::debug!(id, stream_type, "stream map entry");
			}
		}
	}

	fn video_pes(&mut self, unit: Bytes, units: &mut Vec<AccessUnit>) {
		let Some(pes) = parse_pes(unit) else {
			return;
		};

		if self.family.is_none() {
			self.family = crate::codec::split_annexb(&pes.payload).find_map(Family::detect);
		}

		// A new timestamp starts a new frame; continuation packets carry none.
		if let Some(pts) = pes.pts {
			if self.video.as_ref().is_some_and(|frame| frame.timestamp != pts) {
				units.extend(self.emit_video());
			}
			self.last_pts = pts;
		}

		let timestamp = self.last_pts;
		let frame = self.video.get_or_insert_with(|| Frame {
			timestamp,
			payload: BytesMut::new(),
		});
		frame.payload.put_slice(&pes.payload);
	}

	fn emit_video(&mut self) -> Option<AccessUnit> {
		let frame = self.video.take()?;

		// Normalise 3 byte start codes so every payload looks the same.
		let payload = to_long_start_codes(frame.payload.freeze());
		if payload.is_empty() {
			tracing::trace!(timestamp = frame.timestamp, "dropping empty frame");
			return None;
		}

		let keyframe = contains_keyframe(self.family, &payload);

		if let Some(family) = self.family {
			self.metadata.sei_in(family, &payload, frame.timestamp);
		}

		Some(AccessUnit::video(frame.timestamp, keyframe, payload))
	}

	fn audio_pes(&mut self, unit: Bytes, units: &mut Vec<AccessUnit>) {
		let id = unit[3];
		let Some(pes) = parse_pes(unit) else {
			return;
		};

		let timestamp = pes.pts.unwrap_or(self.last_pts);

		let kind = match self.stream_types.get(&id).copied().and_then(Role::from_stream_type) {
			Some(Role::Audio(kind)) => kind,
			_ if is_adts(&pes.payload) => AudioKind::Adts,
			_ => AudioKind::Mpeg,
		};

		units.extend(audio_units(kind, timestamp, pes.payload));
	}

	fn private_pes(&mut self, id: u8, unit: Bytes) {
		let Some(pes) = parse_pes(unit) else {
			return;
		};

		let stream_type = self.stream_types.get(&id).copied().unwrap_or(match id {
			METADATA_STREAM => 0x15,
			_ => 0x06,
		});

		let timestamp = pes.pts.unwrap_or(self.last_pts);
		self.metadata.private(id as u16, stream_type, timestamp, pes.payload);
	}
}

// Rewrite every start code as the 4 byte form.
fn to_long_start_codes(payload: Bytes) -> Bytes {
	let mut out = BytesMut::with_capacity(payload.len() + 16);
	for nal in crate::codec::split_annexb(&payload) {
		// Drop any trailing_zero_8bits.
		let end = nal.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
		if end == 0 {
			continue;
		}
		out.put_slice(&START_CODE);
		out.put_slice(&nal[..end]);
	}
	out.freeze()
}
