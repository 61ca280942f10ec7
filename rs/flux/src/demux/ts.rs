use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use crate::{
	AccessUnit,
	codec::Family,
	demux::{
		DemuxConfig, Metadata,
		pes::{Role, audio_units, contains_keyframe, declared_length, parse_pes},
	},
};

const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0;

// A PES packet being reassembled from TS packets.
#[derive(Debug)]
struct Assembler {
	role: Role,
	buffer: BytesMut,
	// The random access indicator was set on the first packet.
	random_access: bool,
	// The last PTS seen on this PID, used when a PES has none.
	last_pts: i64,
}

impl Assembler {
	fn new(role: Role) -> Self {
		Self {
			role,
			buffer: BytesMut::new(),
			random_access: false,
			last_pts: 0,
		}
	}

	// Whether the declared PES length has been reached.
	fn complete(&self) -> bool {
		match declared_length(&self.buffer) {
			Some(0) | None => false,
			Some(length) => self.buffer.len() >= 6 + length,
		}
	}
}

/// Demuxes an MPEG transport stream.
///
/// The first PAT and PMT win: later program table updates are ignored.
/// At most one video and one audio elementary stream are followed.
pub struct Ts {
	// Bytes that haven't formed a complete 188 byte packet yet.
	buffer: BytesMut,

	pmt_pid: Option<u16>,
	pmt_seen: bool,

	video_pid: Option<u16>,
	audio_pid: Option<u16>,
	streams: HashMap<u16, Assembler>,

	// The most recent presentation time of any stream, used to stamp detection events.
	clock: i64,

	pub(crate) metadata: Metadata,
}

impl Ts {
	pub fn new(config: DemuxConfig) -> Self {
		Self {
			buffer: BytesMut::new(),
			pmt_pid: None,
			pmt_seen: false,
			video_pid: None,
			audio_pid: None,
			streams: HashMap::new(),
			clock: 0,
			metadata: Metadata::new(config.metadata),
		}
	}

	/// The video family from the PMT, once known.
	pub fn video_family(&self) -> Option<Family> {
		let pid = self.video_pid?;
		match self.streams.get(&pid)?.role {
			Role::Video(family) => Some(family),
			_ => None,
		}
	}

	pub fn demux(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
		self.buffer.extend_from_slice(chunk);

		let mut units = Vec::new();

		loop {
			if self.buffer.first().is_some_and(|b| *b != SYNC_BYTE) {
				match self.buffer.iter().position(|b| *b == SYNC_BYTE) {
					Some(skip) => {
						tracing::trace!(skip, "resyncing transport stream");
						self.buffer.advance(skip);
					}
					None => {
						tracing::trace!(skip = self.buffer.len(), "no sync byte");
						self.buffer.clear();
					}
				}
			}

			if self.buffer.len() < PACKET_SIZE {
				break;
			}

			let packet = self.buffer.split_to(PACKET_SIZE).freeze();
			self.packet(packet, &mut units);
		}

		// An unbounded PES stays open across chunks until the next payload unit start or flush.
		units
	}

	/// Emit every open PES packet, complete or not.
	pub fn flush(&mut self) -> Vec<AccessUnit> {
		self.buffer.clear();

		let mut units = Vec::new();
		let mut pids: Vec<u16> = self.streams.keys().copied().collect();
		pids.sort_unstable();
		for pid in pids {
			self.emit(pid, &mut units);
		}
		units
	}

	fn packet(&mut self, packet: Bytes, units: &mut Vec<AccessUnit>) {
		let payload_start = packet[1] & 0x40 != 0;
		let pid = u16::from_be_bytes([packet[1] & 0x1f, packet[2]]);
		let adaptation = (packet[3] >> 4) & 0x03;

		let mut offset = 4;
		let mut random_access = false;

		if adaptation & 0x02 != 0 {
			let length = packet[4] as usize;
			if length > 0 {
				random_access = packet[5] & 0x40 != 0;
			}
			offset = 5 + length;
		}

		if adaptation & 0x01 == 0 || offset >= PACKET_SIZE {
			return;
		}

		let payload = packet.slice(offset..);

		if pid == PAT_PID {
			if payload_start && self.pmt_pid.is_none() {
				self.pat(&payload);
			}
			return;
		}

		if Some(pid) == self.pmt_pid {
			if payload_start && !self.pmt_seen {
				self.pmt(&payload);
			}
			return;
		}

		let Some(stream) = self.streams.get_mut(&pid) else {
			return;
		};

		if payload_start {
			if !stream.buffer.is_empty() {
				self.emit(pid, units);
			}

			let Some(stream) = self.streams.get_mut(&pid) else {
				return;
			};
			stream.random_access = random_access;
			stream.buffer.extend_from_slice(&payload);
		} else if stream.buffer.is_empty() {
			// We joined mid-PES; wait for the next start.
			return;
		} else {
			stream.buffer.extend_from_slice(&payload);
		}

		if self.streams.get(&pid).is_some_and(Assembler::complete) {
			self.emit(pid, units);
		}
	}

	// Skip the pointer field and return the section, bounded by its declared length (CRC excluded).
	fn section(payload: &[u8], table_id: u8) -> Option<&[u8]> {
		let pointer = *payload.first()? as usize;
		let section = payload.get(1 + pointer..)?;

		if *section.first()? != table_id {
			return None;
		}

		let length = (((*section.get(1)? & 0x0f) as usize) << 8) | *section.get(2)? as usize;
		let end = (3 + length).checked_sub(4)?;
		section.get(..end.min(section.len()))
	}

	fn pat(&mut self, payload: &[u8]) {
		let Some(section) = Self::section(payload, 0x00) else {
			tracing::trace!("invalid pat");
			return;
		};

		// Programs start after the 8 byte section header.
		for program in section.get(8..).unwrap_or_default().chunks_exact(4) {
			let number = u16::from_be_bytes([program[0], program[1]]);
			let pid = u16::from_be_bytes([program[2] & 0x1f, program[3]]);

			// Program zero is the network information table.
			if number != 0 {
				tracing::debug!(program = number, pid, "found pmt");
				self.pmt_pid = Some(pid);
				return;
			}
		}
	}

	fn pmt(&mut self, payload: &[u8]) {
		let Some(section) = Self::section(payload, 0x02) else {
			tracing::trace!("invalid pmt");
			return;
		};

		if section.len() < 12 {
			return;
		}

		self.pmt_seen = true;

		let info_length = (((section[10] & 0x0f) as usize) << 8) | section[11] as usize;
		let mut entries = section.get(12 + info_length..).unwrap_or_default();

		while entries.len() >= 5 {
			let stream_type = entries[0];
			let pid = u16::from_be_bytes([entries[1] & 0x1f, entries[2]]);
			let es_info_length = (((entries[3] & 0x0f) as usize) << 8) | entries[4] as usize;
			entries = entries.get(5 + es_info_length..).unwrap_or_default();

			let Some(role) = Role::from_stream_type(stream_type) else {
				tracing::debug!(pid, stream_type, "ignoring unsupported stream");
				continue;
			};

			match role {
				Role::Video(_) if self.video_pid.is_none() => self.video_pid = Some(pid),
				Role::Audio(_) if self.audio_pid.is_none() => self.audio_pid = Some(pid),
				Role::Private(_) => self.metadata.register_private(pid, stream_type, self.clock),
				_ => {
					tracing::debug!(pid, stream_type, "ignoring additional stream");
					continue;
				}
			}

			tracing::debug!(pid, stream_type, ?role, "registered stream");
			self.streams.insert(pid, Assembler::new(role));
		}
	}

	fn emit(&mut self, pid: u16, units: &mut Vec<AccessUnit>) {
		let Some(stream) = self.streams.get_mut(&pid) else {
			return;
		};

		if stream.buffer.is_empty() {
			return;
		}

		let data = stream.buffer.split().freeze();
		let random_access = std::mem::take(&mut stream.random_access);

		let Some(pes) = parse_pes(data) else {
			tracing::trace!(pid, "discarding invalid pes");
			return;
		};

		let timestamp = pes.pts.unwrap_or(stream.last_pts);
		stream.last_pts = timestamp;
		self.clock = timestamp;

		match stream.role {
			Role::Video(family) => {
				if pes.payload.is_empty() {
					return;
				}

				let keyframe = random_access || contains_keyframe(Some(family), &pes.payload);
				self.metadata.sei_in(family, &pes.payload, timestamp);
				units.push(AccessUnit::video(timestamp, keyframe, pes.payload));
			}
			Role::Audio(kind) => units.extend(audio_units(kind, timestamp, pes.payload)),
			Role::Private(stream_type) => self.metadata.private(pid, stream_type, timestamp, pes.payload),
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::demux::{
		MetadataEvent, MetadataPolicy,
		adts::tests::adts_frame,
		pes::tests::pes,
	};

	/// Build one TS packet, padding with adaptation field stuffing.
	pub fn packet(pid: u16, start: bool, random_access: bool, payload: &[u8]) -> Vec<u8> {
		let stuffing = 184 - payload.len();
		assert!(!random_access || stuffing >= 2);

		let mut packet = vec![SYNC_BYTE, ((start as u8) << 6) | (pid >> 8) as u8, pid as u8];

		if stuffing > 0 {
			let length = stuffing - 1;
			packet.push(0x30);
			packet.push(length as u8);
			if length > 0 {
				packet.push(if random_access { 0x40 } else { 0x00 });
				packet.extend(std::iter::repeat_n(0xff, length - 1));
			}
		} else {
			packet.push(0x10);
		}

		packet.extend_from_slice(payload);
		assert_eq!(packet.len(), PACKET_SIZE);
		packet
	}

	/// Split a PES packet across as many TS packets as it takes.
	pub fn packets(pid: u16, random_access: bool, pes: &[u8]) -> Vec<u8> {
		pes.chunks(170)
			.enumerate()
			.flat_map(|(i, chunk)| packet(pid, i == 0, random_access && i == 0, chunk))
			.collect()
	}

	pub fn pat(pmt_pid: u16) -> Vec<u8> {
		let mut section = vec![0x00, 0xb0, 13, 0, 1, 0xc1, 0, 0];
		section.extend_from_slice(&[0, 1, 0xe0 | (pmt_pid >> 8) as u8, pmt_pid as u8]);
		section.extend_from_slice(&[0, 0, 0, 0]); // crc, unchecked
		packet(PAT_PID, true, false, &[&[0][..], &section[..]].concat())
	}

	pub fn pmt(pmt_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
		let length = 9 + 5 * streams.len() + 4;
		let mut section = vec![0x02, 0xb0 | (length >> 8) as u8, length as u8, 0, 1, 0xc1, 0, 0, 0xe1, 0x00, 0xf0, 0];
		for (stream_type, pid) in streams {
			section.extend_from_slice(&[*stream_type, 0xe0 | (pid >> 8) as u8, *pid as u8, 0xf0, 0]);
		}
		section.extend_from_slice(&[0, 0, 0, 0]);
		packet(pmt_pid, true, false, &[&[0][..], &section[..]].concat())
	}

	fn video_pes(pts: i64, nals: &[&[u8]], bounded: bool) -> Vec<u8> {
		let mut es = Vec::new();
		for nal in nals {
			es.extend_from_slice(&[0, 0, 0, 1]);
			es.extend_from_slice(nal);
		}
		pes(0xe0, pts, &es, bounded)
	}

	// Demux every chunk, then flush at the end of the stream.
	fn run(chunks: &[&[u8]]) -> (Vec<AccessUnit>, Vec<MetadataEvent>) {
		let mut ts = Ts::new(DemuxConfig::default());
		let mut units: Vec<AccessUnit> = chunks.iter().flat_map(|chunk| ts.demux(chunk)).collect();
		units.extend(ts.flush());
		(units, ts.metadata.take())
	}

	#[test]
	fn unaligned_chunks() {
		let idr = [0x65; 400];
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100)]),
			packets(0x100, true, &video_pes(1000, &[&[0x67, 0x42, 0xe0, 0x1e], &idr], false)),
		]
		.concat();

		let chunks: Vec<&[u8]> = data.chunks(100).collect();
		let (units, _) = run(&chunks);

		assert_eq!(units.len(), 1);
		assert!(units[0].keyframe);
		assert_eq!(units[0].timestamp, 1000);
		assert_eq!(&units[0].payload[..8], &[0, 0, 0, 1, 0x67, 0x42, 0xe0, 0x1e]);
		assert_eq!(units[0].payload.len(), 8 + 4 + 400);
	}

	#[test]
	fn any_split_point() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100), (0x0f, 0x101)]),
			packets(0x100, true, &video_pes(0, &[&[0x65, 0x88, 0x84]], true)),
			packets(0x101, false, &pes(0xc0, 0, &[adts_frame(b"aac1"), adts_frame(b"aac2")].concat(), true)),
			packets(0x100, false, &video_pes(40, &[&[0x41; 300]], true)),
		]
		.concat();

		let (expected, _) = run(&[&data]);
		assert_eq!(expected.len(), 4);

		for split in 0..=data.len() {
			let (a, b) = data.split_at(split);
			assert_eq!(run(&[a, b]).0, expected, "split at {split}");
		}
	}

	#[test]
	fn unbounded_pes_waits_for_next_start() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100)]),
			packets(0x100, false, &video_pes(0, &[&[0x65, 0x88]], false)),
			packets(0x100, false, &video_pes(40, &[&[0x41, 0x9a]], false)),
			packets(0x100, false, &video_pes(80, &[&[0x41, 0x9a]], false)),
		]
		.concat();

		// Cut in the middle of the last packet.
		let cut = data.len() - 50;
		let mut ts = Ts::new(DemuxConfig::default());

		// The second payload unit start ends the first PES.
		let units = ts.demux(&data[..cut]);
		assert_eq!(units.len(), 1);
		assert_eq!(units[0].timestamp, 0);
		assert!(units[0].keyframe);

		// The third ends the second, even though this chunk ends on a packet boundary.
		let units = ts.demux(&data[cut..]);
		let timestamps: Vec<i64> = units.iter().map(|u| u.timestamp).collect();
		assert_eq!(timestamps, vec![40]);
		assert!(!units[0].keyframe);

		// Only the end of the stream ends the last.
		let units = ts.flush();
		assert_eq!(units.len(), 1);
		assert_eq!(units[0].timestamp, 80);
	}

	#[test]
	fn unbounded_pes_across_packet_aligned_chunks() {
		let sps: &[u8] = &[0x67, 0x42, 0xe0, 0x1e];
		let idr = [&[0x65][..], &[0x88; 600][..]].concat();
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100)]),
			packets(0x100, true, &video_pes(0, &[sps, &idr[..]], false)),
			packets(0x100, false, &video_pes(40, &[&[0x41, 0x9a]], false)),
		]
		.concat();

		let (expected, _) = run(&[&data]);
		let sizes: Vec<(i64, usize)> = expected.iter().map(|u| (u.timestamp, u.payload.len())).collect();
		assert_eq!(sizes, vec![(0, 8 + 4 + 601), (40, 6)]);

		// Every cut between two packets, including inside the multi-packet PES.
		for split in (0..=data.len()).step_by(PACKET_SIZE) {
			let (a, b) = data.split_at(split);
			assert_eq!(run(&[a, b]).0, expected, "split at packet {}", split / PACKET_SIZE);
		}
	}

	#[test]
	fn any_split_point_unbounded() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100), (0x0f, 0x101)]),
			packets(0x100, true, &video_pes(0, &[&[0x65; 400]], false)),
			packets(0x101, false, &pes(0xc0, 0, &adts_frame(b"aac1"), true)),
			packets(0x100, false, &video_pes(40, &[&[0x41; 300]], false)),
			packets(0x100, false, &video_pes(80, &[&[0x41; 20]], false)),
		]
		.concat();

		let (expected, _) = run(&[&data]);
		let timestamps: Vec<i64> = expected.iter().map(|u| u.timestamp).collect();
		assert_eq!(timestamps, vec![0, 0, 40, 80]);

		for split in 0..=data.len() {
			let (a, b) = data.split_at(split);
			assert_eq!(run(&[a, b]).0, expected, "split at {split}");
		}
	}

	#[test]
	fn resync() {
		let data = [
			vec![0x00, 0x12, 0x34],
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100)]),
			packets(0x100, false, &video_pes(0, &[&[0x65, 0x88]], true)),
		]
		.concat();

		assert_eq!(run(&[&data]).0.len(), 1);
	}

	#[test]
	fn first_pmt_wins() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100)]),
			pmt(0x1000, &[(0x24, 0x200)]),
			packets(0x200, false, &video_pes(0, &[&[0x26, 0x01, 0xaf]], true)),
			packets(0x100, false, &video_pes(0, &[&[0x65, 0x88]], true)),
		]
		.concat();

		let mut ts = Ts::new(DemuxConfig::default());
		let units = ts.demux(&data);
		assert_eq!(units.len(), 1);
		assert_eq!(ts.video_family(), Some(Family::H264));
	}

	#[test]
	fn audio_streams() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x90, 0x101)]),
			packets(0x101, false, &pes(0xc0, 500, &[0xd5; 160], true)),
		]
		.concat();

		let (units, _) = run(&[&data]);
		assert_eq!(units.len(), 1);
		assert_eq!(units[0].codec.as_deref(), Some("alaw"));
		assert_eq!(units[0].timestamp, 500);
	}

	#[test]
	fn klv_private_data() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x1b, 0x100), (0x15, 0x102)]),
			packets(0x102, false, &pes(0xfc, 0, b"\x06\x0e\x2b\x34klv", true)),
			packets(0x102, false, &pes(0xfc, 40, b"\x06\x0e\x2b\x34klv", true)),
		]
		.concat();

		let (units, events) = run(&[&data]);
		assert!(units.is_empty());
		assert_eq!(events.len(), 3);
		assert!(matches!(
			events[0],
			MetadataEvent::PrivateDataDetected {
				id: 0x102,
				stream_type: 0x15,
				..
			}
		));
		assert!(matches!(events[2], MetadataEvent::PrivateData { timestamp: 40, .. }));
	}

	#[test]
	fn private_data_detect_only() {
		let data = [
			pat(0x1000),
			pmt(0x1000, &[(0x06, 0x102)]),
			packets(0x102, false, &pes(0xbd, 0, b"data", true)),
		]
		.concat();

		let config = DemuxConfig {
			metadata: MetadataPolicy {
				detect_only: true,
				extract: false,
			},
			..Default::default()
		};
		let mut ts = Ts::new(config);
		ts.demux(&data);

		let events = ts.metadata.take();
		assert_eq!(events.len(), 1);
		assert!(matches!(events[0], MetadataEvent::PrivateDataDetected { id: 0x102, .. }));
	}
}
