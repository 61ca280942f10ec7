use bytes::Bytes;

use crate::{
	AccessUnit,
	codec::{AudioCodec, Family},
	demux::adts::{is_adts, split_adts},
};

/// What an elementary stream carries, learned from a program table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
	Video(Family),
	Audio(AudioKind),
	Private(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AudioKind {
	/// AAC in ADTS framing.
	Adts,
	/// MPEG-1/2 audio, usually layer 3.
	Mpeg,
	Alaw,
	Ulaw,
}

impl Role {
	pub fn from_stream_type(stream_type: u8) -> Option<Self> {
		Some(match stream_type {
			0x1b => Self::Video(Family::H264),
			0x24 => Self::Video(Family::H265),
			0x0f => Self::Audio(AudioKind::Adts),
			0x03 | 0x04 => Self::Audio(AudioKind::Mpeg),
			0x90 => Self::Audio(AudioKind::Alaw),
			0x91 => Self::Audio(AudioKind::Ulaw),
			0x06 | 0x15 => Self::Private(stream_type),
			_ => return None,
		})
	}
}

/// A parsed PES packet.
#[derive(Debug, Clone)]
pub(crate) struct Pes {
	pub stream_id: u8,
	/// The presentation timestamp in milliseconds.
	pub pts: Option<i64>,
	pub payload: Bytes,
}

// Streams whose PES packets have no optional header.
fn has_header(stream_id: u8) -> bool {
	!matches!(stream_id, 0xbc | 0xbe | 0xbf | 0xf0 | 0xf1 | 0xf2 | 0xf8 | 0xff)
}

/// The declared PES_packet_length, zero when unbounded.
pub(crate) fn declared_length(data: &[u8]) -> Option<usize> {
	match data {
		[0, 0, 1, _, hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo]) as usize),
		_ => None,
	}
}

/// Parse a complete PES packet, MPEG-2 or MPEG-1 style.
///
/// Returns None when the start code prefix is missing or the header runs past the data.
pub(crate) fn parse_pes(data: Bytes) -> Option<Pes> {
	let length = declared_length(&data)?;
	let stream_id = data[3];

	let end = match length {
		0 => data.len(),
		length => (6 + length).min(data.len()),
	};

	let mut pts = None;
	let start = if !has_header(stream_id) {
		6
	} else if data.get(6)? & 0xc0 == 0x80 {
		let flags = data.get(7)? >> 6;
		let header_length = *data.get(8)? as usize;
		if flags & 0x02 != 0 && header_length >= 5 {
			pts = read_timestamp(data.get(9..14)?);
		}
		9 + header_length
	} else {
		// MPEG-1: stuffing, then an optional STD buffer size, then the timestamps.
		let mut i = 6;
		while data.get(i) == Some(&0xff) {
			i += 1;
		}
		if data.get(i)? & 0xc0 == 0x40 {
			i += 2;
		}
		match data.get(i)? & 0xf0 {
			0x20 => {
				pts = read_timestamp(data.get(i..i + 5)?);
				i += 5
			}
			0x30 => {
				pts = read_timestamp(data.get(i..i + 5)?);
				i += 10
			}
			_ => i += 1,
		}
		i
	};

	if start > end {
		tracing::trace!(stream_id, start, end, "pes header runs past the packet");
		return None;
	}

	Some(Pes {
		stream_id,
		pts,
		payload: data.slice(start..end),
	})
}

/// Decode a 33 bit, 90kHz timestamp into milliseconds.
pub(crate) fn read_timestamp(b: &[u8]) -> Option<i64> {
	let [b0, b1, b2, b3, b4] = *b else {
		return None;
	};

	let ticks = (((b0 as i64) >> 1) & 0x07) << 30
		| (b1 as i64) << 22
		| ((b2 as i64) >> 1) << 15
		| (b3 as i64) << 7
		| (b4 as i64) >> 1;

	Some(ticks / 90)
}

/// Turn an audio PES payload into access units.
pub(crate) fn audio_units(kind: AudioKind, timestamp: i64, payload: Bytes) -> Vec<AccessUnit> {
	match kind {
		// Some muxers label AAC as MPEG audio, so sniff for ADTS first.
		AudioKind::Adts | AudioKind::Mpeg if is_adts(&payload) => split_adts(&payload)
			.into_iter()
			.enumerate()
			.map(|(i, frame)| {
				let rate = frame.config.sample_rate();
				let mut unit = AccessUnit::audio(timestamp + (i as i64 * 1024 * 1000) / rate as i64, frame.payload)
					.with_codec(frame.config.codec().to_string());
				unit.sample_rate = Some(rate);
				unit.channels = Some(frame.config.channels);
				unit.description = Some(frame.config.encode());
				unit
			})
			.collect(),
		AudioKind::Adts => {
			tracing::trace!(size = payload.len(), "aac payload without adts sync");
			Vec::new()
		}
		AudioKind::Mpeg => vec![AccessUnit::audio(timestamp, payload).with_codec(AudioCodec::Mp3.to_string())],
		AudioKind::Alaw | AudioKind::Ulaw => {
			let codec = match kind {
				AudioKind::Alaw => AudioCodec::Alaw,
				_ => AudioCodec::Ulaw,
			};
			let mut unit = AccessUnit::audio(timestamp, payload).with_codec(codec.to_string());
			unit.sample_rate = Some(8000);
			unit.channels = Some(1);
			vec![unit]
		}
	}
}

/// Whether any NAL unit in the payload is a keyframe.
///
/// With no known family both are tried, which is permissive on purpose.
pub(crate) fn contains_keyframe(family: Option<Family>, payload: &[u8]) -> bool {
	crate::codec::split_annexb(payload).any(|nal| match family {
		Some(family) => family.is_keyframe(nal),
		None => Family::H264.is_keyframe(nal) || (nal.get(1) == Some(&0x01) && Family::H265.is_keyframe(nal)),
	})
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::demux::adts::tests::adts_frame;

	/// Encode a millisecond timestamp as a PTS field with the given prefix nibble.
	pub fn pts_bytes(ms: i64, prefix: u8) -> [u8; 5] {
		let ticks = ms * 90;
		[
			(prefix << 4) | ((((ticks >> 30) & 0x07) as u8) << 1) | 1,
			(ticks >> 22) as u8,
			((((ticks >> 15) & 0x7f) as u8) << 1) | 1,
			(ticks >> 7) as u8,
			(((ticks & 0x7f) as u8) << 1) | 1,
		]
	}

	/// Build an MPEG-2 PES packet with a PTS. A zero length marks it unbounded.
	pub fn pes(stream_id: u8, pts_ms: i64, payload: &[u8], bounded: bool) -> Vec<u8> {
		let length = if bounded { payload.len() + 8 } else { 0 };
		let mut data = vec![0, 0, 1, stream_id, (length >> 8) as u8, length as u8, 0x80, 0x80, 5];
		data.extend_from_slice(&pts_bytes(pts_ms, 0x2));
		data.extend_from_slice(payload);
		data
	}

	#[test]
	fn timestamps() {
		let bytes = pts_bytes(1000, 0x2);
		assert_eq!(read_timestamp(&bytes), Some(1000));

		// The 33rd bit.
		let bytes = pts_bytes(95_000_000, 0x2);
		assert_eq!(read_timestamp(&bytes), Some(95_000_000));
		assert_eq!(read_timestamp(&bytes[..4]), None);
	}

	#[test]
	fn mpeg2() {
		let data = pes(0xe0, 40, b"payload", true);
		let pes = parse_pes(data.into()).unwrap();
		assert_eq!(pes.stream_id, 0xe0);
		assert_eq!(pes.pts, Some(40));
		assert_eq!(pes.payload.as_ref(), b"payload");
	}

	#[test]
	fn mpeg1() {
		let mut data = vec![0, 0, 1, 0xc0, 0, 10, 0xff, 0xff];
		data.extend_from_slice(&pts_bytes(80, 0x2));
		data.extend_from_slice(b"mp3");
		let pes = parse_pes(data.into()).unwrap();
		assert_eq!(pes.pts, Some(80));
		assert_eq!(pes.payload.as_ref(), b"mp3");
	}

	#[test]
	fn header_past_end() {
		let data = vec![0, 0, 1, 0xe0, 0, 0, 0x80, 0x80, 20, 0, 0];
		assert!(parse_pes(data.into()).is_none());
		assert!(parse_pes(Bytes::from_static(&[0, 0, 2, 0xe0, 0, 0])).is_none());
	}

	#[test]
	fn adts_units() {
		let payload: Bytes = [adts_frame(b"a"), adts_frame(b"b"), adts_frame(b"c")].concat().into();
		let units = audio_units(AudioKind::Adts, 1000, payload);

		let timestamps: Vec<i64> = units.iter().map(|u| u.timestamp).collect();
		assert_eq!(timestamps, vec![1000, 1021, 1042]);
		assert_eq!(units[0].codec.as_deref(), Some("mp4a.40.2"));
		assert_eq!(units[0].sample_rate, Some(48000));
		assert_eq!(units[0].description.as_deref(), Some(&[0x11, 0x90][..]));
	}

	#[test]
	fn g711_units() {
		let units = audio_units(AudioKind::Alaw, 0, Bytes::from_static(&[0xd5; 160]));
		assert_eq!(units.len(), 1);
		assert_eq!(units[0].codec.as_deref(), Some("alaw"));
		assert_eq!(units[0].sample_rate, Some(8000));
	}

	#[test]
	fn keyframe_scan() {
		assert!(contains_keyframe(None, &[0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x65, 0x88]));
		assert!(contains_keyframe(None, &[0, 0, 1, 0x26, 0x01, 0xaf]));
		assert!(!contains_keyframe(None, &[0, 0, 1, 0x41, 0x9a]));
		assert!(contains_keyframe(Some(Family::H265), &[0, 0, 0, 1, 0x2a, 0x01]));
	}
}
