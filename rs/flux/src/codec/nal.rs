use bytes::{BufMut, Bytes, BytesMut};

// Prepend each NAL with a 4 byte start code.
// Yes, it's one byte longer than the 3 byte start code, but every payload we emit looks the same.
pub const START_CODE: Bytes = Bytes::from_static(&[0, 0, 0, 1]);

/// The two video coding standards carried as NAL units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
	H264,
	H265,
}

impl Family {
	/// The NAL unit type for the given header byte(s).
	pub fn nal_type(self, nal: &[u8]) -> Option<u8> {
		let header = *nal.first()?;
		Some(match self {
			Self::H264 => header & 0x1f,
			Self::H265 => (header >> 1) & 0x3f,
		})
	}

	/// The size of the NAL header in bytes.
	pub fn header_size(self) -> usize {
		match self {
			Self::H264 => 1,
			Self::H265 => 2,
		}
	}

	pub fn is_keyframe(self, nal: &[u8]) -> bool {
		match (self, self.nal_type(nal)) {
			(Self::H264, Some(t)) => t == H264Nal::IdrSlice as u8,
			// IRAP pictures: BLA, IDR and CRA.
			(Self::H265, Some(t)) => (16..=21).contains(&t),
			_ => false,
		}
	}

	pub fn is_sei(self, nal: &[u8]) -> bool {
		match (self, self.nal_type(nal)) {
			(Self::H264, Some(t)) => t == H264Nal::Sei as u8,
			(Self::H265, Some(t)) => t == H265Nal::PrefixSei as u8 || t == H265Nal::SuffixSei as u8,
			_ => false,
		}
	}

	pub fn is_slice(self, nal: &[u8]) -> bool {
		match (self, self.nal_type(nal)) {
			(Self::H264, Some(t)) => (1..=5).contains(&t),
			(Self::H265, Some(t)) => t <= 21,
			_ => false,
		}
	}

	pub fn is_aud(self, nal: &[u8]) -> bool {
		match (self, self.nal_type(nal)) {
			(Self::H264, Some(t)) => t == H264Nal::Aud as u8,
			(Self::H265, Some(t)) => t == H265Nal::Aud as u8,
			_ => false,
		}
	}

	/// Parameter sets and prefix SEI, which always begin a new access unit.
	pub fn is_prefix(self, nal: &[u8]) -> bool {
		match (self, self.nal_type(nal)) {
			(Self::H264, Some(t)) => matches!(t, 6..=8),
			(Self::H265, Some(t)) => matches!(t, 32..=34 | 39),
			_ => false,
		}
	}

	/// Whether this slice starts a new picture (first_mb_in_slice == 0 / first_slice_segment_in_pic_flag).
	pub fn is_first_slice(self, nal: &[u8]) -> bool {
		match self {
			// first_mb_in_slice is ue(v), so a zero value is a single 1 bit.
			Self::H264 => nal.get(1).is_some_and(|b| b & 0x80 != 0),
			Self::H265 => nal.get(2).is_some_and(|b| b & 0x80 != 0),
		}
	}

	/// Guess the family from the first NAL unit in a stream.
	///
	/// H.265 headers have a zero forbidden bit, a zero layer id and a temporal id of 1, so the second byte is 0x01.
	/// No sensible H.264 stream starts with a parameter set or AUD followed by 0x01.
	pub fn detect(nal: &[u8]) -> Option<Self> {
		let header = *nal.first()?;
		if header & 0x80 != 0 {
			return None;
		}

		let h265 = (header >> 1) & 0x3f;
		if nal.get(1) == Some(&0x01) && matches!(h265, 16..=21 | 32..=35 | 39) {
			return Some(Self::H265);
		}

		match header & 0x1f {
			1 | 5..=9 => Some(Self::H264),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum H264Nal {
	Unspecified = 0,
	NonIdrSlice = 1,
	DataPartitionA = 2,
	DataPartitionB = 3,
	DataPartitionC = 4,
	IdrSlice = 5,
	Sei = 6,
	Sps = 7,
	Pps = 8,
	Aud = 9,
	EndOfSeq = 10,
	EndOfStream = 11,
	Filler = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum H265Nal {
	IdrWRadl = 19,
	IdrNLp = 20,
	Cra = 21,
	Vps = 32,
	Sps = 33,
	Pps = 34,
	Aud = 35,
	PrefixSei = 39,
	SuffixSei = 40,
}

/// Iterate over the NAL units in a complete Annex B buffer.
///
/// Unlike the streaming demuxer, the end of the buffer terminates the final NAL.
pub fn split_annexb(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
	let mut rest = match find_start_code(buf) {
		Some((offset, size)) => &buf[offset + size..],
		None => &buf[buf.len()..],
	};

	std::iter::from_fn(move || {
		let current = rest;
		if current.is_empty() {
			return None;
		}

		match find_start_code(current) {
			Some((size, code)) => {
				rest = &current[size + code..];
				Some(&current[..size])
			}
			None => {
				rest = &current[current.len()..];
				Some(current)
			}
		}
	})
	.filter(|nal| !nal.is_empty())
}

/// Convert length-prefixed NAL units (avcC/hvcC style) into Annex B.
///
/// Truncated records are ignored; whatever was complete is kept.
pub fn length_prefixed_to_annexb(mut data: &[u8], length_size: usize, out: &mut BytesMut) -> usize {
	let mut count = 0;

	while data.len() >= length_size {
		let size = data[..length_size].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
		data = &data[length_size..];

		if size > data.len() {
			tracing::trace!(size, remaining = data.len(), "truncated length-prefixed NAL");
			break;
		}

		out.put_slice(&START_CODE);
		out.put_slice(&data[..size]);
		data = &data[size..];
		count += 1;
	}

	count
}

// Return the size of the start code at the start of the buffer.
pub(crate) fn after_start_code(b: &[u8]) -> Option<usize> {
	match b {
		[0, 0, 1, ..] => Some(3),
		[0, 0, 0, 1, ..] => Some(4),
		_ => None,
	}
}

// Return the number of bytes until the next start code, and the size of that start code.
pub(crate) fn find_start_code(mut b: &[u8]) -> Option<(usize, usize)> {
	// We need to find either a 3 byte or 4 byte start code.
	// 3-byte: 0 0 1
	// 4-byte: 0 0 0 1
	//
	// Check the 3rd byte first: if it's not a 0 or 1, we can immediately skip 3 bytes.
	let size = b.len();

	while b.len() >= 3 {
		// ? ? ?
		match b[2] {
			// ? ? 0
			0 if b.len() >= 4 => match b[3] {
				// ? ? 0 1
				1 => match b[1] {
					// ? 0 0 1
					0 => match b[0] {
						// 0 0 0 1
						0 => return Some((size - b.len(), 4)),
						// ? 0 0 1
						_ => return Some((size - b.len() + 1, 3)),
					},
					// ? x 0 1
					_ => b = &b[4..],
				},
				// ? ? 0 0 - skip only 1 byte to check for potential 0 0 0 1
				0 => b = &b[1..],
				// ? ? 0 x
				_ => b = &b[4..],
			},
			// ? ? 0 FIN
			0 => return None,
			// ? ? 1
			1 => match b[1] {
				// ? 0 1
				0 => match b[0] {
					// 0 0 1
					0 => return Some((size - b.len(), 3)),
					// ? 0 1
					_ => b = &b[3..],
				},
				// ? x 1
				_ => b = &b[3..],
			},
			// ? ? x
			_ => b = &b[3..],
		}
	}

	None
}
