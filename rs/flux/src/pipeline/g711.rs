//! Software G.711 decoding, so the presenter can play A-law and µ-law without a decoder.

use crate::codec::AudioCodec;

/// Expand one A-law byte to a 16 bit linear sample.
pub fn alaw_to_linear(a: u8) -> i16 {
	let a = a ^ 0x55;
	let mut t = ((a & 0x0f) as i32) << 4;
	let segment = (a & 0x70) >> 4;
	match segment {
		0 => t += 8,
		1 => t += 0x108,
		_ => {
			t += 0x108;
			t <<= segment - 1;
		}
	}

	if a & 0x80 != 0 { t as i16 } else { -t as i16 }
}

/// Expand one µ-law byte to a 16 bit linear sample.
pub fn ulaw_to_linear(u: u8) -> i16 {
	let u = !u;
	let mut t = (((u & 0x0f) as i32) << 3) + 0x84;
	t <<= (u & 0x70) >> 4;

	if u & 0x80 != 0 { (0x84 - t) as i16 } else { (t - 0x84) as i16 }
}

/// Decode a G.711 payload into samples in the range -1.0..1.0.
///
/// Returns None for any other codec.
pub fn decode(codec: &AudioCodec, payload: &[u8]) -> Option<Vec<f32>> {
	let expand = match codec {
		AudioCodec::Alaw => alaw_to_linear,
		AudioCodec::Ulaw => ulaw_to_linear,
		_ => return None,
	};

	Some(payload.iter().map(|b| expand(*b) as f32 / 32768.0).collect())
}
