use bytes::{Buf, Bytes};

use crate::codec::{Family, strip_emulation};

/// One message from an SEI NAL unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
	pub payload_type: u32,
	pub payload: Bytes,
}

/// Parse the messages out of an SEI NAL unit (header included).
///
/// Truncated messages are dropped along with everything after them.
pub fn sei_messages(family: Family, nal: &[u8]) -> Vec<SeiMessage> {
	let mut rbsp = strip_emulation(nal);
	if rbsp.len() < family.header_size() {
		return Vec::new();
	}
	rbsp.advance(family.header_size());

	let mut messages = Vec::new();

	while !rbsp.is_empty() {
		// rbsp_trailing_bits: a lone 0x80, possibly followed by cabac_zero_words.
		if rbsp[0] == 0x80 && rbsp[1..].iter().all(|b| *b == 0) {
			break;
		}

		let Some(payload_type) = read_varint(&mut rbsp) else {
			break;
		};
		let Some(size) = read_varint(&mut rbsp) else {
			break;
		};

		let size = size as usize;
		if size > rbsp.len() {
			tracing::trace!(payload_type, size, remaining = rbsp.len(), "truncated sei message");
			break;
		}

		messages.push(SeiMessage {
			payload_type,
			payload: rbsp.split_to(size),
		});
	}

	messages
}

// The payload type and size are coded as a run of 0xFF bytes plus a final byte.
fn read_varint(buf: &mut Bytes) -> Option<u32> {
	let mut value = 0u32;
	loop {
		if !buf.has_remaining() {
			return None;
		}

		let byte = buf.get_u8();
		value = value.checked_add(byte as u32)?;
		if byte != 0xff {
			return Some(value);
		}
	}
}
