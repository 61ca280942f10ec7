use bytes::Bytes;

use crate::codec::AacConfig;

/// One raw AAC frame cut out of an ADTS stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AdtsFrame {
	pub config: AacConfig,
	pub payload: Bytes,
}

fn is_sync(data: &[u8]) -> bool {
	matches!(data, [0xff, b, ..] if b & 0xf6 == 0xf0)
}

/// Whether the buffer starts with an ADTS sync word.
pub(crate) fn is_adts(data: &[u8]) -> bool {
	is_sync(data)
}

/// Split a buffer of back-to-back ADTS frames, stripping the headers.
///
/// Garbage between frames is skipped. A truncated final frame is dropped.
pub(crate) fn split_adts(data: &Bytes) -> Vec<AdtsFrame> {
	let mut frames = Vec::new();
	let mut pos = 0;

	while data.len() - pos >= 7 {
		let header = &data[pos..];
		if !is_sync(header) {
			match header[1..].windows(2).position(is_sync) {
				Some(skip) => {
					tracing::trace!(skip = skip + 1, "resyncing adts");
					pos += skip + 1;
					continue;
				}
				None => break,
			}
		}

		let protection_absent = header[1] & 0x01 == 1;
		let profile = header[2] >> 6;
		let frequency_index = (header[2] >> 2) & 0x0f;
		let channels = ((header[2] & 0x01) << 2) | (header[3] >> 6);
		let length = (((header[3] & 0x03) as usize) << 11) | ((header[4] as usize) << 3) | ((header[5] as usize) >> 5);
		let header_size = if protection_absent { 7 } else { 9 };

		if length < header_size || frequency_index > 12 {
			tracing::trace!(length, frequency_index, "invalid adts header");
			pos += 1;
			continue;
		}

		if pos + length > data.len() {
			tracing::trace!(length, remaining = data.len() - pos, "truncated adts frame");
			break;
		}

		frames.push(AdtsFrame {
			config: AacConfig {
				object_type: profile + 1,
				frequency_index,
				channels,
			},
			payload: data.slice(pos + header_size..pos + length),
		});

		pos += length;
	}

	frames
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	/// Build an ADTS frame: AAC-LC, 48kHz, stereo, no CRC.
	pub fn adts_frame(payload: &[u8]) -> Vec<u8> {
		let length = payload.len() + 7;
		let mut frame = vec![
			0xff,
			0xf1,
			(1 << 6) | (3 << 2),
			(2 << 6) | ((length >> 11) as u8 & 0x03),
			(length >> 3) as u8,
			((length & 0x07) << 5) as u8 | 0x1f,
			0xfc,
		];
		frame.extend_from_slice(payload);
		frame
	}

	#[test]
	fn split() {
		let data: Bytes = [adts_frame(b"one"), adts_frame(b"two!")].concat().into();
		let frames = split_adts(&data);

		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].payload.as_ref(), b"one");
		assert_eq!(frames[1].payload.as_ref(), b"two!");
		assert_eq!(frames[0].config.object_type, 2);
		assert_eq!(frames[0].config.sample_rate(), 48000);
		assert_eq!(frames[0].config.channels, 2);
	}

	#[test]
	fn skips_garbage() {
		let data: Bytes = [vec![0x00, 0x12], adts_frame(b"abc")].concat().into();
		let frames = split_adts(&data);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].payload.as_ref(), b"abc");
	}

	#[test]
	fn truncated() {
		let mut data = adts_frame(b"abcdef");
		data.truncate(10);
		assert!(split_adts(&data.into()).is_empty());
	}
}
