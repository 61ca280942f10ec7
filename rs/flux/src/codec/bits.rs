use bytes::Bytes;

/// Remove emulation prevention bytes (the 0x03 in `00 00 03`) from a NAL unit.
///
/// Returns the input untouched (and without copying) when nothing needs removing.
pub fn strip_emulation(ebsp: &[u8]) -> Bytes {
	let first = ebsp.windows(3).position(|w| w == [0, 0, 3]);
	let Some(first) = first else {
		return Bytes::copy_from_slice(ebsp);
	};

	let mut rbsp = Vec::with_capacity(ebsp.len());
	rbsp.extend_from_slice(&ebsp[..first]);

	let mut zeros = 0;
	for &b in &ebsp[first..] {
		if zeros >= 2 && b == 3 {
			zeros = 0;
			continue;
		}

		zeros = if b == 0 { zeros + 1 } else { 0 };
		rbsp.push(b);
	}

	rbsp.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bit reader exhausted")]
pub struct BitsExhausted;

/// Reads big-endian bit fields out of an RBSP.
///
/// Emulation prevention must already be removed, see [strip_emulation].
pub struct BitReader<'a> {
	data: &'a [u8],
	// The position in bits.
	pos: usize,
}

impl<'a> BitReader<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	pub fn remaining(&self) -> usize {
		(self.data.len() * 8).saturating_sub(self.pos)
	}

	pub fn skip(&mut self, bits: usize) -> Result<(), BitsExhausted> {
		if bits > self.remaining() {
			return Err(BitsExhausted);
		}

		self.pos += bits;
		Ok(())
	}

	pub fn read_bit(&mut self) -> Result<bool, BitsExhausted> {
		Ok(self.read(1)? == 1)
	}

	/// Read up to 64 bits as an unsigned integer.
	pub fn read(&mut self, bits: usize) -> Result<u64, BitsExhausted> {
		debug_assert!(bits <= 64);
		if bits > self.remaining() {
			return Err(BitsExhausted);
		}

		let mut value = 0u64;
		for _ in 0..bits {
			let byte = self.data[self.pos / 8];
			let bit = (byte >> (7 - (self.pos % 8))) & 1;
			value = (value << 1) | bit as u64;
			self.pos += 1;
		}

		Ok(value)
	}

	pub fn read_u8(&mut self) -> Result<u8, BitsExhausted> {
		Ok(self.read(8)? as u8)
	}

	pub fn read_u32(&mut self) -> Result<u32, BitsExhausted> {
		Ok(self.read(32)? as u32)
	}

	/// Read an unsigned Exp-Golomb code.
	pub fn read_ue(&mut self) -> Result<u32, BitsExhausted> {
		let mut zeros = 0;
		while !self.read_bit()? {
			zeros += 1;
			if zeros > 31 {
				return Err(BitsExhausted);
			}
		}

		let rest = self.read(zeros)?;
		Ok(((1u64 << zeros) - 1 + rest) as u32)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strip_nothing() {
		let data = [0x67, 0x42, 0x00, 0x1e];
		assert_eq!(strip_emulation(&data).as_ref(), &data);
	}

	#[test]
	fn strip_single() {
		let data = [0x67, 0x00, 0x00, 0x03, 0x01, 0xff];
		assert_eq!(strip_emulation(&data).as_ref(), &[0x67, 0x00, 0x00, 0x01, 0xff]);
	}

	#[test]
	fn strip_consecutive() {
		// 00 00 03 00 00 03 -> 00 00 00 00
		let data = [0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x02];
		assert_eq!(strip_emulation(&data).as_ref(), &[0x00, 0x00, 0x00, 0x00, 0x02]);
	}

	#[test]
	fn strip_keeps_lone_three() {
		let data = [0x00, 0x03, 0x00, 0x03];
		assert_eq!(strip_emulation(&data).as_ref(), &data);
	}

	#[test]
	fn read_fields() {
		let data = [0b1010_1100, 0xff, 0x00];
		let mut r = BitReader::new(&data);
		assert_eq!(r.read(2).unwrap(), 0b10);
		assert!(r.read_bit().unwrap());
		assert_eq!(r.read(5).unwrap(), 0b01100);
		assert_eq!(r.read_u8().unwrap(), 0xff);
		assert_eq!(r.remaining(), 8);
		assert!(r.read(9).is_err());
	}

	#[test]
	fn read_exp_golomb() {
		// 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3
		let data = [0b1010_0110, 0b0100_0000];
		let mut r = BitReader::new(&data);
		assert_eq!(r.read_ue().unwrap(), 0);
		assert_eq!(r.read_ue().unwrap(), 1);
		assert_eq!(r.read_ue().unwrap(), 2);
		assert_eq!(r.read_ue().unwrap(), 3);
	}
}
