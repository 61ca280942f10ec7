use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
	AccessUnit,
	codec::{Family, START_CODE, after_start_code, find_start_code},
	demux::{DemuxConfig, Metadata},
};

/// Demuxes a raw H.264 or H.265 Annex B elementary stream.
///
/// There are no timestamps in the bitstream, so each access unit is stamped with a fixed interval.
pub struct AnnexB {
	// Bytes that haven't formed a complete NAL yet.
	buffer: BytesMut,

	// Where to resume the start code search, so a large NAL isn't rescanned on every chunk.
	scan: usize,

	// The NAL units making up the current access unit.
	current: Vec<Bytes>,
	current_slice: bool,
	current_keyframe: bool,

	family: Option<Family>,

	next_timestamp: i64,
	interval: i64,

	pub(crate) metadata: Metadata,
}

impl AnnexB {
	pub fn new(config: DemuxConfig) -> Self {
		Self {
			buffer: BytesMut::new(),
			scan: 0,
			current: Vec::new(),
			current_slice: false,
			current_keyframe: false,
			family: None,
			next_timestamp: 0,
			interval: config.annexb_frame_interval_ms,
			metadata: Metadata::new(config.metadata),
		}
	}

	/// The family, once it has been detected from the stream.
	pub fn family(&self) -> Option<Family> {
		self.family
	}

	pub fn demux(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
		self.buffer.extend_from_slice(chunk);

		let mut units = Vec::new();

		loop {
			let Some(code) = self.sync() else {
				break;
			};

			let from = self.scan.max(code);
			match find_start_code(&self.buffer[from..]) {
				Some((size, _)) => {
					let nal = self.buffer.split_to(from + size).freeze().slice(code..);
					self.scan = 0;
					self.nal(nal, &mut units);
				}
				None => {
					// Keep the last few bytes in view: they could be the start of the next start code.
					self.scan = self.buffer.len().saturating_sub(3).max(code);
					break;
				}
			}
		}

		units
	}

	/// Emit the final NAL and access unit.
	pub fn flush(&mut self) -> Vec<AccessUnit> {
		let mut units = Vec::new();

		if let Some(code) = after_start_code(&self.buffer) {
			let nal = self.buffer.split().freeze().slice(code..);
			self.nal(nal, &mut units);
		}

		self.buffer.clear();
		self.scan = 0;

		if let Some(unit) = self.emit() {
			units.push(unit);
		}

		units
	}

	// Discard anything before the first start code, returning the size of that start code.
	fn sync(&mut self) -> Option<usize> {
		if let Some(code) = after_start_code(&self.buffer) {
			return Some(code);
		}

		match find_start_code(&self.buffer) {
			Some((offset, code)) => {
				tracing::trace!(skipped = offset, "discarding bytes before start code");
				self.buffer.advance(offset);
				self.scan = 0;
				Some(code)
			}
			None => {
				// Keep enough to complete a start code split across chunks.
				let keep = self.buffer.len().min(3);
				self.buffer.advance(self.buffer.len() - keep);
				self.scan = 0;
				None
			}
		}
	}

	fn nal(&mut self, mut nal: Bytes, units: &mut Vec<AccessUnit>) {
		// trailing_zero_8bits belong to the next start code, not the NAL.
		let end = nal.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
		nal.truncate(end);

		if nal.is_empty() {
			return;
		}

		let family = match self.family {
			Some(family) => family,
			None => match Family::detect(&nal) {
				Some(family) => {
					tracing::debug!(?family, "detected annex b family");
					self.family = Some(family);
					family
				}
				None => {
					tracing::trace!(size = nal.len(), "dropping nal before the family is known");
					return;
				}
			},
		};

		let boundary = if family.is_aud(&nal) || family.is_prefix(&nal) {
			self.current_slice
		} else if family.is_slice(&nal) {
			// An IDR always forces a new unit after a non-IDR slice, even without a delimiter.
			self.current_slice
				&& (family.is_first_slice(&nal) || (family.is_keyframe(&nal) && !self.current_keyframe))
		} else {
			false
		};

		if boundary {
			units.extend(self.emit());
		}

		if family.is_sei(&nal) {
			self.metadata.sei(family, &nal, self.next_timestamp);
		}

		if family.is_slice(&nal) {
			self.current_slice = true;
			self.current_keyframe |= family.is_keyframe(&nal);
		}

		self.current.push(nal);
	}

	fn emit(&mut self) -> Option<AccessUnit> {
		let nals = std::mem::take(&mut self.current);
		let slice = std::mem::take(&mut self.current_slice);
		let keyframe = std::mem::take(&mut self.current_keyframe);

		if !slice {
			// Parameter sets without a picture are carried into the next unit.
			self.current = nals;
			return None;
		}

		let size = nals.iter().map(|nal| nal.len() + START_CODE.len()).sum();
		let mut payload = BytesMut::with_capacity(size);
		for nal in nals {
			payload.put_slice(&START_CODE);
			payload.put_slice(&nal);
		}

		let timestamp = self.next_timestamp;
		self.next_timestamp += self.interval;

		Some(AccessUnit::video(timestamp, keyframe, payload.freeze()))
	}
}
