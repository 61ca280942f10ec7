use std::collections::VecDeque;

use crate::AccessUnit;

/// A queue of access units ordered by presentation time.
///
/// Units may arrive out of order (B-frames, interleaved PES), so each one is inserted at its sorted position.
/// Equal timestamps keep their arrival order.
#[derive(Debug)]
pub struct JitterBuffer {
	units: VecDeque<AccessUnit>,

	/// Units older than the latest timestamp minus this are dropped by [Self::drop_lagging].
	pub max_duration_ms: i64,

	/// The most units held at once; the oldest are dropped first.
	pub max_frame_count: usize,
}

impl JitterBuffer {
	pub fn new(max_duration_ms: i64, max_frame_count: usize) -> Self {
		Self {
			units: VecDeque::new(),
			max_duration_ms,
			max_frame_count,
		}
	}

	/// Insert units at their sorted positions, then trim the front down to `max_frame_count`.
	///
	/// Returns the number of units trimmed.
	pub fn push<I: IntoIterator<Item = AccessUnit>>(&mut self, units: I) -> usize {
		for unit in units {
			let index = self.units.partition_point(|u| u.timestamp <= unit.timestamp);
			self.units.insert(index, unit);
		}

		let excess = self.units.len().saturating_sub(self.max_frame_count);
		if excess > 0 {
			tracing::trace!(excess, max = self.max_frame_count, "jitter buffer full");
			self.units.drain(..excess);
		}

		excess
	}

	/// Remove and return every unit with a timestamp at or before `target`.
	pub fn pop_until(&mut self, target: i64) -> Vec<AccessUnit> {
		let cut = self.units.partition_point(|u| u.timestamp <= target);
		self.units.drain(..cut).collect()
	}

	/// Drop units older than `latest - max_duration_ms`, returning how many were dropped.
	pub fn drop_lagging(&mut self, latest: i64) -> usize {
		let threshold = latest - self.max_duration_ms;
		let cut = self.units.partition_point(|u| u.timestamp < threshold);
		if cut > 0 {
			tracing::debug!(dropped = cut, threshold, "dropping lagging units");
			self.units.drain(..cut);
		}
		cut
	}

	pub fn len(&self) -> usize {
		self.units.len()
	}

	pub fn is_empty(&self) -> bool {
		self.units.is_empty()
	}

	/// The span between the oldest and newest buffered unit.
	pub fn buffered_duration_ms(&self) -> i64 {
		match (self.units.front(), self.units.back()) {
			(Some(first), Some(last)) => last.timestamp - first.timestamp,
			_ => 0,
		}
	}

	pub fn clear(&mut self) {
		self.units.clear();
	}

	pub fn iter(&self) -> impl Iterator<Item = &AccessUnit> {
		self.units.iter()
	}
}
