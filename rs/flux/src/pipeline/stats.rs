use std::sync::{
	Arc,
	atomic::{AtomicI64, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// A point-in-time summary of a running pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stats {
	/// Received bitrate since the previous query.
	pub bitrate_kbps: f64,

	/// Decoded video frames per second since the previous query.
	pub fps: f64,

	/// Decoded audio frames per second since the previous query.
	pub audio_fps: f64,

	/// The latest decoded video timestamp minus the latest decoded audio timestamp.
	///
	/// None until both have been decoded at least once.
	pub av_sync_ms: Option<i64>,

	/// Video units dropped by buffering or catch-up, over the whole session.
	pub dropped: u64,
}

// Clocks use this until the first frame is decoded.
const NO_CLOCK: i64 = i64::MIN;

/// Lock-free counters updated by the pipeline task.
#[derive(Debug)]
struct Counters {
	bytes: AtomicU64,
	video_frames: AtomicU64,
	audio_frames: AtomicU64,
	dropped: AtomicU64,
	video_clock: AtomicI64,
	audio_clock: AtomicI64,
}

impl Default for Counters {
	fn default() -> Self {
		Self {
			bytes: AtomicU64::new(0),
			video_frames: AtomicU64::new(0),
			audio_frames: AtomicU64::new(0),
			dropped: AtomicU64::new(0),
			video_clock: AtomicI64::new(NO_CLOCK),
			audio_clock: AtomicI64::new(NO_CLOCK),
		}
	}
}

#[derive(Debug, Clone, Copy)]
struct Sample {
	at: Instant,
	bytes: u64,
	video_frames: u64,
	audio_frames: u64,
}

/// Shared between the pipeline task, which records, and the caller, which queries.
#[derive(Debug, Clone)]
pub struct StatsTracker {
	counters: Arc<Counters>,
	last: Arc<Mutex<Sample>>,
}

impl Default for StatsTracker {
	fn default() -> Self {
		Self::new()
	}
}

impl StatsTracker {
	pub fn new() -> Self {
		Self {
			counters: Default::default(),
			last: Arc::new(Mutex::new(Sample {
				at: Instant::now(),
				bytes: 0,
				video_frames: 0,
				audio_frames: 0,
			})),
		}
	}

	pub fn record_bytes(&self, bytes: usize) {
		self.counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
	}

	pub fn record_dropped(&self, count: usize) {
		self.counters.dropped.fetch_add(count as u64, Ordering::Relaxed);
	}

	pub fn record_video(&self, timestamp: i64) {
		self.counters.video_frames.fetch_add(1, Ordering::Relaxed);
		self.counters.video_clock.store(timestamp, Ordering::Relaxed);
	}

	pub fn record_audio(&self, timestamp: i64) {
		self.counters.audio_frames.fetch_add(1, Ordering::Relaxed);
		self.counters.audio_clock.store(timestamp, Ordering::Relaxed);
	}

	pub fn dropped(&self) -> u64 {
		self.counters.dropped.load(Ordering::Relaxed)
	}

	/// Compute rates over the time since the previous query.
	pub fn query(&self) -> Stats {
		let now = Sample {
			at: Instant::now(),
			bytes: self.counters.bytes.load(Ordering::Relaxed),
			video_frames: self.counters.video_frames.load(Ordering::Relaxed),
			audio_frames: self.counters.audio_frames.load(Ordering::Relaxed),
		};

		let last = std::mem::replace(&mut *self.last.lock(), now);
		let elapsed = now.at.duration_since(last.at).as_secs_f64();

		let rate = |delta: u64| if elapsed > 0.0 { delta as f64 / elapsed } else { 0.0 };

		let video = self.counters.video_clock.load(Ordering::Relaxed);
		let audio = self.counters.audio_clock.load(Ordering::Relaxed);
		let av_sync_ms = (video != NO_CLOCK && audio != NO_CLOCK).then(|| video - audio);

		Stats {
			bitrate_kbps: rate(now.bytes - last.bytes) * 8.0 / 1000.0,
			fps: rate(now.video_frames - last.video_frames),
			audio_fps: rate(now.audio_frames - last.audio_frames),
			av_sync_ms,
			dropped: self.dropped(),
		}
	}
}
