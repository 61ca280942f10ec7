use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::AccessUnit;

/// How to shed video when the client falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CatchUpMode {
	/// Never drop anything.
	None,

	/// Keep only the newest unit.
	Latest,

	/// Keep keyframes only.
	DropB,

	/// Keep keyframes and every other non-keyframe.
	DropBp,

	/// Keep everything from the most recent keyframe.
	#[default]
	DropToKey,
}

impl fmt::Display for CatchUpMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::None => write!(f, "none"),
			Self::Latest => write!(f, "latest"),
			Self::DropB => write!(f, "drop-b"),
			Self::DropBp => write!(f, "drop-bp"),
			Self::DropToKey => write!(f, "drop-to-key"),
		}
	}
}

impl FromStr for CatchUpMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		<Self as clap::ValueEnum>::from_str(s, true)
	}
}

// Kept by drop-to-key when the batch has no keyframe at all.
const TAIL_WITHOUT_KEYFRAME: usize = 6;

/// Reported whenever catch-up actually dropped something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpEvent {
	pub mode: CatchUpMode,
	pub dropped: usize,
	pub kept: usize,
}

/// The outcome of [apply_catch_up].
#[derive(Debug, Default)]
pub struct CatchUp {
	pub kept: Vec<AccessUnit>,
	pub dropped: usize,
	pub event: Option<CatchUpEvent>,
}

/// Decide which units of a released batch survive.
///
/// Nothing happens unless the batch is overrun: its span up to `latest` exceeds `max_duration_ms`,
/// or it holds more than `max_frame_count` units.
pub fn apply_catch_up(
	units: Vec<AccessUnit>,
	mode: CatchUpMode,
	latest: i64,
	max_duration_ms: i64,
	max_frame_count: usize,
) -> CatchUp {
	let overrun = match units.first() {
		Some(first) => latest - first.timestamp > max_duration_ms || units.len() > max_frame_count,
		None => false,
	};

	if !overrun || mode == CatchUpMode::None {
		return CatchUp {
			kept: units,
			..Default::default()
		};
	}

	let total = units.len();

	let kept: Vec<AccessUnit> = match mode {
		CatchUpMode::None => units,
		CatchUpMode::Latest => units.into_iter().last().into_iter().collect(),
		CatchUpMode::DropB => units.into_iter().filter(|u| u.keyframe).collect(),
		CatchUpMode::DropBp => {
			let mut index = 0;
			units
				.into_iter()
				.filter(|u| {
					if u.keyframe {
						return true;
					}
					index += 1;
					index % 2 == 1
				})
				.collect()
		}
		CatchUpMode::DropToKey => {
			let start = match units.iter().rposition(|u| u.keyframe) {
				Some(start) => start,
				None => total.saturating_sub(TAIL_WITHOUT_KEYFRAME),
			};
			let mut units = units;
			units.split_off(start)
		}
	};

	let dropped = total - kept.len();
	let event = (dropped > 0).then(|| {
		tracing::debug!(%mode, dropped, kept = kept.len(), latest, "catching up");
		CatchUpEvent {
			mode,
			dropped,
			kept: kept.len(),
		}
	});

	CatchUp { kept, dropped, event }
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	// Keyframe markers, one per unit at 40ms spacing.
	fn batch(pattern: &str) -> Vec<AccessUnit> {
		pattern
			.chars()
			.enumerate()
			.map(|(i, c)| AccessUnit::video(i as i64 * 40, c == 'K', Bytes::new()))
			.collect()
	}

	fn pattern(units: &[AccessUnit]) -> String {
		units.iter().map(|u| if u.keyframe { 'K' } else { 'P' }).collect()
	}

	fn overrun(units: Vec<AccessUnit>, mode: CatchUpMode) -> CatchUp {
		let latest = units.last().map(|u| u.timestamp).unwrap_or_default();
		apply_catch_up(units, mode, latest, 0, 100)
	}

	#[test]
	fn no_overrun_is_noop() {
		let units = batch("KPPP");
		let result = apply_catch_up(units, CatchUpMode::Latest, 120, 1000, 10);
		assert_eq!(result.kept.len(), 4);
		assert_eq!(result.dropped, 0);
		assert!(result.event.is_none());
	}

	#[test]
	fn frame_count_triggers() {
		let result = apply_catch_up(batch("KPPP"), CatchUpMode::DropB, 120, 1000, 3);
		assert_eq!(pattern(&result.kept), "K");
	}

	#[test]
	fn none_never_drops() {
		let result = overrun(batch("KPPPKPP"), CatchUpMode::None);
		assert_eq!(result.kept.len(), 7);
		assert!(result.event.is_none());
	}

	#[test]
	fn latest_keeps_one() {
		for p in ["K", "KP", "PPPP", "KPPKPP"] {
			let result = overrun(batch(p), CatchUpMode::Latest);
			assert_eq!(result.kept.len(), 1, "{p}");
			assert_eq!(result.dropped, p.len() - 1);
		}

		let result = overrun(Vec::new(), CatchUpMode::Latest);
		assert!(result.kept.is_empty());
	}

	#[test]
	fn drop_b() {
		let result = overrun(batch("KPPKPP"), CatchUpMode::DropB);
		assert_eq!(pattern(&result.kept), "KK");
		assert_eq!(
			result.event,
			Some(CatchUpEvent {
				mode: CatchUpMode::DropB,
				dropped: 4,
				kept: 2,
			})
		);
	}

	#[test]
	fn drop_bp() {
		let units = batch("KPPPPKPP");
		let result = overrun(units, CatchUpMode::DropBp);

		// Of the non-keyframes at 1,2,3,4,6,7, every other one survives starting with the first.
		let timestamps: Vec<i64> = result.kept.iter().map(|u| u.timestamp).collect();
		assert_eq!(timestamps, vec![0, 40, 120, 200, 240]);
		assert_eq!(result.dropped, 3);
	}

	#[test]
	fn drop_to_key() {
		for p in ["KPPKPP", "PPK", "KPPP", "PKPKPKP", "K"] {
			let units = batch(p);
			let last_key = units.iter().rposition(|u| u.keyframe).unwrap();
			let tail: Vec<i64> = units[last_key..].iter().map(|u| u.timestamp).collect();

			let result = overrun(units, CatchUpMode::DropToKey);
			let kept: Vec<i64> = result.kept.iter().map(|u| u.timestamp).collect();
			assert_eq!(kept, tail, "{p}");
			assert!(result.kept[0].keyframe);
		}
	}

	#[test]
	fn drop_to_key_without_keyframe() {
		let result = overrun(batch("PPPPPPPPPP"), CatchUpMode::DropToKey);
		assert_eq!(result.kept.len(), 6);
		assert_eq!(result.kept[0].timestamp, 160);
		assert_eq!(result.dropped, 4);

		let result = overrun(batch("PPP"), CatchUpMode::DropToKey);
		assert_eq!(result.kept.len(), 3);
		assert!(result.event.is_none());
	}

	#[test]
	fn mode_names() {
		for mode in ["none", "latest", "drop-b", "drop-bp", "drop-to-key"] {
			assert_eq!(mode.parse::<CatchUpMode>().unwrap().to_string(), mode);
		}
		assert!("drop-everything".parse::<CatchUpMode>().is_err());
	}
}
