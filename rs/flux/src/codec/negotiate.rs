use bytes::Bytes;

use crate::{
	AccessUnit,
	codec::{Family, H264, H265, H264Nal, H265Nal, family_of, split_annexb},
};

/// Answers whether a decoder can handle a codec string.
#[async_trait::async_trait]
pub trait CapabilityProbe: Send + Sync {
	async fn is_supported(&self, codec: &str) -> bool;
}

/// Codec information supplied out-of-band, usually by a stream-info record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecHints {
	pub codec: Option<String>,
	pub vps: Option<Bytes>,
	pub sps: Option<Bytes>,
	pub pps: Option<Bytes>,
}

/// The parameter sets found for one video stream.
///
/// Each NAL is stored without its start code but with its header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSets {
	pub family: Option<Family>,
	pub vps: Option<Bytes>,
	pub sps: Option<Bytes>,
	pub pps: Option<Bytes>,
}

impl ParameterSets {
	/// Collect the parameter sets out of an Annex B payload.
	pub fn scan(payload: &[u8]) -> Self {
		let mut sets = Self::default();

		for nal in split_annexb(payload) {
			let family = match sets.family {
				Some(family) => family,
				None => match Family::detect(nal) {
					Some(family) => {
						sets.family = Some(family);
						family
					}
					None => continue,
				},
			};

			let Some(nal_type) = family.nal_type(nal) else {
				continue;
			};

			let slot = match family {
				Family::H264 => match H264Nal::try_from(nal_type) {
					Ok(H264Nal::Sps) => &mut sets.sps,
					Ok(H264Nal::Pps) => &mut sets.pps,
					_ => continue,
				},
				Family::H265 => match H265Nal::try_from(nal_type) {
					Ok(H265Nal::Vps) => &mut sets.vps,
					Ok(H265Nal::Sps) => &mut sets.sps,
					Ok(H265Nal::Pps) => &mut sets.pps,
					_ => continue,
				},
			};

			// The first occurrence wins.
			if slot.is_none() {
				*slot = Some(Bytes::copy_from_slice(nal));
			}
		}

		sets
	}

	/// Fill in whatever the bitstream lacked from the hints.
	pub fn or_hints(mut self, hints: &CodecHints) -> Self {
		self.vps = self.vps.or_else(|| hints.vps.clone());
		self.sps = self.sps.or_else(|| hints.sps.clone());
		self.pps = self.pps.or_else(|| hints.pps.clone());

		if self.family.is_none() {
			self.family = match (&self.vps, &self.sps) {
				(Some(_), _) => Some(Family::H265),
				(None, Some(sps)) => Family::detect(sps),
				(None, None) => hints.codec.as_deref().and_then(family_of),
			};
		}

		self
	}

	pub fn is_empty(&self) -> bool {
		self.vps.is_none() && self.sps.is_none() && self.pps.is_none()
	}
}

/// Derive a codec string from the parameter sets.
///
/// H.265 prefers the VPS and falls back to the SPS.
/// The hint only picks the H.265 sample entry: `hvc1` when hinted, `hev1` otherwise.
pub fn derive_codec_string(record: &ParameterSets, hint: Option<&str>) -> Option<String> {
	let family = record.family.or_else(|| record.vps.as_ref().map(|_| Family::H265))?;

	match family {
		Family::H264 => H264::from_sps(record.sps.as_ref()?).map(|c| c.to_string()),
		Family::H265 => {
			let vps = record.vps.as_deref().and_then(H265::from_vps);
			let mut codec = vps.or_else(|| record.sps.as_deref().and_then(H265::from_sps))?;
			codec.in_band = !hint.is_some_and(|h| h.starts_with("hvc1"));
			Some(codec.to_string())
		}
	}
}

/// Common codec strings tried when nothing better is known.
pub fn fallback_codecs(family: Family) -> &'static [&'static str] {
	match family {
		Family::H264 => &["avc1.42E01E", "avc1.4D401F", "avc1.640028"],
		Family::H265 => &["hev1.1.6.L93.B0", "hvc1.1.6.L93.B0", "hev1.2.4.L93.B0"],
	}
}

/// Where the chosen codec string came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Reason {
	#[display("derived from the bitstream")]
	Derived,
	#[display("supplied as a hint")]
	Hint,
	#[display("fallback list")]
	Fallback,
	#[display("h265 is disabled")]
	H265Disabled,
	#[display("no candidate is supported")]
	Unsupported,
}

/// The outcome of decoder negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
	/// The codec string to configure, if any candidate was supported.
	pub codec: Option<String>,
	pub supported: bool,
	pub reason: Reason,

	/// The bitstream-derived codec string, whether or not it won.
	pub derived: Option<String>,
	pub derived_supported: bool,

	pub family: Option<Family>,
	pub parameter_sets: ParameterSets,
}

/// Pick a decoder configuration for a video unit.
///
/// Candidates are tried in order: the codec derived from the bitstream, the hint, then the fallback list.
/// When H.265 is disallowed and the bitstream is H.265, nothing is probed at all.
pub async fn decide_decoder_config<P: CapabilityProbe + ?Sized>(
	unit: &AccessUnit,
	hints: &CodecHints,
	allow_h265: bool,
	probe: &P,
) -> Decision {
	let hint = hints.codec.as_deref().or(unit.codec.as_deref());

	let parameter_sets = ParameterSets::scan(&unit.payload).or_hints(hints);
	let derived = derive_codec_string(&parameter_sets, hint);
	let family = derived
		.as_deref()
		.and_then(family_of)
		.or(parameter_sets.family)
		.or_else(|| hint.and_then(family_of));

	let mut decision = Decision {
		codec: None,
		supported: false,
		reason: Reason::Unsupported,
		derived: derived.clone(),
		derived_supported: false,
		family,
		parameter_sets,
	};

	if !allow_h265 && derived.as_deref().and_then(family_of) == Some(Family::H265) {
		tracing::debug!(?derived, "h265 disabled, not probing");
		decision.reason = Reason::H265Disabled;
		return decision;
	}

	let mut candidates: Vec<(String, Reason)> = Vec::new();
	if let Some(derived) = derived {
		candidates.push((derived, Reason::Derived));
	}
	if let Some(hint) = hint {
		candidates.push((hint.to_string(), Reason::Hint));
	}
	for codec in fallback_codecs(family.unwrap_or(Family::H264)) {
		candidates.push((codec.to_string(), Reason::Fallback));
	}

	let mut seen = std::collections::HashSet::new();
	candidates.retain(|(codec, _)| seen.insert(codec.clone()));

	if !allow_h265 {
		candidates.retain(|(codec, _)| family_of(codec) != Some(Family::H265));
	}

	for (codec, reason) in candidates {
		if !probe.is_supported(&codec).await {
			tracing::trace!(%codec, "codec not supported");
			continue;
		}

		tracing::debug!(%codec, %reason, "selected decoder codec");
		decision.derived_supported = decision.derived.as_deref() == Some(codec.as_str());
		decision.codec = Some(codec);
		decision.supported = true;
		decision.reason = reason;
		return decision;
	}

	decision
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	struct Probe {
		supported: Vec<&'static str>,
		probed: Mutex<Vec<String>>,
	}

	impl Probe {
		fn new(supported: &[&'static str]) -> Self {
			Self {
				supported: supported.to_vec(),
				probed: Default::default(),
			}
		}

		fn probed(&self) -> Vec<String> {
			self.probed.lock().unwrap().clone()
		}
	}

	#[async_trait::async_trait]
	impl CapabilityProbe for Probe {
		async fn is_supported(&self, codec: &str) -> bool {
			self.probed.lock().unwrap().push(codec.to_string());
			self.supported.contains(&codec)
		}
	}

	fn h264_keyframe() -> AccessUnit {
		let payload = [
			&[0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0xac][..],
			&[0, 0, 0, 1, 0x68, 0xee, 0x3c, 0x80],
			&[0, 0, 0, 1, 0x65, 0x88, 0x84],
		]
		.concat();
		AccessUnit::video(0, true, payload.into())
	}

	fn h265_keyframe() -> AccessUnit {
		let ptl = [0x01, 0x60, 0, 0, 0, 0xB0, 0, 0, 0, 0, 0, 93];
		let mut payload = vec![0, 0, 0, 1, 0x40, 0x01, 0x0c, 0x01, 0xff, 0xff];
		payload.extend_from_slice(&ptl);
		payload.extend_from_slice(&[0, 0, 0, 1, 0x26, 0x01, 0xaf]);
		AccessUnit::video(0, true, payload.into())
	}

	#[test]
	fn scan_sets() {
		let sets = ParameterSets::scan(&h264_keyframe().payload);
		assert_eq!(sets.family, Some(Family::H264));
		assert_eq!(sets.sps.as_deref(), Some(&[0x67, 0x64, 0x00, 0x1f, 0xac][..]));
		assert_eq!(sets.pps.as_deref(), Some(&[0x68, 0xee, 0x3c, 0x80][..]));
		assert!(sets.vps.is_none());
	}

	#[test]
	fn derive() {
		let sets = ParameterSets::scan(&h264_keyframe().payload);
		assert_eq!(derive_codec_string(&sets, None).as_deref(), Some("avc1.64001F"));

		let sets = ParameterSets::scan(&h265_keyframe().payload);
		assert_eq!(derive_codec_string(&sets, None).as_deref(), Some("hev1.1.6.L93.B0"));
		assert_eq!(
			derive_codec_string(&sets, Some("hvc1.1.6.L93.B0")).as_deref(),
			Some("hvc1.1.6.L93.B0")
		);

		assert_eq!(derive_codec_string(&ParameterSets::default(), None), None);
	}

	#[test]
	fn sps_from_hints() {
		let hints = CodecHints {
			sps: Some(Bytes::from_static(&[0x67, 0x42, 0xE0, 0x1E])),
			..Default::default()
		};
		let sets = ParameterSets::scan(&[0, 0, 0, 1, 0x41, 0x9a]).or_hints(&hints);
		assert_eq!(derive_codec_string(&sets, None).as_deref(), Some("avc1.42E01E"));
	}

	#[tokio::test]
	async fn derived_wins() {
		let probe = Probe::new(&["avc1.64001F", "avc1.42E01E"]);
		let decision = decide_decoder_config(&h264_keyframe(), &CodecHints::default(), true, &probe).await;

		assert_eq!(decision.codec.as_deref(), Some("avc1.64001F"));
		assert_eq!(decision.reason, Reason::Derived);
		assert!(decision.supported);
		assert!(decision.derived_supported);
		assert_eq!(probe.probed(), vec!["avc1.64001F"]);
	}

	#[tokio::test]
	async fn falls_back_in_order() {
		let probe = Probe::new(&["avc1.4D401F"]);
		let hints = CodecHints {
			codec: Some("avc1.640033".into()),
			..Default::default()
		};
		let decision = decide_decoder_config(&h264_keyframe(), &hints, true, &probe).await;

		assert_eq!(decision.codec.as_deref(), Some("avc1.4D401F"));
		assert_eq!(decision.reason, Reason::Fallback);
		assert!(!decision.derived_supported);
		assert_eq!(
			probe.probed(),
			vec!["avc1.64001F", "avc1.640033", "avc1.42E01E", "avc1.4D401F"]
		);
	}

	#[tokio::test]
	async fn duplicates_probed_once() {
		let probe = Probe::new(&[]);
		let hints = CodecHints {
			codec: Some("avc1.42E01E".into()),
			sps: Some(Bytes::from_static(&[0x67, 0x42, 0xE0, 0x1E])),
			..Default::default()
		};
		let unit = AccessUnit::video(0, false, Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9a]));
		let decision = decide_decoder_config(&unit, &hints, true, &probe).await;

		assert!(!decision.supported);
		assert_eq!(decision.reason, Reason::Unsupported);
		assert_eq!(probe.probed(), vec!["avc1.42E01E", "avc1.4D401F", "avc1.640028"]);
	}

	#[tokio::test]
	async fn h265_disabled_probes_nothing() {
		let probe = Probe::new(&["hev1.1.6.L93.B0"]);
		let decision = decide_decoder_config(&h265_keyframe(), &CodecHints::default(), false, &probe).await;

		assert!(!decision.supported);
		assert_eq!(decision.reason, Reason::H265Disabled);
		assert_eq!(decision.derived.as_deref(), Some("hev1.1.6.L93.B0"));
		assert!(probe.probed().is_empty());
	}

	#[tokio::test]
	async fn h265_allowed() {
		let probe = Probe::new(&["hev1.1.6.L93.B0"]);
		let decision = decide_decoder_config(&h265_keyframe(), &CodecHints::default(), true, &probe).await;

		assert_eq!(decision.codec.as_deref(), Some("hev1.1.6.L93.B0"));
		assert_eq!(decision.family, Some(Family::H265));
	}
}
