//! # flux: low-latency media ingest
//!
//! `flux` turns a live byte stream into decodable media.
//! Chunks arrive over a message-oriented transport (usually a WebSocket) and are
//! demultiplexed, buffered against jitter, shed when the client falls behind,
//! and finally dispatched to decoder sinks supplied by the caller.
//!
//! ## Overview
//!
//! - **Demux**: FLV, MPEG-TS, MPEG-PS and raw Annex-B, see [`demux`].
//! - **Framing**: a small TLV protocol with JSON stream-info, see [`framing`].
//! - **Playout**: the jitter buffer and catch-up policy, see [`playout`].
//! - **Codec**: codec string derivation and decoder negotiation, see [`codec`].
//! - **Pipeline**: the orchestrator tying it together, see [`pipeline`].
//!
//! Decoding and rendering are not part of this crate.
//! They are modelled as the traits in [`pipeline`] and implemented by the embedder.
mod error;

pub mod codec;
pub mod demux;
pub mod framing;
pub mod model;
pub mod pipeline;
pub mod playout;
pub mod transport;

pub use error::*;
pub use model::*;
