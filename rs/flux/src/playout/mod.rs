//! Buffering between the demuxer and the decoders.
//!
//! Video units are held in a [JitterBuffer] ordered by presentation time and released once due.
//! When a released batch shows the client has fallen behind, [apply_catch_up] decides what to shed.

mod catchup;
mod jitter;

pub use catchup::*;
pub use jitter::*;
