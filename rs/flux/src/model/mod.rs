//! The core model shared by every stage of the pipeline.

mod frame;

pub use frame::*;
