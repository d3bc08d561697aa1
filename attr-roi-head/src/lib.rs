//! Attribute-aware RoI bounding box head.
//!
//! Extends a two-stage detector's region head with independent categorical
//! attribute branches sharing one sampling/assignment/suppression pipeline:
//! target construction, per-task loss aggregation, inference decoding,
//! multi-class NMS, and cascade bbox refinement.

mod cascade;
mod common;
mod config;
mod head;
mod inference;
mod loss;
mod nms;
mod target;

pub use config::*;
pub use head::*;
pub use inference::*;
pub use nms::*;
pub use target::*;
