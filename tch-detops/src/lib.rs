//! Generic detection building blocks over `tch` tensors: box coding,
//! weighted classification/regression losses, and NMS primitives.

mod accuracy;
mod coder;
mod common;
mod cross_entropy;
mod nms;
mod smooth_l1;

pub use accuracy::*;
pub use coder::*;
pub use cross_entropy::*;
pub use nms::*;
pub use smooth_l1::*;
