pub use anyhow::{bail, ensure, format_err, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use log::warn;
pub use noisy_float::prelude::*;
pub use std::{borrow::Borrow, ops::Range};
pub use tch::{nn, Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;
