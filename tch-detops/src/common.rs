pub use anyhow::{bail, ensure, format_err, Error, Result};
pub use itertools::{izip, Itertools as _};
pub use std::cmp::Ordering;
pub use tch::{Device, IndexOp, Kind, Reduction, Tensor};
