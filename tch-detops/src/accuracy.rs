use crate::common::*;

/// Top-1 accuracy over score rows against sparse labels.
///
/// Returns a scalar in `[0, 1]`; an empty input yields 0.
pub fn accuracy(scores: &Tensor, labels: &Tensor) -> Tensor {
    if scores.numel() == 0 {
        return Tensor::zeros(&[], (Kind::Float, scores.device())).set_requires_grad(false);
    }
    let pred = scores.argmax(1, false);
    (pred - labels).eq(0).to_kind(Kind::Float).mean(Kind::Float)
}
