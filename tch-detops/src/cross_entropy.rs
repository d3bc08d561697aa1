use crate::common::*;

/// Weighted cross-entropy loss initializer.
#[derive(Debug, Clone)]
pub struct CrossEntropyLossInit {
    pub reduction: Reduction,
    pub loss_weight: f64,
}

impl Default for CrossEntropyLossInit {
    fn default() -> Self {
        Self {
            reduction: Reduction::Mean,
            loss_weight: 1.0,
        }
    }
}

impl CrossEntropyLossInit {
    pub fn build(self) -> Result<CrossEntropyLoss> {
        let Self {
            reduction,
            loss_weight,
        } = self;
        ensure!(loss_weight >= 0.0, "loss_weight must be non-negative");
        Ok(CrossEntropyLoss {
            reduction,
            loss_weight,
        })
    }
}

/// Cross-entropy over logits with per-sample weights and an explicit
/// averaging factor for the mean reduction.
#[derive(Debug)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
    loss_weight: f64,
}

impl CrossEntropyLoss {
    /// `scores` is `(n, c)`, `labels` a `(n,)` int64 tensor of class indices,
    /// `weights` a `(n,)` float tensor. A zero weight excludes the sample.
    pub fn forward(
        &self,
        scores: &Tensor,
        labels: &Tensor,
        weights: &Tensor,
        avg_factor: f64,
        reduction_override: Option<Reduction>,
    ) -> Result<Tensor> {
        let (num_samples, _num_classes) = scores.size2()?;
        ensure!(
            labels.size1()? == num_samples && weights.size1()? == num_samples,
            "labels/weights length must equal the number of score rows"
        );
        ensure!(avg_factor > 0.0, "avg_factor must be positive");
        let reduction = reduction_override.unwrap_or(self.reduction);

        // return zero tensor if input is empty and a reduction is applied
        if scores.numel() == 0 && reduction != Reduction::None {
            return Ok(
                Tensor::zeros(&[], (Kind::Float, scores.device())).set_requires_grad(false)
            );
        }

        let log_probs = scores.log_softmax(1, Kind::Float);
        let nll = -log_probs.gather(1, &labels.view([-1, 1]), false).view([-1]);
        let loss = nll * weights.to_kind(Kind::Float);

        let loss = match reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.sum(Kind::Float) / avg_factor,
            Reduction::Other(_) => unimplemented!(),
        };
        Ok(loss * self.loss_weight)
    }
}
