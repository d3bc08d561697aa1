use crate::common::*;

/// Smooth-L1 regression loss initializer.
#[derive(Debug, Clone)]
pub struct SmoothL1LossInit {
    pub beta: f64,
    pub reduction: Reduction,
    pub loss_weight: f64,
}

impl Default for SmoothL1LossInit {
    fn default() -> Self {
        Self {
            beta: 1.0,
            reduction: Reduction::Mean,
            loss_weight: 1.0,
        }
    }
}

impl SmoothL1LossInit {
    pub fn build(self) -> Result<SmoothL1Loss> {
        let Self {
            beta,
            reduction,
            loss_weight,
        } = self;
        ensure!(beta > 0.0, "beta must be positive");
        ensure!(loss_weight >= 0.0, "loss_weight must be non-negative");
        Ok(SmoothL1Loss {
            beta,
            reduction,
            loss_weight,
        })
    }
}

/// Elementwise smooth-L1 with per-element weights and an explicit averaging
/// factor for the mean reduction.
#[derive(Debug)]
pub struct SmoothL1Loss {
    beta: f64,
    reduction: Reduction,
    loss_weight: f64,
}

impl SmoothL1Loss {
    pub fn forward(
        &self,
        pred: &Tensor,
        target: &Tensor,
        weights: &Tensor,
        avg_factor: f64,
        reduction_override: Option<Reduction>,
    ) -> Result<Tensor> {
        ensure!(
            pred.size() == target.size() && pred.size() == weights.size(),
            "pred {:?}, target {:?} and weights {:?} must share one shape",
            pred.size(),
            target.size(),
            weights.size()
        );
        ensure!(avg_factor > 0.0, "avg_factor must be positive");
        let reduction = reduction_override.unwrap_or(self.reduction);

        if pred.numel() == 0 && reduction != Reduction::None {
            return Ok(
                Tensor::zeros(&[], (Kind::Float, pred.device())).set_requires_grad(false)
            );
        }

        let diff = (pred - target).abs();
        let quadratic: Tensor = 0.5 * &diff * &diff / self.beta;
        let linear = &diff - 0.5 * self.beta;
        let loss = quadratic.where_self(&diff.lt(self.beta), &linear) * weights.to_kind(Kind::Float);

        let loss = match reduction {
            Reduction::None => loss,
            Reduction::Sum => loss.sum(Kind::Float),
            Reduction::Mean => loss.sum(Kind::Float) / avg_factor,
            Reduction::Other(_) => unimplemented!(),
        };
        Ok(loss * self.loss_weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn quadratic_below_beta_linear_above() -> Result<()> {
        let loss_fn = SmoothL1LossInit::default().build()?;
        let pred = Tensor::of_slice(&[0.5_f32, 3.0]).view([2, 1]);
        let target = Tensor::zeros(&[2, 1], tch::kind::FLOAT_CPU);
        let weights = Tensor::of_slice(&[1.0_f32, 1.0]).view([2, 1]);

        let loss = loss_fn.forward(&pred, &target, &weights, 1.0, None)?;
        // 0.5 * 0.5^2 + (3.0 - 0.5)
        assert_abs_diff_eq!(f64::from(&loss), 0.125 + 2.5, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn averaging_factor_divides() -> Result<()> {
        let loss_fn = SmoothL1LossInit::default().build()?;
        let pred = Tensor::of_slice(&[2.0_f32]).view([1, 1]);
        let target = Tensor::zeros(&[1, 1], tch::kind::FLOAT_CPU);
        let weights = Tensor::of_slice(&[1.0_f32]).view([1, 1]);

        let loss = loss_fn.forward(&pred, &target, &weights, 10.0, None)?;
        assert_abs_diff_eq!(f64::from(&loss), 1.5 / 10.0, epsilon = 1e-6);
        Ok(())
    }
}
