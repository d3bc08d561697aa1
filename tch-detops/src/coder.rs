use crate::common::*;
use serde::{Deserialize, Serialize};

/// Delta-XYWH box coder.
///
/// Encodes (x1, y1, x2, y2) box pairs into normalized (dx, dy, dw, dh)
/// regression deltas and decodes them back. Decoded boxes are clipped to the
/// image bounds when a `max_shape` is supplied and `clip_border` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaXywhBoxCoder {
    pub target_means: [f64; 4],
    pub target_stds: [f64; 4],
    pub clip_border: bool,
}

impl Default for DeltaXywhBoxCoder {
    fn default() -> Self {
        Self {
            target_means: [0.0, 0.0, 0.0, 0.0],
            target_stds: [0.1, 0.1, 0.2, 0.2],
            clip_border: true,
        }
    }
}

impl DeltaXywhBoxCoder {
    /// Compute the deltas that regress `src_boxes` onto `target_boxes`.
    ///
    /// Both inputs are `(n, 4)` tensors in (x1, y1, x2, y2) order.
    pub fn encode(&self, src_boxes: &Tensor, target_boxes: &Tensor) -> Result<Tensor> {
        let (num_boxes, num_cols) = src_boxes.size2()?;
        ensure!(num_cols == 4, "src_boxes must have 4 columns, got {}", num_cols);
        ensure!(
            src_boxes.size() == target_boxes.size(),
            "src_boxes {:?} and target_boxes {:?} size mismatch",
            src_boxes.size(),
            target_boxes.size()
        );
        let device = src_boxes.device();

        let pw = src_boxes.i((.., 2)) - src_boxes.i((.., 0));
        let ph = src_boxes.i((.., 3)) - src_boxes.i((.., 1));
        let px = (src_boxes.i((.., 0)) + src_boxes.i((.., 2))) * 0.5;
        let py = (src_boxes.i((.., 1)) + src_boxes.i((.., 3))) * 0.5;

        let gw = target_boxes.i((.., 2)) - target_boxes.i((.., 0));
        let gh = target_boxes.i((.., 3)) - target_boxes.i((.., 1));
        let gx = (target_boxes.i((.., 0)) + target_boxes.i((.., 2))) * 0.5;
        let gy = (target_boxes.i((.., 1)) + target_boxes.i((.., 3))) * 0.5;

        let dx = (gx - px) / &pw;
        let dy = (gy - py) / &ph;
        let dw = (gw / &pw).log();
        let dh = (gh / &ph).log();

        let deltas = Tensor::stack(&[&dx, &dy, &dw, &dh], 1);
        let means = self.means_tensor(device).view([1, 4]);
        let stds = self.stds_tensor(device).view([1, 4]);
        let deltas = (deltas - means) / stds;
        debug_assert_eq!(deltas.size(), vec![num_boxes, 4]);
        Ok(deltas)
    }

    /// Apply deltas to `src_boxes`.
    ///
    /// `deltas` may have `4 * k` columns (one delta group per class); every
    /// group is decoded against the same source boxes and the output keeps
    /// the `(n, 4 * k)` layout.
    pub fn decode(
        &self,
        src_boxes: &Tensor,
        deltas: &Tensor,
        max_shape: Option<(i64, i64)>,
    ) -> Result<Tensor> {
        let (num_boxes, num_cols) = deltas.size2()?;
        ensure!(
            num_cols > 0 && num_cols % 4 == 0,
            "deltas must have 4*k columns, got {}",
            num_cols
        );
        let (src_rows, src_cols) = src_boxes.size2()?;
        ensure!(
            src_rows == num_boxes && src_cols == 4,
            "src_boxes {:?} do not match deltas {:?}",
            src_boxes.size(),
            deltas.size()
        );
        let device = src_boxes.device();

        let means = self.means_tensor(device).view([1, 1, 4]);
        let stds = self.stds_tensor(device).view([1, 1, 4]);
        let denorm = deltas.view([num_boxes, -1, 4]) * stds + means;

        let dx = denorm.i((.., .., 0));
        let dy = denorm.i((.., .., 1));
        // clamp scale deltas to avoid overflow in exp
        let wh_clip = (1000.0_f64 / 16.0).ln();
        let dw = denorm.i((.., .., 2)).clamp(-wh_clip, wh_clip);
        let dh = denorm.i((.., .., 3)).clamp(-wh_clip, wh_clip);

        let pw = (src_boxes.i((.., 2)) - src_boxes.i((.., 0))).view([num_boxes, 1]);
        let ph = (src_boxes.i((.., 3)) - src_boxes.i((.., 1))).view([num_boxes, 1]);
        let px = ((src_boxes.i((.., 0)) + src_boxes.i((.., 2))) * 0.5).view([num_boxes, 1]);
        let py = ((src_boxes.i((.., 1)) + src_boxes.i((.., 3))) * 0.5).view([num_boxes, 1]);

        let gx = &px + &pw * dx;
        let gy = &py + &ph * dy;
        let gw = pw * dw.exp();
        let gh = ph * dh.exp();

        let mut x1 = &gx - &gw * 0.5;
        let mut y1 = &gy - &gh * 0.5;
        let mut x2 = &gx + &gw * 0.5;
        let mut y2 = &gy + &gh * 0.5;

        if self.clip_border {
            if let Some((img_h, img_w)) = max_shape {
                x1 = x1.clamp(0.0, img_w as f64);
                x2 = x2.clamp(0.0, img_w as f64);
                y1 = y1.clamp(0.0, img_h as f64);
                y2 = y2.clamp(0.0, img_h as f64);
            }
        }

        let boxes = Tensor::stack(&[&x1, &y1, &x2, &y2], 2);
        Ok(boxes.view([num_boxes, num_cols]))
    }

    fn means_tensor(&self, device: Device) -> Tensor {
        Tensor::of_slice(&self.target_means).to_kind(Kind::Float).to_device(device)
    }

    fn stds_tensor(&self, device: Device) -> Tensor {
        Tensor::of_slice(&self.target_stds).to_kind(Kind::Float).to_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn encode_decode_round_trip() -> Result<()> {
        let coder = DeltaXywhBoxCoder::default();
        let rois = Tensor::of_slice(&[
            10.0_f32, 10.0, 50.0, 40.0, //
            0.0, 0.0, 20.0, 20.0, //
            30.0, 5.0, 90.0, 65.0,
        ])
        .view([3, 4]);
        let gt = Tensor::of_slice(&[
            12.0_f32, 8.0, 55.0, 42.0, //
            1.0, 2.0, 22.0, 19.0, //
            28.0, 8.0, 88.0, 60.0,
        ])
        .view([3, 4]);

        let deltas = coder.encode(&rois, &gt)?;
        let decoded = coder.decode(&rois, &deltas, None)?;

        let expect = Vec::<f32>::from(&gt);
        let actual = Vec::<f32>::from(&decoded);
        for (e, a) in izip!(expect, actual) {
            assert_abs_diff_eq!(e, a, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn decode_clips_to_image() -> Result<()> {
        let coder = DeltaXywhBoxCoder::default();
        let rois = Tensor::of_slice(&[0.0_f32, 0.0, 100.0, 100.0]).view([1, 4]);
        // a large positive dw/dh pushes the box far outside the image
        let deltas = Tensor::of_slice(&[0.0_f32, 0.0, 2.0, 2.0]).view([1, 4]);
        let decoded = coder.decode(&rois, &deltas, Some((120, 110)))?;
        let vals = Vec::<f32>::from(&decoded);
        assert!(vals[0] >= 0.0 && vals[2] <= 110.0);
        assert!(vals[1] >= 0.0 && vals[3] <= 120.0);
        Ok(())
    }

    #[test]
    fn decode_per_class_groups() -> Result<()> {
        let coder = DeltaXywhBoxCoder::default();
        let rois = Tensor::of_slice(&[10.0_f32, 10.0, 30.0, 30.0]).view([1, 4]);
        let deltas = Tensor::zeros(&[1, 8], tch::kind::FLOAT_CPU);
        let decoded = coder.decode(&rois, &deltas, None)?;
        assert_eq!(decoded.size(), vec![1, 8]);
        // zero deltas reproduce the source box for every class group
        let vals = Vec::<f32>::from(&decoded);
        assert_abs_diff_eq!(vals[0], vals[4]);
        assert_abs_diff_eq!(vals[3], vals[7]);
        Ok(())
    }
}
