use crate::{
    common::*,
    config::{ScaleFactor, TestCfg},
    head::{roi_boxes, AttrHead},
    nms::{multiclass_nms, MultiClassNmsOutput},
};

/// A raw score tensor, or one per completed cascade stage to be averaged
/// elementwise before normalization.
#[derive(Debug)]
pub enum RawScore {
    Single(Tensor),
    Ensemble(Vec<Tensor>),
}

impl RawScore {
    fn averaged(&self) -> Result<Tensor> {
        match self {
            RawScore::Single(score) => Ok(score.shallow_clone()),
            RawScore::Ensemble(scores) => {
                ensure!(!scores.is_empty(), "score ensemble must not be empty");
                let mut sum = scores[0].shallow_clone();
                for score in &scores[1..] {
                    ensure!(
                        score.size() == sum.size(),
                        "ensemble members must share one shape"
                    );
                    sum = sum + score;
                }
                Ok(sum / scores.len() as f64)
            }
        }
    }
}

/// Decoded boxes with per-task probability tensors, before suppression.
#[derive(Debug, TensorLike)]
pub struct DecodedBboxes {
    /// `(n, 4)` or `(n, 4 * num_classes)` absolute boxes.
    pub bboxes: Tensor,
    /// `(n, num_classes + 1)` class probabilities, when the branch ran.
    pub scores: Option<Tensor>,
    /// One `(n, c_t + 1)` probability tensor per attribute task, with the
    /// background probability in the last column.
    pub attr_scores: Vec<Tensor>,
}

/// Inference output: raw decoded tensors, or final detections when a
/// post-processing config was supplied.
#[derive(Debug)]
pub enum BboxResults {
    Raw(DecodedBboxes),
    Det(MultiClassNmsOutput),
}

impl AttrHead {
    /// Turn raw head outputs for one image into absolute boxes and per-task
    /// probability distributions, optionally rescaled to original image
    /// coordinates and post-processed with multi-class NMS.
    #[allow(clippy::too_many_arguments)]
    pub fn get_bboxes(
        &self,
        rois: &Tensor,
        cls_score: Option<&RawScore>,
        bbox_pred: Option<&Tensor>,
        attr_scores: &[RawScore],
        img_shape: Option<(i64, i64)>,
        scale_factor: Option<&ScaleFactor>,
        rescale: bool,
        cfg: Option<&TestCfg>,
    ) -> Result<BboxResults> {
        ensure!(
            attr_scores.len() == self.attr_tasks.len(),
            "expected {} attribute score inputs, got {}",
            self.attr_tasks.len(),
            attr_scores.len()
        );
        let proposals = roi_boxes(rois)?;

        let scores = match cls_score {
            Some(raw) => Some(raw.averaged()?.softmax(1, Kind::Float)),
            None => None,
        };
        let attr_probs: Vec<Tensor> = attr_scores
            .iter()
            .map(|raw| Ok(raw.averaged()?.softmax(1, Kind::Float)))
            .collect::<Result<_>>()?;

        let bboxes = match bbox_pred {
            Some(pred) => self.bbox_coder.decode(&proposals, pred, img_shape)?,
            None => {
                // no regression branch: pass proposals through, clamped to
                // the image bounds
                match img_shape {
                    Some((img_h, img_w)) => {
                        let x1 = proposals.i((.., 0)).clamp(0.0, img_w as f64);
                        let y1 = proposals.i((.., 1)).clamp(0.0, img_h as f64);
                        let x2 = proposals.i((.., 2)).clamp(0.0, img_w as f64);
                        let y2 = proposals.i((.., 3)).clamp(0.0, img_h as f64);
                        Tensor::stack(&[&x1, &y1, &x2, &y2], 1)
                    }
                    None => proposals.shallow_clone(),
                }
            }
        };

        let bboxes = if rescale && bboxes.size()[0] > 0 {
            match scale_factor {
                Some(ScaleFactor::Uniform(factor)) => bboxes / factor.raw(),
                Some(ScaleFactor::PerCoord(factors)) => {
                    let factors: Vec<f32> = factors.iter().map(|f| f.raw() as f32).collect();
                    let factors = Tensor::of_slice(&factors).to_device(bboxes.device());
                    let num_rois = bboxes.size()[0];
                    (bboxes.view([num_rois, -1, 4]) / factors.view([1, 1, 4]))
                        .view([num_rois, -1])
                }
                None => bail!("rescale requested without a scale factor"),
            }
        } else {
            bboxes
        };

        match cfg {
            None => Ok(BboxResults::Raw(DecodedBboxes {
                bboxes,
                scores,
                attr_scores: attr_probs,
            })),
            Some(cfg) => {
                let scores = scores
                    .ok_or_else(|| format_err!("post-processing requires class scores"))?;
                let output = multiclass_nms(
                    &bboxes,
                    &scores,
                    &attr_probs,
                    cfg.score_threshold.raw(),
                    cfg.iou_threshold.raw(),
                    cfg.max_per_img,
                    None,
                )?;
                Ok(BboxResults::Det(output))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AttrTask, head::AttrHeadInit};
    use approx::assert_abs_diff_eq;

    fn tiny_head() -> Result<(nn::VarStore, AttrHead)> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = AttrHeadInit {
            in_channels: 8,
            roi_feat_size: 1,
            num_classes: 2,
            attr_tasks: vec![AttrTask::new("face", 3)],
            reg_class_agnostic: true,
            ..Default::default()
        }
        .build(&vs.root())?;
        Ok((vs, head))
    }

    fn rois() -> Tensor {
        Tensor::of_slice(&[
            10.0_f32, 10.0, 30.0, 30.0, //
            40.0, 40.0, 80.0, 90.0,
        ])
        .view([2, 4])
    }

    #[test]
    fn raw_path_softmaxes_each_task() -> Result<()> {
        let (_vs, head) = tiny_head()?;
        let cls_score = RawScore::Single(Tensor::zeros(&[2, 3], tch::kind::FLOAT_CPU));
        let face_score = RawScore::Single(Tensor::zeros(&[2, 4], tch::kind::FLOAT_CPU));

        let results = head.get_bboxes(
            &rois(),
            Some(&cls_score),
            None,
            &[face_score],
            Some((100, 100)),
            None,
            false,
            None,
        )?;

        let decoded = match results {
            BboxResults::Raw(decoded) => decoded,
            BboxResults::Det(_) => panic!("expected the raw path"),
        };
        // no regression branch: proposals pass through unchanged
        let boxes = Vec::<f32>::from(&decoded.bboxes);
        assert_abs_diff_eq!(boxes[0], 10.0);
        let probs = Vec::<f32>::from(&decoded.scores.unwrap());
        for p in probs {
            assert_abs_diff_eq!(p, 1.0 / 3.0, epsilon = 1e-5);
        }
        assert_eq!(decoded.attr_scores[0].size(), vec![2, 4]);
        Ok(())
    }

    #[test]
    fn ensemble_scores_are_averaged() -> Result<()> {
        let (_vs, head) = tiny_head()?;
        // stage scores that cancel to uniform logits
        let stage_a = Tensor::of_slice(&[2.0_f32, 0.0, 0.0, 0.0, 2.0, 0.0]).view([2, 3]);
        let stage_b = Tensor::of_slice(&[-2.0_f32, 0.0, 0.0, 0.0, -2.0, 0.0]).view([2, 3]);
        let cls_score = RawScore::Ensemble(vec![stage_a, stage_b]);

        let results = head.get_bboxes(
            &rois(),
            Some(&cls_score),
            None,
            &[RawScore::Single(Tensor::zeros(&[2, 4], tch::kind::FLOAT_CPU))],
            None,
            None,
            false,
            None,
        )?;

        let decoded = match results {
            BboxResults::Raw(decoded) => decoded,
            BboxResults::Det(_) => panic!("expected the raw path"),
        };
        let probs = Vec::<f32>::from(&decoded.scores.unwrap());
        for p in probs {
            assert_abs_diff_eq!(p, 1.0 / 3.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn rescale_divides_coordinates() -> Result<()> {
        let (_vs, head) = tiny_head()?;
        let results = head.get_bboxes(
            &rois(),
            None,
            None,
            &[RawScore::Single(Tensor::zeros(&[2, 4], tch::kind::FLOAT_CPU))],
            None,
            Some(&ScaleFactor::Uniform(r64(2.0))),
            true,
            None,
        )?;

        let decoded = match results {
            BboxResults::Raw(decoded) => decoded,
            BboxResults::Det(_) => panic!("expected the raw path"),
        };
        let boxes = Vec::<f32>::from(&decoded.bboxes);
        assert_abs_diff_eq!(boxes[0], 5.0);
        assert_abs_diff_eq!(boxes[2], 15.0);
        Ok(())
    }

    #[test]
    fn post_process_config_forwards_to_nms() -> Result<()> {
        let (_vs, head) = tiny_head()?;
        // confident class-0 logits for both distant regions
        let cls_score =
            RawScore::Single(Tensor::of_slice(&[5.0_f32, 0.0, 0.0, 5.0, 0.0, 0.0]).view([2, 3]));
        let results = head.get_bboxes(
            &rois(),
            Some(&cls_score),
            None,
            &[RawScore::Single(Tensor::zeros(&[2, 4], tch::kind::FLOAT_CPU))],
            Some((100, 100)),
            None,
            false,
            Some(&TestCfg::default()),
        )?;

        let detections = match results {
            BboxResults::Det(detections) => detections,
            BboxResults::Raw(_) => panic!("expected detections"),
        };
        assert_eq!(detections.dets.size(), vec![2, 5]);
        assert_eq!(Vec::<i64>::from(&detections.labels), vec![0, 0]);
        assert_eq!(detections.attr_scores[0].size(), vec![2, 4]);
        Ok(())
    }
}
