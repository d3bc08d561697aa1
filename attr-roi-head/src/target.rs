use crate::{common::*, config::TrainCfg, head::AttrHead};
use getset::Getters;

/// Per-image sampler output, before validation.
#[derive(Debug, TensorLike)]
pub struct SamplingResultUnchecked {
    /// `(p, 4)` positive proposals.
    pub pos_bboxes: Tensor,
    /// `(n, 4)` negative proposals.
    pub neg_bboxes: Tensor,
    /// `(p, 4)` matched ground-truth boxes, aligned with `pos_bboxes`.
    pub pos_gt_bboxes: Tensor,
    /// `(p,)` int64 matched class labels.
    pub pos_gt_labels: Tensor,
    /// One `(p,)` int64 tensor per attribute task, in task order.
    pub pos_gt_attrs: Vec<Tensor>,
}

/// Validated per-image sampler output consumed by target assignment.
#[derive(Debug, TensorLike, Getters)]
pub struct SamplingResult {
    #[get = "pub"]
    pos_bboxes: Tensor,
    #[get = "pub"]
    neg_bboxes: Tensor,
    #[get = "pub"]
    pos_gt_bboxes: Tensor,
    #[get = "pub"]
    pos_gt_labels: Tensor,
    #[get = "pub"]
    pos_gt_attrs: Vec<Tensor>,
}

impl SamplingResult {
    pub fn num_pos(&self) -> i64 {
        self.pos_bboxes.size()[0]
    }

    pub fn num_neg(&self) -> i64 {
        self.neg_bboxes.size()[0]
    }
}

impl TryFrom<SamplingResultUnchecked> for SamplingResult {
    type Error = Error;

    fn try_from(from: SamplingResultUnchecked) -> Result<Self, Self::Error> {
        let SamplingResultUnchecked {
            pos_bboxes,
            neg_bboxes,
            pos_gt_bboxes,
            pos_gt_labels,
            pos_gt_attrs,
        } = from;

        let (num_pos, pos_cols) = pos_bboxes.size2()?;
        let (_, neg_cols) = neg_bboxes.size2()?;
        ensure!(
            pos_cols == 4 && neg_cols == 4,
            "proposals must have 4 columns"
        );
        ensure!(
            pos_gt_bboxes.size2()? == (num_pos, 4),
            "pos_gt_bboxes must align one-to-one with pos_bboxes"
        );
        ensure!(
            pos_gt_labels.size1()? == num_pos,
            "pos_gt_labels must align one-to-one with pos_bboxes"
        );
        for gt_attrs in &pos_gt_attrs {
            ensure!(
                gt_attrs.size1()? == num_pos,
                "every attribute label tensor must align one-to-one with pos_bboxes"
            );
        }

        Ok(Self {
            pos_bboxes,
            neg_bboxes,
            pos_gt_bboxes,
            pos_gt_labels,
            pos_gt_attrs,
        })
    }
}

/// Training targets for a batch of regions, positives first per image.
///
/// The positive rows of each image are carried explicitly in `pos_ranges`
/// so downstream code never re-derives them from the layout convention.
#[derive(Debug, Getters)]
pub struct RoiTargets {
    /// `(m,)` int64; background rows hold the `num_classes` sentinel.
    #[get = "pub"]
    labels: Tensor,
    /// `(m,)` float; zero excludes a region from the class loss.
    #[get = "pub"]
    label_weights: Tensor,
    /// `(m, 4)` float; zero rows for non-positive regions.
    #[get = "pub"]
    bbox_targets: Tensor,
    /// `(m, 4)` float; 1.0 rows exactly for positive regions.
    #[get = "pub"]
    bbox_weights: Tensor,
    /// One `(m,)` int64 tensor per attribute task; background rows hold the
    /// task's cardinality sentinel.
    #[get = "pub"]
    attr_labels: Vec<Tensor>,
    /// One `(m,)` float tensor per attribute task.
    #[get = "pub"]
    attr_weights: Vec<Tensor>,
    /// Positive row range of every image within the batch, in image order.
    #[get = "pub"]
    pos_ranges: Vec<Range<i64>>,
}

impl RoiTargets {
    pub fn num_samples(&self) -> i64 {
        self.labels.size()[0]
    }

    /// Concatenate per-image targets along the region axis, in image order,
    /// rebasing the positive ranges into the merged batch.
    pub fn cat(parts: Vec<RoiTargets>) -> Result<RoiTargets> {
        ensure!(!parts.is_empty(), "cannot concatenate zero target sets");
        let num_tasks = parts[0].attr_labels.len();
        ensure!(
            parts.iter().all(|part| part.attr_labels.len() == num_tasks),
            "all target sets must carry the same attribute tasks"
        );

        let mut offset = 0;
        let mut pos_ranges = vec![];
        for part in &parts {
            for range in &part.pos_ranges {
                pos_ranges.push((range.start + offset)..(range.end + offset));
            }
            offset += part.num_samples();
        }

        let labels = Tensor::cat(
            &parts.iter().map(|p| &p.labels).collect::<Vec<_>>(),
            0,
        );
        let label_weights = Tensor::cat(
            &parts.iter().map(|p| &p.label_weights).collect::<Vec<_>>(),
            0,
        );
        let bbox_targets = Tensor::cat(
            &parts.iter().map(|p| &p.bbox_targets).collect::<Vec<_>>(),
            0,
        );
        let bbox_weights = Tensor::cat(
            &parts.iter().map(|p| &p.bbox_weights).collect::<Vec<_>>(),
            0,
        );
        let attr_labels = (0..num_tasks)
            .map(|task| {
                Tensor::cat(
                    &parts.iter().map(|p| &p.attr_labels[task]).collect::<Vec<_>>(),
                    0,
                )
            })
            .collect();
        let attr_weights = (0..num_tasks)
            .map(|task| {
                Tensor::cat(
                    &parts.iter().map(|p| &p.attr_weights[task]).collect::<Vec<_>>(),
                    0,
                )
            })
            .collect();

        Ok(RoiTargets {
            labels,
            label_weights,
            bbox_targets,
            bbox_weights,
            attr_labels,
            attr_weights,
            pos_ranges,
        })
    }
}

impl AttrHead {
    /// Build training targets for one image's sampling result.
    ///
    /// Region order is positives first (in input order), then negatives.
    /// Label tensors start sentinel-filled with each task's cardinality and
    /// weights at zero; positive rows are overwritten with the matched
    /// ground truth, negative rows keep the sentinel but get weight 1.0 on
    /// every classification-style task. Output shapes are deterministic even
    /// for empty positive or negative sets.
    pub fn get_targets_single(
        &self,
        sampling_result: &SamplingResult,
        train_cfg: &TrainCfg,
    ) -> Result<RoiTargets> {
        ensure!(
            sampling_result.pos_gt_attrs().len() == self.attr_tasks.len(),
            "expected {} attribute label tensors, got {}",
            self.attr_tasks.len(),
            sampling_result.pos_gt_attrs().len()
        );
        let device = sampling_result.pos_bboxes().device();
        let num_pos = sampling_result.num_pos();
        let num_neg = sampling_result.num_neg();
        let num_samples = num_pos + num_neg;

        let labels = Tensor::full(&[num_samples], self.num_classes, (Kind::Int64, device));
        let label_weights = Tensor::zeros(&[num_samples], (Kind::Float, device));
        let attr_labels: Vec<_> = self
            .attr_tasks
            .iter()
            .map(|task| Tensor::full(&[num_samples], task.num_values, (Kind::Int64, device)))
            .collect();
        let attr_weights: Vec<_> = self
            .attr_tasks
            .iter()
            .map(|_| Tensor::zeros(&[num_samples], (Kind::Float, device)))
            .collect();
        let bbox_targets = Tensor::zeros(&[num_samples, 4], (Kind::Float, device));
        let bbox_weights = Tensor::zeros(&[num_samples, 4], (Kind::Float, device));

        if num_pos > 0 {
            let pos_weight = if train_cfg.pos_weight <= 0.0 {
                1.0
            } else {
                train_cfg.pos_weight
            };

            let _ = labels
                .narrow(0, 0, num_pos)
                .copy_(sampling_result.pos_gt_labels());
            let _ = label_weights.narrow(0, 0, num_pos).fill_(pos_weight);
            for (task_labels, task_weights, gt_attrs) in izip!(
                &attr_labels,
                &attr_weights,
                sampling_result.pos_gt_attrs()
            ) {
                let _ = task_labels.narrow(0, 0, num_pos).copy_(gt_attrs);
                let _ = task_weights.narrow(0, 0, num_pos).fill_(pos_weight);
            }

            let pos_bbox_targets = if self.reg_decoded_bbox {
                // the regression loss runs on decoded absolute boxes, so the
                // target is the ground-truth box itself
                sampling_result.pos_gt_bboxes().shallow_clone()
            } else {
                self.bbox_coder.encode(
                    sampling_result.pos_bboxes(),
                    sampling_result.pos_gt_bboxes(),
                )?
            };
            let _ = bbox_targets.narrow(0, 0, num_pos).copy_(&pos_bbox_targets);
            let _ = bbox_weights.narrow(0, 0, num_pos).fill_(1.0);
        }
        if num_neg > 0 {
            let _ = label_weights.narrow(0, num_pos, num_neg).fill_(1.0);
            for task_weights in &attr_weights {
                let _ = task_weights.narrow(0, num_pos, num_neg).fill_(1.0);
            }
        }

        Ok(RoiTargets {
            labels,
            label_weights,
            bbox_targets,
            bbox_weights,
            attr_labels,
            attr_weights,
            pos_ranges: vec![0..num_pos],
        })
    }

    /// Build targets for every image, in input order. Concatenate the result
    /// with [`RoiTargets::cat`] when a single batch tensor set is wanted.
    pub fn get_targets(
        &self,
        sampling_results: &[SamplingResult],
        train_cfg: &TrainCfg,
    ) -> Result<Vec<RoiTargets>> {
        sampling_results
            .iter()
            .map(|res| self.get_targets_single(res, train_cfg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::AttrHeadInit;

    fn head_31() -> Result<(nn::VarStore, AttrHead)> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = AttrHeadInit {
            in_channels: 8,
            roi_feat_size: 1,
            num_classes: 31,
            ..Default::default()
        }
        .build(&vs.root())?;
        Ok((vs, head))
    }

    fn sampling_result(
        num_pos: i64,
        num_neg: i64,
        labels: &[i64],
        faces: &[i64],
    ) -> Result<SamplingResult> {
        let pos_bboxes = (Tensor::rand(&[num_pos, 4], tch::kind::FLOAT_CPU) * 50.0
            + Tensor::of_slice(&[0.0_f32, 0.0, 60.0, 60.0]))
        .to_kind(Kind::Float);
        let neg_bboxes = Tensor::rand(&[num_neg, 4], tch::kind::FLOAT_CPU) * 20.0
            + Tensor::of_slice(&[100.0_f32, 100.0, 130.0, 130.0]);
        let pos_gt_bboxes = &pos_bboxes + 2.0;
        SamplingResultUnchecked {
            pos_bboxes,
            neg_bboxes,
            pos_gt_bboxes,
            pos_gt_labels: Tensor::of_slice(labels),
            pos_gt_attrs: vec![
                Tensor::of_slice(faces),
                Tensor::zeros(&[num_pos], tch::kind::INT64_CPU),
                Tensor::ones(&[num_pos], tch::kind::INT64_CPU),
            ],
        }
        .try_into()
    }

    #[test]
    fn positives_then_negatives_with_sentinels() -> Result<()> {
        let (_vs, head) = head_31()?;
        let res = sampling_result(3, 2, &[0, 0, 1], &[1, 2, 0])?;
        let targets = head.get_targets_single(&res, &TrainCfg::default())?;

        assert_eq!(Vec::<i64>::from(targets.labels()), vec![0, 0, 1, 31, 31]);
        assert_eq!(
            Vec::<i64>::from(&targets.attr_labels()[0]),
            vec![1, 2, 0, 3, 3]
        );
        assert_eq!(
            Vec::<f32>::from(targets.label_weights()),
            vec![1.0; 5]
        );
        for weights in targets.attr_weights() {
            assert_eq!(Vec::<f32>::from(weights), vec![1.0; 5]);
        }
        assert_eq!(targets.pos_ranges(), &vec![0..3]);
        Ok(())
    }

    #[test]
    fn box_weights_mark_exactly_the_positives() -> Result<()> {
        let (_vs, head) = head_31()?;
        let res = sampling_result(2, 3, &[5, 7], &[0, 1])?;
        let targets = head.get_targets_single(&res, &TrainCfg::default())?;

        let weights = Vec::<f32>::from(targets.bbox_weights());
        assert_eq!(&weights[..8], &[1.0; 8]);
        assert_eq!(&weights[8..], &[0.0; 12]);
        Ok(())
    }

    #[test]
    fn empty_positive_set_has_deterministic_shapes() -> Result<()> {
        let (_vs, head) = head_31()?;
        let res = sampling_result(0, 5, &[], &[])?;
        let targets = head.get_targets_single(&res, &TrainCfg::default())?;

        assert_eq!(targets.num_samples(), 5);
        assert_eq!(Vec::<i64>::from(targets.labels()), vec![31; 5]);
        assert_eq!(Vec::<f32>::from(targets.label_weights()), vec![1.0; 5]);
        assert_eq!(targets.bbox_targets().size(), vec![5, 4]);
        assert_eq!(targets.pos_ranges(), &vec![0..0]);
        Ok(())
    }

    #[test]
    fn pos_weight_override_applies_to_every_task() -> Result<()> {
        let (_vs, head) = head_31()?;
        let res = sampling_result(1, 1, &[3], &[2])?;
        let targets = head.get_targets_single(&res, &TrainCfg { pos_weight: 2.5 })?;

        assert_eq!(
            Vec::<f32>::from(targets.label_weights()),
            vec![2.5, 1.0]
        );
        for weights in targets.attr_weights() {
            assert_eq!(Vec::<f32>::from(weights), vec![2.5, 1.0]);
        }
        Ok(())
    }

    #[test]
    fn cat_rebases_positive_ranges() -> Result<()> {
        let (_vs, head) = head_31()?;
        let first = head.get_targets_single(
            &sampling_result(2, 1, &[0, 1], &[0, 1])?,
            &TrainCfg::default(),
        )?;
        let second = head.get_targets_single(
            &sampling_result(1, 2, &[4], &[2])?,
            &TrainCfg::default(),
        )?;

        let merged = RoiTargets::cat(vec![first, second])?;
        assert_eq!(merged.num_samples(), 6);
        assert_eq!(merged.pos_ranges(), &vec![0..2, 3..4]);
        Ok(())
    }

    #[test]
    fn misaligned_gt_labels_are_rejected() {
        let unchecked = SamplingResultUnchecked {
            pos_bboxes: Tensor::rand(&[3, 4], tch::kind::FLOAT_CPU),
            neg_bboxes: Tensor::rand(&[1, 4], tch::kind::FLOAT_CPU),
            pos_gt_bboxes: Tensor::rand(&[3, 4], tch::kind::FLOAT_CPU),
            pos_gt_labels: Tensor::of_slice(&[0_i64, 1]),
            pos_gt_attrs: vec![],
        };
        let result: Result<SamplingResult> = unchecked.try_into();
        assert!(result.is_err());
    }
}
