use crate::{
    common::*,
    head::{roi_boxes, AttrHead, AttrHeadOutput},
    target::RoiTargets,
};
use tch_detops::accuracy;

fn positive_weight_count(weights: &Tensor) -> f64 {
    f64::from(weights.gt(0.0).to_kind(Kind::Float).sum(Kind::Float)).max(1.0)
}

impl AttrHead {
    /// Aggregate per-task losses over one concatenated region batch.
    ///
    /// Every task contributes iff its raw output is present: `loss_cls` plus
    /// a top-1 `acc` diagnostic for the class branch, one `loss_<name>` per
    /// attribute branch (no accuracy for attributes), and `loss_bbox` for
    /// the regression branch. The box loss averages over the total region
    /// count, deliberately down-weighting it relative to a per-positive
    /// average, and degenerates to a zero-valued but gradient-carrying term
    /// when no positive region exists.
    pub fn loss(
        &self,
        output: &AttrHeadOutput,
        rois: &Tensor,
        targets: &RoiTargets,
        reduction_override: Option<Reduction>,
    ) -> Result<IndexMap<String, Tensor>> {
        ensure!(
            output.attr_scores.len() == self.attr_tasks.len(),
            "expected {} attribute score tensors, got {}",
            self.attr_tasks.len(),
            output.attr_scores.len()
        );
        let mut losses = IndexMap::new();

        if let Some(cls_score) = &output.cls_score {
            if cls_score.numel() > 0 {
                let avg_factor = positive_weight_count(targets.label_weights());
                losses.insert(
                    "loss_cls".to_owned(),
                    self.loss_cls.forward(
                        cls_score,
                        targets.labels(),
                        targets.label_weights(),
                        avg_factor,
                        reduction_override,
                    )?,
                );
                losses.insert("acc".to_owned(), accuracy(cls_score, targets.labels()));
            }
        }

        for (task, loss_fn, score, task_labels, task_weights) in izip!(
            &self.attr_tasks,
            &self.loss_attrs,
            &output.attr_scores,
            targets.attr_labels(),
            targets.attr_weights()
        ) {
            if score.numel() == 0 {
                continue;
            }
            let avg_factor = positive_weight_count(task_weights);
            losses.insert(
                format!("loss_{}", task.name),
                loss_fn.forward(
                    score,
                    task_labels,
                    task_weights,
                    avg_factor,
                    reduction_override,
                )?,
            );
        }

        if let Some(bbox_pred) = &output.bbox_pred {
            let labels = targets.labels();
            // foreground rows are 0..num_classes; the sentinel row is background
            let pos_mask = labels.ge(0).logical_and(&labels.lt(self.num_classes));
            let pos_inds = pos_mask.nonzero().view([-1]);

            if pos_inds.size()[0] > 0 {
                let bbox_pred = if self.reg_decoded_bbox {
                    self.bbox_coder.decode(&roi_boxes(rois)?, bbox_pred, None)?
                } else {
                    bbox_pred.shallow_clone()
                };
                let pos_bbox_pred = if self.reg_class_agnostic {
                    bbox_pred.view([-1, 4]).index_select(0, &pos_inds)
                } else {
                    let num_rois = bbox_pred.size()[0];
                    let per_class = bbox_pred.view([num_rois, -1, 4]);
                    let gather_inds = labels
                        .clamp(0, self.num_classes - 1)
                        .view([num_rois, 1, 1])
                        .expand(&[num_rois, 1, 4], false);
                    per_class
                        .gather(1, &gather_inds, false)
                        .view([num_rois, 4])
                        .index_select(0, &pos_inds)
                };

                let pos_bbox_targets = targets.bbox_targets().index_select(0, &pos_inds);
                let pos_bbox_weights = targets.bbox_weights().index_select(0, &pos_inds);
                // average over all regions, negatives included
                let avg_factor = targets.num_samples() as f64;
                losses.insert(
                    "loss_bbox".to_owned(),
                    self.loss_bbox.forward(
                        &pos_bbox_pred,
                        &pos_bbox_targets,
                        &pos_bbox_weights,
                        avg_factor,
                        reduction_override,
                    )?,
                );
            } else {
                warn!("no positive region in batch; box loss degenerates to zero");
                // keep a zero gradient flowing to the regression branch
                losses.insert(
                    "loss_bbox".to_owned(),
                    bbox_pred.index_select(0, &pos_inds).sum(Kind::Float),
                );
            }
        }

        Ok(losses)
    }
}
