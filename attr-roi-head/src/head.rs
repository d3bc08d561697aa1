use crate::{
    common::*,
    config::{default_attr_tasks, AttrTask},
};
use tch_detops::{
    CrossEntropyLoss, CrossEntropyLossInit, DeltaXywhBoxCoder, SmoothL1Loss, SmoothL1LossInit,
};

/// Attribute head initializer.
#[derive(Debug, Clone)]
pub struct AttrHeadInit {
    pub with_cls: bool,
    pub with_reg: bool,
    pub with_avg_pool: bool,
    pub attr_tasks: Vec<AttrTask>,
    pub roi_feat_size: i64,
    pub in_channels: i64,
    pub num_classes: i64,
    pub reg_class_agnostic: bool,
    /// Regress on decoded absolute boxes instead of encoded deltas.
    pub reg_decoded_bbox: bool,
    pub bbox_coder: DeltaXywhBoxCoder,
    pub smooth_l1_beta: f64,
}

impl Default for AttrHeadInit {
    fn default() -> Self {
        Self {
            with_cls: true,
            with_reg: true,
            with_avg_pool: false,
            attr_tasks: default_attr_tasks(),
            roi_feat_size: 7,
            in_channels: 256,
            num_classes: 31,
            reg_class_agnostic: false,
            reg_decoded_bbox: false,
            bbox_coder: DeltaXywhBoxCoder::default(),
            smooth_l1_beta: 1.0,
        }
    }
}

impl AttrHeadInit {
    pub fn build<'p, P>(self, path: P) -> Result<AttrHead>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            with_cls,
            with_reg,
            with_avg_pool,
            attr_tasks,
            roi_feat_size,
            in_channels,
            num_classes,
            reg_class_agnostic,
            reg_decoded_bbox,
            bbox_coder,
            smooth_l1_beta,
        } = self;

        ensure!(
            with_cls || with_reg || !attr_tasks.is_empty(),
            "at least one of the class, box and attribute branches must be enabled"
        );
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(roi_feat_size > 0, "roi_feat_size must be positive");
        ensure!(in_channels > 0, "in_channels must be positive");
        ensure!(
            attr_tasks.iter().map(|task| &task.name).all_unique(),
            "attribute task names must be unique"
        );
        for task in &attr_tasks {
            ensure!(
                task.num_values > 0,
                "attribute task '{}' must have a positive cardinality",
                task.name
            );
        }

        let feat_dim = if with_avg_pool {
            in_channels
        } else {
            in_channels * roi_feat_size * roi_feat_size
        };

        let cls_config = nn::LinearConfig {
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: 0.01,
            },
            bs_init: Some(nn::Init::Const(0.0)),
            ..Default::default()
        };
        let reg_config = nn::LinearConfig {
            ws_init: nn::Init::Randn {
                mean: 0.0,
                stdev: 0.001,
            },
            bs_init: Some(nn::Init::Const(0.0)),
            ..Default::default()
        };

        // every classification-style branch gets one extra background logit,
        // so the sentinel target label is a representable class
        let fc_cls =
            with_cls.then(|| nn::linear(path / "fc_cls", feat_dim, num_classes + 1, cls_config));
        let out_dim_reg = if reg_class_agnostic {
            4
        } else {
            4 * num_classes
        };
        let fc_reg = with_reg.then(|| nn::linear(path / "fc_reg", feat_dim, out_dim_reg, reg_config));
        let fc_attrs: Vec<_> = attr_tasks
            .iter()
            .map(|task| {
                nn::linear(
                    path / format!("fc_{}", task.name).as_str(),
                    feat_dim,
                    task.num_values + 1,
                    cls_config,
                )
            })
            .collect();

        let loss_cls = CrossEntropyLossInit::default().build()?;
        let loss_attrs: Vec<_> = attr_tasks
            .iter()
            .map(|_| CrossEntropyLossInit::default().build())
            .collect::<Result<_>>()?;
        let loss_bbox = SmoothL1LossInit {
            beta: smooth_l1_beta,
            ..Default::default()
        }
        .build()?;

        Ok(AttrHead {
            num_classes,
            attr_tasks,
            with_avg_pool,
            feat_dim,
            reg_class_agnostic,
            reg_decoded_bbox,
            bbox_coder,
            fc_cls,
            fc_reg,
            fc_attrs,
            loss_cls,
            loss_attrs,
            loss_bbox,
        })
    }
}

/// Multi-task region head: a shared pooled RoI feature feeds independent
/// affine projections for the class, box-delta and attribute branches.
#[derive(Debug)]
pub struct AttrHead {
    pub(crate) num_classes: i64,
    pub(crate) attr_tasks: Vec<AttrTask>,
    pub(crate) with_avg_pool: bool,
    pub(crate) feat_dim: i64,
    pub(crate) reg_class_agnostic: bool,
    pub(crate) reg_decoded_bbox: bool,
    pub(crate) bbox_coder: DeltaXywhBoxCoder,
    pub(crate) fc_cls: Option<nn::Linear>,
    pub(crate) fc_reg: Option<nn::Linear>,
    pub(crate) fc_attrs: Vec<nn::Linear>,
    pub(crate) loss_cls: CrossEntropyLoss,
    pub(crate) loss_attrs: Vec<CrossEntropyLoss>,
    pub(crate) loss_bbox: SmoothL1Loss,
}

/// Raw per-task head outputs; `attr_scores` is aligned with the configured
/// task list.
#[derive(Debug, TensorLike)]
pub struct AttrHeadOutput {
    pub cls_score: Option<Tensor>,
    pub bbox_pred: Option<Tensor>,
    pub attr_scores: Vec<Tensor>,
}

impl AttrHead {
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    pub fn attr_tasks(&self) -> &[AttrTask] {
        &self.attr_tasks
    }

    pub fn bbox_coder(&self) -> &DeltaXywhBoxCoder {
        &self.bbox_coder
    }

    /// Run the per-task projections over pooled region features.
    ///
    /// Accepts `(n, c, s, s)` RoI features (pooled or flattened per the
    /// configuration) or pre-flattened `(n, feat_dim)` features.
    pub fn forward(&self, features: &Tensor) -> Result<AttrHeadOutput> {
        let size = features.size();
        let feat = match size.as_slice() {
            &[_, _] => features.shallow_clone(),
            &[num_rois, _, _, _] => {
                let pooled = if self.with_avg_pool {
                    features.adaptive_avg_pool2d(&[1, 1])
                } else {
                    features.shallow_clone()
                };
                pooled.view([num_rois, -1])
            }
            shape => bail!("expected a 2-d or 4-d feature tensor, got {:?}", shape),
        };
        let (_, feat_dim) = feat.size2()?;
        ensure!(
            feat_dim == self.feat_dim,
            "expected feature dim {}, got {}",
            self.feat_dim,
            feat_dim
        );

        let cls_score = self.fc_cls.as_ref().map(|fc| feat.apply(fc));
        let bbox_pred = self.fc_reg.as_ref().map(|fc| feat.apply(fc));
        let attr_scores = self.fc_attrs.iter().map(|fc| feat.apply(fc)).collect();

        Ok(AttrHeadOutput {
            cls_score,
            bbox_pred,
            attr_scores,
        })
    }
}

/// Strip the leading image-index column from `(n, 5)` rois; `(n, 4)` rois
/// pass through.
pub(crate) fn roi_boxes(rois: &Tensor) -> Result<Tensor> {
    let (_, num_cols) = rois.size2()?;
    match num_cols {
        4 => Ok(rois.shallow_clone()),
        5 => Ok(rois.i((.., 1..))),
        _ => bail!("rois must have 4 or 5 columns, got {}", num_cols),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttrTask;

    fn tiny_init() -> AttrHeadInit {
        AttrHeadInit {
            in_channels: 8,
            roi_feat_size: 1,
            num_classes: 4,
            ..Default::default()
        }
    }

    #[test]
    fn forward_shapes_match_tasks() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = tiny_init().build(&vs.root())?;

        let feat = Tensor::randn(&[6, 8, 1, 1], tch::kind::FLOAT_CPU);
        let output = head.forward(&feat)?;

        assert_eq!(output.cls_score.as_ref().unwrap().size(), vec![6, 5]);
        assert_eq!(output.bbox_pred.as_ref().unwrap().size(), vec![6, 16]);
        // one background logit on top of each task's cardinality
        assert_eq!(output.attr_scores.len(), 3);
        assert_eq!(output.attr_scores[0].size(), vec![6, 4]);
        assert_eq!(output.attr_scores[1].size(), vec![6, 8]);
        assert_eq!(output.attr_scores[2].size(), vec![6, 3]);
        Ok(())
    }

    #[test]
    fn disabled_attr_task_produces_no_scores() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = AttrHeadInit {
            attr_tasks: vec![AttrTask::new("face", 3), AttrTask::new("colour", 7)],
            ..tiny_init()
        }
        .build(&vs.root())?;

        let feat = Tensor::randn(&[2, 8, 1, 1], tch::kind::FLOAT_CPU);
        let output = head.forward(&feat)?;
        assert_eq!(output.attr_scores.len(), 2);
        Ok(())
    }

    #[test]
    fn all_tasks_disabled_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let result = AttrHeadInit {
            with_cls: false,
            with_reg: false,
            attr_tasks: vec![],
            ..tiny_init()
        }
        .build(&vs.root());
        assert!(result.is_err());
    }

    #[test]
    fn class_agnostic_regression_is_four_wide() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = AttrHeadInit {
            reg_class_agnostic: true,
            ..tiny_init()
        }
        .build(&vs.root())?;

        let feat = Tensor::randn(&[3, 8, 1, 1], tch::kind::FLOAT_CPU);
        let output = head.forward(&feat)?;
        assert_eq!(output.bbox_pred.as_ref().unwrap().size(), vec![3, 4]);
        Ok(())
    }
}
