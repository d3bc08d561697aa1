use crate::common::*;
use tch_detops::batched_nms;

/// Final detections with their attribute score rows.
#[derive(Debug, TensorLike)]
pub struct MultiClassNmsOutput {
    /// `(k, 5)` boxes with a trailing score column, descending by score.
    pub dets: Tensor,
    /// `(k,)` int64 class labels, 0-based, background excluded.
    pub labels: Tensor,
    /// One row-aligned slice per attribute task, so each detection carries
    /// consistent attribute predictions.
    pub attr_scores: Vec<Tensor>,
}

/// Multi-class NMS over per-region class probabilities.
///
/// `multi_bboxes` is `(n, 4)` (shared across classes) or `(n, 4 * c)`
/// (per-class boxes); `multi_scores` is `(n, c + 1)` with the background
/// probability in the last column. Regions survive thresholding only with a
/// score strictly above `score_threshold`; an optional per-region
/// `score_factors` tensor reweights the survivors after thresholding so the
/// factor never costs recall. Suppression is grouped by class; `max_num >= 0`
/// truncates the merged, score-sorted survivor list.
pub fn multiclass_nms(
    multi_bboxes: &Tensor,
    multi_scores: &Tensor,
    attr_scores: &[Tensor],
    score_threshold: f64,
    iou_threshold: f64,
    max_num: i64,
    score_factors: Option<&Tensor>,
) -> Result<MultiClassNmsOutput> {
    let (num_rois, num_score_cols) = multi_scores.size2()?;
    ensure!(
        num_score_cols >= 2,
        "scores must hold at least one foreground class plus the background column"
    );
    let num_classes = num_score_cols - 1;
    let (num_box_rows, num_box_cols) = multi_bboxes.size2()?;
    ensure!(
        num_box_rows == num_rois,
        "boxes and scores must have the same number of rows"
    );
    ensure!(
        num_box_cols == 4 || num_box_cols == 4 * num_classes,
        "boxes must have 4 or 4*num_classes columns, got {}",
        num_box_cols
    );
    for scores in attr_scores {
        ensure!(
            scores.size2()?.0 == num_rois,
            "attribute scores must have one row per region"
        );
    }
    let device = multi_scores.device();

    // one (box, score, label) triple per (region, class) pair; the
    // background column is dropped
    let bboxes = if num_box_cols > 4 {
        multi_bboxes.view([num_rois, num_classes, 4])
    } else {
        multi_bboxes
            .view([num_rois, 1, 4])
            .expand(&[num_rois, num_classes, 4], false)
    };
    let scores = multi_scores.i((.., ..num_classes));
    let labels = Tensor::arange(num_classes, (Kind::Int64, device))
        .view([1, num_classes])
        .expand(&[num_rois, num_classes], false);

    let flat_bboxes = bboxes.reshape(&[-1, 4]);
    let flat_scores = scores.reshape(&[-1]);
    let flat_labels = labels.reshape(&[-1]);

    // threshold on raw confidence, before any score factor
    let valid_inds = flat_scores.gt(score_threshold).nonzero().view([-1]);
    if valid_inds.size()[0] == 0 {
        return Ok(MultiClassNmsOutput {
            dets: Tensor::zeros(&[0, 5], (Kind::Float, device)),
            labels: Tensor::of_slice::<i64>(&[]).to_device(device),
            attr_scores: attr_scores.iter().map(|t| t.narrow(0, 0, 0)).collect(),
        });
    }

    let sel_bboxes = flat_bboxes.index_select(0, &valid_inds);
    let mut sel_scores = flat_scores.index_select(0, &valid_inds);
    let sel_labels = flat_labels.index_select(0, &valid_inds);

    if let Some(factors) = score_factors {
        ensure!(
            factors.size1()? == num_rois,
            "score_factors must have one entry per region"
        );
        let flat_factors = factors
            .view([num_rois, 1])
            .expand(&[num_rois, num_classes], false)
            .reshape(&[-1]);
        sel_scores = sel_scores * flat_factors.index_select(0, &valid_inds);
    }

    let (dets, keep) = batched_nms(&sel_bboxes, &sel_scores, &sel_labels, iou_threshold)?;
    let (dets, keep) = if max_num >= 0 && dets.size()[0] > max_num {
        (dets.narrow(0, 0, max_num), keep.narrow(0, 0, max_num))
    } else {
        (dets, keep)
    };

    let kept_labels = sel_labels.index_select(0, &keep);
    // map kept flat indices back to their source region rows so the caller's
    // attribute tensors can be sliced consistently
    let kept_flat = valid_inds.index_select(0, &keep);
    let kept_rois: Vec<i64> = Vec::<i64>::from(&kept_flat)
        .into_iter()
        .map(|flat| flat / num_classes)
        .collect();
    let kept_rois = Tensor::of_slice(&kept_rois).to_device(device);
    let attr_out = attr_scores
        .iter()
        .map(|scores| scores.index_select(0, &kept_rois))
        .collect();

    Ok(MultiClassNmsOutput {
        dets,
        labels: kept_labels,
        attr_scores: attr_out,
    })
}
