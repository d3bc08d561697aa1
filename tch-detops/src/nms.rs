use crate::common::*;

struct BndBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BndBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection_area_with(&self, other: &Self) -> f32 {
        let max_x1 = self.x1.max(other.x1);
        let max_y1 = self.y1.max(other.y1);
        let min_x2 = self.x2.min(other.x2);
        let min_y2 = self.y2.min(other.y2);
        let w = (min_x2 - max_x1).max(0.0);
        let h = (min_y2 - max_y1).max(0.0);
        w * h
    }

    pub fn iou_with(&self, other: &Self) -> f32 {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.area() - inter_area + 1e-8;
        inter_area / union_area
    }
}

/// Greedy IoU suppression over one group of boxes.
///
/// `boxes` is `(n, 4)` in (x1, y1, x2, y2) order, `scores` a `(n,)` float
/// tensor. Returns the kept indices sorted by descending score.
pub fn nms(boxes: &Tensor, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
    let (num_boxes, num_cols) = boxes.size2()?;
    ensure!(num_cols == 4, "boxes must have 4 columns, got {}", num_cols);
    ensure!(
        scores.size1()? == num_boxes,
        "scores length must equal the number of boxes"
    );
    ensure!(
        (0.0..=1.0).contains(&iou_threshold),
        "iou_threshold must be in [0, 1]"
    );
    let device = boxes.device();

    if num_boxes == 0 {
        return Ok(Tensor::of_slice::<i64>(&[]).to_device(device));
    }

    let score_vec = Vec::<f32>::from(&scores.contiguous());
    let bboxes: Vec<_> = izip!(
        Vec::<f32>::from(&boxes.i((.., 0)).contiguous()),
        Vec::<f32>::from(&boxes.i((.., 1)).contiguous()),
        Vec::<f32>::from(&boxes.i((.., 2)).contiguous()),
        Vec::<f32>::from(&boxes.i((.., 3)).contiguous()),
    )
    .map(|(x1, y1, x2, y2)| BndBox { x1, y1, x2, y2 })
    .collect();

    let order: Vec<usize> = (0..num_boxes as usize)
        .sorted_by(|&lhs, &rhs| {
            score_vec[rhs]
                .partial_cmp(&score_vec[lhs])
                .unwrap_or(Ordering::Equal)
        })
        .collect();

    let mut suppressed = vec![false; num_boxes as usize];
    let mut keep: Vec<i64> = vec![];

    for (rank, &li) in order.iter().enumerate() {
        if suppressed[li] {
            continue;
        }
        keep.push(li as i64);
        let lhs_bbox = &bboxes[li];

        for &ri in &order[(rank + 1)..] {
            if suppressed[ri] {
                continue;
            }
            if lhs_bbox.iou_with(&bboxes[ri]) as f64 > iou_threshold {
                suppressed[ri] = true;
            }
        }
    }

    Ok(Tensor::of_slice(&keep)
        .set_requires_grad(false)
        .to_device(device))
}

/// Label-grouped suppression: boxes only suppress each other within the same
/// label group.
///
/// Implemented with the coordinate-offset trick; each label's boxes are
/// shifted into a disjoint region so a single NMS pass never crosses groups.
/// Returns `(dets, keep)` where `dets` is a `(k, 5)` tensor of kept boxes
/// with trailing scores sorted by descending score, and `keep` the indices
/// into the input.
pub fn batched_nms(
    boxes: &Tensor,
    scores: &Tensor,
    labels: &Tensor,
    iou_threshold: f64,
) -> Result<(Tensor, Tensor)> {
    let (num_boxes, num_cols) = boxes.size2()?;
    ensure!(num_cols == 4, "boxes must have 4 columns, got {}", num_cols);
    ensure!(
        labels.size1()? == num_boxes,
        "labels length must equal the number of boxes"
    );
    let device = boxes.device();

    if num_boxes == 0 {
        let dets = Tensor::zeros(&[0, 5], (Kind::Float, device));
        let keep = Tensor::of_slice::<i64>(&[]).to_device(device);
        return Ok((dets, keep));
    }

    let max_coordinate = f64::from(boxes.max());
    let offsets = labels.to_kind(Kind::Float) * (max_coordinate + 1.0);
    let shifted = boxes + offsets.view([-1, 1]);

    let keep = nms(&shifted, scores, iou_threshold)?;
    let kept_boxes = boxes.index_select(0, &keep);
    let kept_scores = scores.index_select(0, &keep).view([-1, 1]);
    let dets = Tensor::cat(&[kept_boxes, kept_scores], 1);
    Ok((dets, keep))
}
