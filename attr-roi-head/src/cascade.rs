use crate::{common::*, head::AttrHead};

impl AttrHead {
    /// Decode one region set with the delta slice of each region's assigned
    /// class (no selection when class-agnostic). Labels at or beyond
    /// `num_classes`, such as the background sentinel carried by negative
    /// rows, are clamped into the last class slice.
    ///
    /// `rois` may be `(n, 4)` or `(n, 5)` with a leading image-index column,
    /// which is preserved unchanged.
    pub fn regress_by_class(
        &self,
        rois: &Tensor,
        labels: &Tensor,
        bbox_pred: &Tensor,
        img_shape: Option<(i64, i64)>,
    ) -> Result<Tensor> {
        let (num_rois, num_cols) = rois.size2()?;
        ensure!(
            num_cols == 4 || num_cols == 5,
            "rois must have 4 or 5 columns, got {}",
            num_cols
        );
        ensure!(
            labels.size1()? == num_rois,
            "labels must have one entry per region"
        );

        let bbox_pred = if self.reg_class_agnostic {
            ensure!(
                bbox_pred.size2()? == (num_rois, 4),
                "class-agnostic deltas must have 4 columns"
            );
            bbox_pred.shallow_clone()
        } else {
            // background-sentinel labels fall back to the last class slice
            // instead of indexing past the delta columns
            let base = labels.clamp(0, self.num_classes - 1) * 4;
            let gather_inds =
                Tensor::stack(&[&base, &(&base + 1), &(&base + 2), &(&base + 3)], 1);
            bbox_pred.gather(1, &gather_inds, false)
        };

        if num_cols == 4 {
            self.bbox_coder.decode(rois, &bbox_pred, img_shape)
        } else {
            let boxes = self
                .bbox_coder
                .decode(&rois.i((.., 1..)), &bbox_pred, img_shape)?;
            Ok(Tensor::cat(&[rois.i((.., 0..1)), boxes], 1))
        }
    }

    /// Refine one completed stage's regions into the next cascade stage's
    /// per-image proposals.
    ///
    /// `rois` is `(m, 5)` with the image index leading; `pos_is_gts` holds
    /// one 0/1 flag tensor per image marking positives that are themselves
    /// ground-truth boxes, which are dropped so the next stage never
    /// re-trains on a ground truth masquerading as a proposal.
    pub fn refine_bboxes(
        &self,
        rois: &Tensor,
        labels: &Tensor,
        bbox_preds: &Tensor,
        pos_is_gts: &[Tensor],
        img_shapes: &[(i64, i64)],
    ) -> Result<Vec<Tensor>> {
        let (num_rois, num_cols) = rois.size2()?;
        ensure!(num_cols == 5, "rois must have 5 columns, got {}", num_cols);
        ensure!(
            labels.size1()? == num_rois && bbox_preds.size2()?.0 == num_rois,
            "labels and bbox_preds must have one row per region"
        );
        ensure!(
            pos_is_gts.len() == img_shapes.len(),
            "pos_is_gts and img_shapes must have one entry per image"
        );
        if num_rois > 0 {
            let max_index = f64::from(rois.i((.., 0)).max()) as i64;
            ensure!(
                max_index < img_shapes.len() as i64,
                "rois reference image {} but only {} image shapes were supplied",
                max_index,
                img_shapes.len()
            );
        }
        let device = rois.device();

        let mut refined = Vec::with_capacity(img_shapes.len());
        for (image_index, (img_shape, pos_is_gt)) in izip!(img_shapes, pos_is_gts).enumerate() {
            let inds = rois
                .i((.., 0))
                .eq(image_index as i64)
                .nonzero()
                .view([-1]);
            let image_rois = rois.index_select(0, &inds).i((.., 1..));
            let image_labels = labels.index_select(0, &inds);
            let image_preds = bbox_preds.index_select(0, &inds);

            let boxes =
                self.regress_by_class(&image_rois, &image_labels, &image_preds, Some(*img_shape))?;

            // positives come first; rows flagged as ground truth are dropped
            let num_image_rois = inds.size()[0];
            let num_flags = pos_is_gt.size()[0];
            ensure!(
                num_flags <= num_image_rois,
                "more gt flags than regions for image {}",
                image_index
            );
            let keep = Tensor::ones(&[num_image_rois], (Kind::Int64, device));
            let _ = keep
                .narrow(0, 0, num_flags)
                .copy_(&(1.0 - pos_is_gt.to_kind(Kind::Float)));
            let keep_inds = keep.nonzero().view([-1]);

            refined.push(boxes.index_select(0, &keep_inds));
        }
        Ok(refined)
    }
}
