use crate::common::*;
use serde::{Deserialize, Serialize};

/// Declarative descriptor for one categorical attribute branch.
///
/// Attribute branches are configured as a list of descriptors and iterated
/// uniformly by the head, the target assigner and the loss aggregator;
/// disabling an attribute means leaving it out of the list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrTask {
    pub name: String,
    /// Number of foreground values; the background sentinel in targets
    /// equals this count.
    pub num_values: i64,
}

impl AttrTask {
    pub fn new(name: impl Into<String>, num_values: i64) -> Self {
        Self {
            name: name.into(),
            num_values,
        }
    }
}

/// The face/colour/motion attribute set.
pub fn default_attr_tasks() -> Vec<AttrTask> {
    vec![
        AttrTask::new("face", 3),
        AttrTask::new("colour", 7),
        AttrTask::new("motion", 2),
    ]
}

/// Training-time target assignment options, passed by value at each call
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainCfg {
    /// Weight applied to every classification-style task on positive
    /// regions; non-positive means 1.0.
    pub pos_weight: f64,
}

impl Default for TrainCfg {
    fn default() -> Self {
        Self { pos_weight: -1.0 }
    }
}

/// Inference post-processing options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestCfg {
    /// Detections must score strictly above this to enter suppression.
    pub score_threshold: R64,
    pub iou_threshold: R64,
    /// Cap on returned detections; negative means unlimited.
    pub max_per_img: i64,
}

impl Default for TestCfg {
    fn default() -> Self {
        Self {
            score_threshold: r64(0.05),
            iou_threshold: r64(0.5),
            max_per_img: 100,
        }
    }
}

/// Divisor mapping resized-image coordinates back to the original image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScaleFactor {
    Uniform(R64),
    /// One divisor per (x1, y1, x2, y2) coordinate.
    PerCoord([R64; 4]),
}
