// 该文件是 Yeban （叶斑） 项目的一部分。
// src/selection.rs - 检测结果筛选
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{cmp::Ordering, collections::BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::{
  frame::Letterbox,
  model::{DetectItem, DetectResult, LabelSet},
};

/// 没有任何候选通过阈值时使用的标签
pub const HEALTHY_LABEL: &str = "healthy";

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MAX_DETECTIONS: usize = 300;

/// 原图坐标系下的整数边界框，端点均在图像内
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
  pub x1: u32,
  pub y1: u32,
  pub x2: u32,
  pub y2: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedDetection {
  pub class_id: u32,
  pub label: String,
  pub confidence: f32,
  pub bbox: PixelBox,
}

/// 单张图像的诊断结果：恰好一个
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
  Detected(SelectedDetection),
  Healthy,
}

/// 返回给调用方的检测条目，置信度保留两位小数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSummary {
  pub name: String,
  pub confidence: f64,
}

impl Selection {
  pub fn label(&self) -> &str {
    match self {
      Selection::Detected(detection) => &detection.label,
      Selection::Healthy => HEALTHY_LABEL,
    }
  }

  pub fn confidence(&self) -> f32 {
    match self {
      Selection::Detected(detection) => detection.confidence,
      Selection::Healthy => 1.0,
    }
  }

  pub fn is_healthy(&self) -> bool {
    matches!(self, Selection::Healthy)
  }

  /// 去重后的标签集合
  pub fn labels(&self) -> BTreeSet<String> {
    BTreeSet::from([self.label().to_string()])
  }

  pub fn summaries(&self) -> Vec<DetectionSummary> {
    vec![DetectionSummary {
      name: self.label().to_string(),
      confidence: round2(self.confidence()),
    }]
  }
}

fn round2(value: f32) -> f64 {
  (value.clamp(0.0, 1.0) as f64 * 100.0).round() / 100.0
}

/// 非极大值抑制与单结果选择
#[derive(Debug, Clone)]
pub struct DetectionSelector {
  labels: LabelSet,
  confidence_threshold: f32,
  iou_threshold: f32,
  max_detections: usize,
}

impl DetectionSelector {
  pub fn new(labels: LabelSet) -> Self {
    Self {
      labels,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      max_detections: DEFAULT_MAX_DETECTIONS,
    }
  }

  pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
    self.confidence_threshold = confidence;
    self.iou_threshold = iou;
    self
  }

  pub fn with_max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections.max(1);
    self
  }

  pub fn select(&self, result: &DetectResult, letterbox: &Letterbox) -> Selection {
    let kept = non_maximum_suppression(
      &result.items,
      self.confidence_threshold,
      self.iou_threshold,
      self.max_detections,
    );
    debug!("NMS 保留 {} / {} 个候选框", kept.len(), result.len());

    // 抑制结果按置信度降序，首个即全局最高
    let Some(best) = kept.into_iter().next() else {
      debug!("没有候选框超过阈值 {}", self.confidence_threshold);
      return Selection::Healthy;
    };

    let label = self.labels.name(best.class_id).unwrap_or("unknown").to_string();
    Selection::Detected(SelectedDetection {
      class_id: best.class_id,
      label,
      confidence: best.score,
      bbox: rescale(&best.bbox, letterbox),
    })
  }
}

/// 按类别分组的贪心 NMS，结果按置信度降序排列
pub fn non_maximum_suppression(
  items: &[DetectItem],
  confidence_threshold: f32,
  iou_threshold: f32,
  max_detections: usize,
) -> Vec<DetectItem> {
  let mut candidates: Vec<&DetectItem> = items
    .iter()
    .filter(|item| item.score > confidence_threshold)
    .collect();
  candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

  let mut suppressed = vec![false; candidates.len()];
  let mut kept = Vec::new();

  for i in 0..candidates.len() {
    if suppressed[i] {
      continue;
    }
    let best = candidates[i];
    kept.push(best.clone());
    if kept.len() >= max_detections {
      break;
    }

    for j in (i + 1)..candidates.len() {
      if !suppressed[j]
        && candidates[j].class_id == best.class_id
        && iou(&best.bbox, &candidates[j].bbox) > iou_threshold
      {
        suppressed[j] = true;
      }
    }
  }

  kept
}

/// 计算两个 xyxy 边界框的 IoU
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 推理分辨率坐标 → 原图整数坐标，裁剪到 [0, w - 1] x [0, h - 1]
fn rescale(bbox: &[f32; 4], letterbox: &Letterbox) -> PixelBox {
  let max_x = letterbox.source_width.saturating_sub(1) as f32;
  let max_y = letterbox.source_height.saturating_sub(1) as f32;
  let clamp = |v: f32, max: f32| {
    if v.is_finite() {
      v.round().clamp(0.0, max) as u32
    } else {
      0
    }
  };

  let (x1, y1) = letterbox.unmap(bbox[0], bbox[1]);
  let (x2, y2) = letterbox.unmap(bbox[2], bbox[3]);
  let (x1, x2) = (clamp(x1, max_x), clamp(x2, max_x));
  let (y1, y2) = (clamp(y1, max_y), clamp(y2, max_y));

  PixelBox {
    x1: x1.min(x2),
    y1: y1.min(y2),
    x2: x1.max(x2),
    y2: y1.max(y2),
  }
}
