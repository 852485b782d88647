// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use tracing::trace;

use crate::{
  geometry::BoxCorners,
  output::{ObjectDetection, PoseEstimation},
};

/// 帧间位移修正的默认 IoU 阈值
pub const DISPLACEMENT_IOU_THRESHOLD: f32 = 0.7;

/// 候选框与已接受列表比较后的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmsVerdict {
  /// 没有冲突，直接接受
  Accept,
  /// 候选框置信度更高，剔除该下标处的已接受框后接受
  Evict(usize),
  /// 与置信度不低于自己的框冲突，丢弃候选框
  Reject,
}

/// 计算两个框的交并比
///
/// 重叠宽或高不为正时直接返回 0。
pub fn intersection_over_union(l: &BoxCorners, r: &BoxCorners) -> f32 {
  let width = l.right.min(r.right) - l.left.max(r.left);
  if width <= 0.0 {
    return 0.0;
  }

  let height = l.bottom.min(r.bottom) - l.top.max(r.top);
  if height <= 0.0 {
    return 0.0;
  }

  let intersection = width * height;
  let union = l.width() * l.height() + r.width() * r.height() - intersection;
  if union <= 0.0 {
    return 0.0;
  }

  intersection / union
}

/// 单趟贪心抑制，只与同名的已接受框比较，结果依赖列表顺序
pub fn suppress(
  candidate: &ObjectDetection,
  accepted: &[ObjectDetection],
  threshold: f32,
) -> NmsVerdict {
  let corners = candidate.corners();
  for (idx, entry) in accepted.iter().enumerate() {
    if entry.name != candidate.name {
      continue;
    }

    let score = intersection_over_union(&corners, &entry.corners());
    if score <= threshold {
      continue;
    }

    if candidate.confidence > entry.confidence {
      return NmsVerdict::Evict(idx);
    }
    return NmsVerdict::Reject;
  }

  NmsVerdict::Accept
}

/// 对候选框执行抑制并在接受时追加到列表末尾，返回是否被接受
pub fn push_with_suppression(
  accepted: &mut Vec<ObjectDetection>,
  candidate: ObjectDetection,
  threshold: f32,
) -> bool {
  match suppress(&candidate, accepted, threshold) {
    NmsVerdict::Accept => {
      accepted.push(candidate);
      true
    }
    NmsVerdict::Evict(idx) => {
      trace!(
        "剔除重叠框 {} ({:.1}), 新框置信度 {:.1}",
        accepted[idx].name, accepted[idx].confidence, candidate.confidence
      );
      accepted.remove(idx);
      accepted.push(candidate);
      true
    }
    NmsVerdict::Reject => {
      trace!("丢弃重叠框 {} ({:.1})", candidate.name, candidate.confidence);
      false
    }
  }
}

/// 姿态间的抑制：同下标关键点距离不超过 `radius` 的数量达到一半即视为同一姿态
///
/// 坐标与 `radius` 使用同一单位，通常为像素。
pub fn suppress_pose(
  candidate: &PoseEstimation,
  accepted: &[PoseEstimation],
  radius: f32,
) -> NmsVerdict {
  let limit = radius * radius;
  let half = (candidate.keypoints.len() / 2).max(1);
  for (idx, entry) in accepted.iter().enumerate() {
    let overlaps = candidate
      .keypoints
      .iter()
      .zip(&entry.keypoints)
      .filter(|(l, r)| (l.x - r.x).powi(2) + (l.y - r.y).powi(2) <= limit)
      .count();
    if overlaps < half {
      continue;
    }

    if candidate.confidence > entry.confidence {
      return NmsVerdict::Evict(idx);
    }
    return NmsVerdict::Reject;
  }

  NmsVerdict::Accept
}

/// 帧间位移修正
///
/// 新一帧中与上一帧同名框的 IoU 超过阈值时，沿用上一帧的坐标，抑制框的抖动。
#[derive(Debug, Clone)]
pub struct DisplacementFilter {
  threshold: f32,
  previous: Vec<ObjectDetection>,
}

impl Default for DisplacementFilter {
  fn default() -> Self {
    Self::new(DISPLACEMENT_IOU_THRESHOLD)
  }
}

impl DisplacementFilter {
  pub fn new(threshold: f32) -> Self {
    Self {
      threshold,
      previous: Vec::new(),
    }
  }

  pub fn apply(&mut self, detections: &mut [ObjectDetection]) {
    for detection in detections.iter_mut() {
      let corners = detection.corners();
      let matched = self.previous.iter().find(|prev| {
        prev.name == detection.name
          && intersection_over_union(&prev.corners(), &corners) > self.threshold
      });
      if let Some(prev) = matched {
        detection.set_corners(prev.corners());
      }
    }
    self.previous = detections.to_vec();
  }

  pub fn reset(&mut self) {
    self.previous.clear();
  }
}
