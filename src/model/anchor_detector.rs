// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/anchor_detector.rs - 锚点类检测解码
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

use tracing::{debug, error, trace};

use crate::{
  anchor::{Anchor, AnchorGrid, AnchorLevel},
  caps::{Caps, tensor_dims},
  geometry::{BoxCorners, Region},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  nms::push_with_suppression,
  output::{Keypoint, ObjectDetection, Output, OutputKind},
  params::Params,
  scoring::sigmoid,
  settings::LandmarkNames,
  tensor::{Tensor, TensorType},
};

/// 检测框的生成方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxMode {
  /// 直接使用回归的宽高，限制在区域内；关键点归一化到框内 [0, 1]
  Regressed,
  /// 以关键点包围范围为中心的正方形，边长乘以放大系数；关键点归一化到区域
  KeypointSquare(f32),
}

/// 锚点检测器的模型参数
#[derive(Debug, Clone, Copy)]
pub struct AnchorProfile {
  pub name: &'static str,
  pub levels: &'static [AnchorLevel],
  pub default_threshold: f32,
  pub nms_threshold: f32,
  pub box_mode: BoxMode,
  /// caps 中的 (锚点行数, 每行字段数)
  pub rows: u32,
  pub fields: u32,
}

const PALM_LEVELS: [AnchorLevel; 4] = [
  AnchorLevel::new(8, 2),
  AnchorLevel::new(16, 2),
  AnchorLevel::new(16, 2),
  AnchorLevel::new(16, 2),
];

const POSE_LEVELS: [AnchorLevel; 2] = [AnchorLevel::new(8, 2), AnchorLevel::new(16, 6)];

/// 手掌检测：192×192 输入，7 个关键点
pub const PALM_DETECTION: AnchorProfile = AnchorProfile {
  name: "palm-detection",
  levels: &PALM_LEVELS,
  default_threshold: 0.70,
  nms_threshold: 0.5,
  box_mode: BoxMode::Regressed,
  rows: 2016,
  fields: 18,
};

/// MediaPipe 人体检测：128×128 输入，4 个关键点
pub const POSE_DETECTION: AnchorProfile = AnchorProfile {
  name: "mediapipe-pose",
  levels: &POSE_LEVELS,
  default_threshold: 0.75,
  nms_threshold: 0.3,
  box_mode: BoxMode::KeypointSquare(1.5),
  rows: 896,
  fields: 12,
};

/// 基于锚点的检测器，分数经 sigmoid 转换为置信度
#[derive(Debug, Clone)]
pub struct AnchorDetector {
  profile: AnchorProfile,
  config: BaseConfig,
  grid: AnchorGrid,
  landmark_names: Option<LandmarkNames>,
}

impl AnchorDetector {
  pub fn new(profile: AnchorProfile) -> Self {
    Self {
      profile,
      config: BaseConfig::new(profile.default_threshold),
      grid: AnchorGrid::new(profile.levels),
      landmark_names: None,
    }
  }

  pub fn palm() -> Self {
    Self::new(PALM_DETECTION)
  }

  pub fn pose() -> Self {
    Self::new(POSE_DETECTION)
  }

  fn landmark_name(&self, index: usize) -> String {
    match self.profile.box_mode {
      BoxMode::Regressed => self
        .landmark_names
        .as_ref()
        .and_then(|names| names.name(index as u32))
        .map_or_else(|| format!("landmark_{}", index), str::to_string),
      BoxMode::KeypointSquare(_) => format!("keypoint_{}", index),
    }
  }

  /// 解码一个锚点，返回像素坐标的框与关键点
  fn decode_anchor(
    &self,
    values: &[f32],
    anchor: Anchor,
    region: &Region,
  ) -> (BoxCorners, Vec<(f32, f32)>) {
    let points: Vec<(f32, f32)> = values[4..]
      .chunks_exact(2)
      .map(|p| (anchor.cx + p[0], anchor.cy + p[1]))
      .collect();

    let cx = anchor.cx + values[0];
    let cy = anchor.cy + values[1];
    let (width, height) = (values[2], values[3]);
    let regressed = BoxCorners::from_center(cx, cy, width, height);

    match self.profile.box_mode {
      BoxMode::Regressed => {
        let points = points
          .into_iter()
          .map(|(x, y)| {
            let x = (x - regressed.left) / width;
            let y = (y - regressed.top) / height;
            (x.clamp(0.0, 1.0), y.clamp(0.0, 1.0))
          })
          .collect();
        (regressed.clamp_to(region), points)
      }
      BoxMode::KeypointSquare(scale) => {
        let (mut cx, mut cy, mut width, mut height) = (cx, cy, width, height);
        if !points.is_empty() {
          let xs = points.iter().map(|p| p.0);
          let ys = points.iter().map(|p| p.1);
          let min_x = xs.clone().fold(f32::INFINITY, f32::min);
          let max_x = xs.fold(f32::NEG_INFINITY, f32::max);
          let min_y = ys.clone().fold(f32::INFINITY, f32::min);
          let max_y = ys.fold(f32::NEG_INFINITY, f32::max);
          width = width.max(max_x - min_x);
          height = height.max(max_y - min_y);
          cx = (min_x + max_x) * 0.5;
          cy = (min_y + max_y) * 0.5;
        }
        let size = width.max(height) * scale;
        let points = points
          .into_iter()
          .map(|(x, y)| (region.normalize_x(x), region.normalize_y(y)))
          .collect();
        (BoxCorners::from_center(cx, cy, size, size), points)
      }
    }
  }
}

impl Decoder for AnchorDetector {
  fn name(&self) -> &'static str {
    self.profile.name
  }

  fn caps(&self) -> Caps {
    let AnchorProfile { rows, fields, .. } = self.profile;
    Caps::new(OutputKind::ObjectDetection).signature(
      &[TensorType::Float32],
      vec![tensor_dims![1, rows, fields], tensor_dims![1, rows, 1]],
    )
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    let settings = self.config.configure(self.profile.name, labels, settings)?;
    self.landmark_names = settings.landmark_names(0).cloned();
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::ObjectDetection)?;
    expect_tensor_count(tensors, 2, "2")?;
    let (boxes, scores) = if tensors[0].dim(2) >= Some(4) {
      (&tensors[0], &tensors[1])
    } else {
      (&tensors[1], &tensors[0])
    };
    let fields = boxes.dim(2).unwrap_or(0);
    let rows = boxes.dim(1).unwrap_or(0);
    if boxes.rank() != 3 || fields < 4 || scores.len() < rows {
      return Err(ProcessError::unsupported(tensors));
    }

    let region = params.region()?;
    let resolution = params.resolution()?;
    let anchors = self.grid.anchors(resolution).to_vec();
    if anchors.len() != rows {
      error!(
        "{}: 锚点数量 {} 与张量行数 {} 不一致",
        self.profile.name,
        anchors.len(),
        rows
      );
      return Err(ProcessError::unsupported(tensors));
    }

    let detections = output.detections_mut()?;
    let data = boxes.to_f32_vec();
    let labels = &self.config.labels;
    for (idx, (&anchor, values)) in anchors.iter().zip(data.chunks_exact(fields)).enumerate() {
      let confidence = sigmoid(scores.get(idx)?);
      if confidence < self.config.threshold {
        continue;
      }

      let (corners, points) = self.decode_anchor(values, anchor, &region);
      let mut detection = ObjectDetection::new(
        labels.name(0),
        confidence * 100.0,
        labels.color(0),
        corners.normalize(&region),
      );
      let landmarks = points
        .into_iter()
        .enumerate()
        .map(|(num, (x, y))| Keypoint {
          name: self.landmark_name(num),
          x,
          y,
          confidence: confidence * 100.0,
          color: labels.color(0),
        })
        .collect();
      detection.landmarks = Some(landmarks);
      trace!("锚点 {}: 置信度 {:.3}", idx, confidence);
      push_with_suppression(detections, detection, self.profile.nms_threshold);
    }

    debug!("{}: 输出 {} 个检测框", self.profile.name, detections.len());
    Ok(())
  }
}
