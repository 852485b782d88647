// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 检测解码
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

use tracing::{debug, trace};

use crate::{
  caps::{Caps, tensor_dims},
  geometry::{BoxCorners, Region},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError},
  nms::push_with_suppression,
  output::{ObjectDetection, Output, OutputKind},
  params::Params,
  tensor::{Tensor, TensorType},
};

const YOLOV8_DEFAULT_THRESHOLD: f32 = 0.70;
const YOLOV8_NMS_THRESHOLD: f32 = 0.5;

/// 输出张量的三种排布
enum Yolov8Layout<'t, 'a> {
  /// `[1, 4 + C, N]`，前 4 行为 cx, cy, w, h
  Mono { block: &'t Tensor<'a> },
  /// `[1, 4, N]` 与 `[1, C, N]`
  Dual {
    boxes: &'t Tensor<'a>,
    scores: &'t Tensor<'a>,
  },
  /// `[1, N, 4]` (left, top, right, bottom)、`[1, N]` 分数、`[1, N]` 类别
  Triple {
    boxes: &'t Tensor<'a>,
    scores: &'t Tensor<'a>,
    classes: &'t Tensor<'a>,
  },
}

impl<'t, 'a> Yolov8Layout<'t, 'a> {
  fn resolve(tensors: &'t [Tensor<'a>]) -> Option<Self> {
    let is_box_rows = |t: &Tensor<'_>| t.rank() == 3 && t.dim(1) == Some(4);
    let is_box_cols = |t: &Tensor<'_>| t.rank() == 3 && t.dim(2) == Some(4);
    match tensors {
      [block] if block.rank() == 3 && block.dim(1)? > 4 => Some(Yolov8Layout::Mono { block }),
      [a, b] => {
        let (boxes, scores) = if is_box_rows(a) { (a, b) } else { (b, a) };
        let valid = is_box_rows(boxes) && scores.rank() == 3 && scores.dim(2) == boxes.dim(2);
        valid.then_some(Yolov8Layout::Dual { boxes, scores })
      }
      [a, b, c] => {
        let (boxes, scores, classes) = if is_box_cols(a) {
          (a, b, c)
        } else if is_box_cols(b) {
          (b, a, c)
        } else {
          (c, a, b)
        };
        let n = boxes.dim(1);
        let valid = is_box_cols(boxes)
          && [scores, classes].iter().all(|t| t.rank() == 2 && t.dim(1) == n);
        valid.then_some(Yolov8Layout::Triple {
          boxes,
          scores,
          classes,
        })
      }
      _ => None,
    }
  }
}

/// YOLOv8 检测器，支持单块、双块与三块输出
#[derive(Debug, Clone)]
pub struct Yolov8 {
  config: BaseConfig,
}

impl Default for Yolov8 {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(YOLOV8_DEFAULT_THRESHOLD),
    }
  }
}

impl Yolov8 {
  pub const NAME: &'static str = "yolov8";

  pub fn new() -> Self {
    Self::default()
  }

  fn emit(&self, detections: &mut Vec<ObjectDetection>, class: i32, score: f32, corners: BoxCorners) {
    let labels = &self.config.labels;
    let detection = ObjectDetection::new(labels.name(class), score * 100.0, labels.color(class), corners);
    push_with_suppression(detections, detection, YOLOV8_NMS_THRESHOLD);
  }

  /// 按列存储的框与类别分数：元素 (行, 列) 位于 `行 × N + 列`
  fn decode_columns(
    &self,
    boxes: &Tensor<'_>,
    scores: &Tensor<'_>,
    score_row: usize,
    region: &Region,
    detections: &mut Vec<ObjectDetection>,
  ) -> Result<(), ProcessError> {
    let n = boxes.dim(2).unwrap_or(0);
    let classes = scores.dim(1).unwrap_or(0).saturating_sub(score_row);
    for idx in 0..n {
      let mut best = (0usize, scores.get(score_row * n + idx)?);
      for class in 1..classes {
        let value = scores.get((score_row + class) * n + idx)?;
        if value > best.1 {
          best = (class, value);
        }
      }

      let (class, score) = best;
      if score < self.config.threshold {
        continue;
      }

      let corners = BoxCorners::from_center(
        boxes.get(idx)?,
        boxes.get(n + idx)?,
        boxes.get(2 * n + idx)?,
        boxes.get(3 * n + idx)?,
      )
      .clamp_to(region)
      .normalize(region);
      trace!("候选 {}: 类别 {} 置信度 {:.3}", idx, class, score);
      self.emit(detections, class as i32, score, corners);
    }
    Ok(())
  }

  fn decode_triple(
    &self,
    boxes: &Tensor<'_>,
    scores: &Tensor<'_>,
    classes: &Tensor<'_>,
    region: &Region,
    detections: &mut Vec<ObjectDetection>,
  ) -> Result<(), ProcessError> {
    let n = boxes.dim(1).unwrap_or(0);
    for idx in 0..n {
      let score = scores.get(idx)?;
      if score < self.config.threshold {
        continue;
      }

      let corners = BoxCorners {
        left: boxes.get(idx * 4)?,
        top: boxes.get(idx * 4 + 1)?,
        right: boxes.get(idx * 4 + 2)?,
        bottom: boxes.get(idx * 4 + 3)?,
      }
      .normalize(region);
      if !corners.is_normalized() {
        trace!("候选 {} 超出区域: {:?}", idx, corners);
        continue;
      }
      self.emit(detections, classes.get(idx)? as i32, score, corners);
    }
    Ok(())
  }
}

impl Decoder for Yolov8 {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    let float = &[TensorType::Float32];
    Caps::new(OutputKind::ObjectDetection)
      .signature(
        float,
        vec![
          tensor_dims![1, [21, 42840], 4],
          tensor_dims![1, [21, 42840]],
          tensor_dims![1, [21, 42840]],
        ],
      )
      .signature(
        float,
        vec![tensor_dims![1, 4, [21, 42840]], tensor_dims![1, [1, 1001], [21, 42840]]],
      )
      .signature(float, vec![tensor_dims![1, [5, 1005], [21, 42840]]])
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    self.config.configure(Self::NAME, labels, settings)?;
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::ObjectDetection)?;
    let layout = Yolov8Layout::resolve(tensors).ok_or_else(|| ProcessError::unsupported(tensors))?;
    let region = params.region()?;
    let detections = output.detections_mut()?;

    match layout {
      Yolov8Layout::Mono { block } => self.decode_columns(block, block, 4, &region, detections)?,
      Yolov8Layout::Dual { boxes, scores } => {
        self.decode_columns(boxes, scores, 0, &region, detections)?
      }
      Yolov8Layout::Triple {
        boxes,
        scores,
        classes,
      } => self.decode_triple(boxes, scores, classes, &region, detections)?,
    }

    debug!("{}: 输出 {} 个检测框", Self::NAME, detections.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{geometry::Resolution, tensor::OwnedTensor};

  fn decode(tensors: &[OwnedTensor]) -> Vec<ObjectDetection> {
    let mut decoder = Yolov8::new();
    decoder
      .configure(&LabelsSource::Inline("person\ncar\ndog".to_string()), "")
      .unwrap();
    let views: Vec<_> = tensors.iter().map(OwnedTensor::view).collect();
    let params = Params::with_geometry(Region::new(0, 0, 100, 100), Resolution::new(100, 100));
    let mut output = Output::ObjectDetections(Vec::new());
    decoder.process(&views, &params, &mut output).unwrap();
    match output {
      Output::ObjectDetections(v) => v,
      _ => unreachable!(),
    }
  }

  #[test]
  fn decodes_mono_block_with_argmax() {
    // 两个候选，3 个类别：[cx, cy, w, h, c0, c1, c2] × N
    #[rustfmt::skip]
    let block = [
      50.0, 10.0,
      50.0, 10.0,
      20.0, 4.0,
      40.0, 4.0,
      0.1, 0.2,
      0.9, 0.3,
      0.9, 0.1,
    ];
    let out = decode(&[OwnedTensor::from_f32(vec![1, 7, 2], &block).unwrap()]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "car");
    assert!((out[0].left - 0.4).abs() < 1e-6);
    assert!((out[0].top - 0.3).abs() < 1e-6);
    assert!((out[0].bottom - 0.7).abs() < 1e-6);
  }

  #[test]
  fn dual_block_clamps_to_region() {
    let boxes = [95.0, 50.0, 20.0, 20.0];
    let scores = [0.1, 0.8];
    let out = decode(&[
      OwnedTensor::from_f32(vec![1, 4, 1], &boxes).unwrap(),
      OwnedTensor::from_f32(vec![1, 2, 1], &scores).unwrap(),
    ]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "car");
    assert_eq!(out[0].right, 1.0);
  }

  #[test]
  fn triple_block_drops_out_of_region_boxes() {
    let boxes = [10.0, 10.0, 50.0, 50.0, 60.0, 60.0, 120.0, 90.0];
    let out = decode(&[
      OwnedTensor::from_f32(vec![1, 2, 4], &boxes).unwrap(),
      OwnedTensor::from_f32(vec![1, 2], &[0.9, 0.9]).unwrap(),
      OwnedTensor::from_f32(vec![1, 2], &[2.0, 2.0]).unwrap(),
    ]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "dog");
    assert!((out[0].right - 0.5).abs() < 1e-6);
  }

  #[test]
  fn score_at_threshold_is_kept() {
    let boxes = [10.0, 10.0, 50.0, 50.0];
    let out = decode(&[
      OwnedTensor::from_f32(vec![1, 1, 4], &boxes).unwrap(),
      OwnedTensor::from_f32(vec![1, 1], &[YOLOV8_DEFAULT_THRESHOLD]).unwrap(),
      OwnedTensor::from_f32(vec![1, 1], &[0.0]).unwrap(),
    ]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "person");

    // 单块排布按列取最大类别分数
    #[rustfmt::skip]
    let block = [
      50.0, 50.0, 20.0, 20.0,
      0.1, YOLOV8_DEFAULT_THRESHOLD, 0.2,
    ];
    let out = decode(&[OwnedTensor::from_f32(vec![1, 7, 1], &block).unwrap()]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "car");
  }
}
