// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/east_text.rs - EAST 旋转文本框检测解码
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
  geometry::BoxCorners,
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  nms::push_with_suppression,
  output::{ObjectDetection, Output, OutputKind},
  params::Params,
  tensor::{Tensor, TensorType},
};

const EAST_DEFAULT_THRESHOLD: f32 = 0.70;
const EAST_NMS_THRESHOLD: f32 = 0.5;
/// 输出网格相对输入图像的步长
const EAST_CELL_STRIDE: f32 = 4.0;
const EAST_GEOMETRY_FIELDS: usize = 5;

/// EAST 文本检测器
///
/// 每个网格单元输出一个分数和 5 个几何量：到上、右、下、左四条边的距离与旋转角。
/// 旋转框取轴对齐包围框后参与 NMS。
#[derive(Debug, Clone)]
pub struct EastText {
  config: BaseConfig,
}

impl Default for EastText {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(EAST_DEFAULT_THRESHOLD),
    }
  }
}

impl EastText {
  pub const NAME: &'static str = "east-text";

  pub fn new() -> Self {
    Self::default()
  }
}

/// 由单元位置与几何量计算包围框，单位为输入像素
fn rotated_bounds(x: usize, y: usize, geometry: &[f32]) -> BoxCorners {
  let (x0, x1, x2, x3, angle) = (geometry[0], geometry[1], geometry[2], geometry[3], geometry[4]);
  let (sin, cos) = angle.sin_cos();
  let height = x0 + x2;
  let width = x1 + x3;

  let right = x as f32 * EAST_CELL_STRIDE + cos * x1 + sin * x2;
  let bottom = y as f32 * EAST_CELL_STRIDE - sin * x1 + cos * x2;
  BoxCorners {
    top: bottom - height,
    left: right - width,
    bottom,
    right,
  }
}

impl Decoder for EastText {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::ObjectDetection).signature(
      &[TensorType::Float32],
      vec![
        tensor_dims![1, [8, 480], [8, 480], [1, 5]],
        tensor_dims![1, [8, 480], [8, 480], [1, 5]],
      ],
    )
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
    expect_tensor_count(tensors, 2, "2")?;
    let (scores, geometry) = if tensors[0].dim(3) == Some(1) {
      (&tensors[0], &tensors[1])
    } else {
      (&tensors[1], &tensors[0])
    };

    let (rows, cols) = match (geometry.dim(1), geometry.dim(2)) {
      (Some(rows), Some(cols))
        if geometry.rank() == 4
          && geometry.dim(3) == Some(EAST_GEOMETRY_FIELDS)
          && scores.len() == rows * cols =>
      {
        (rows, cols)
      }
      _ => return Err(ProcessError::unsupported(tensors)),
    };

    let region = params.region()?;
    let geometry = geometry.to_f32_vec();
    let detections = output.detections_mut()?;
    let labels = &self.config.labels;

    for (cell, values) in geometry.chunks_exact(EAST_GEOMETRY_FIELDS).enumerate().take(rows * cols) {
      let score = scores.get(cell)?;
      if score < self.config.threshold {
        continue;
      }

      let (x, y) = (cell % cols, cell / cols);
      let corners = rotated_bounds(x, y, values).clamp_to(&region).normalize(&region);
      trace!("单元 ({}, {}): 置信度 {:.3}", x, y, score);
      let detection = ObjectDetection::new(labels.name(0), score * 100.0, labels.color(0), corners);
      push_with_suppression(detections, detection, EAST_NMS_THRESHOLD);
    }

    debug!("{}: 输出 {} 个文本框", Self::NAME, detections.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    geometry::{Region, Resolution},
    tensor::OwnedTensor,
  };

  #[test]
  fn axis_aligned_box_from_distances() {
    let b = rotated_bounds(2, 3, &[1.0, 2.0, 3.0, 4.0, 0.0]);
    assert_eq!(b.right, 10.0);
    assert_eq!(b.bottom, 15.0);
    assert_eq!(b.left, 4.0);
    assert_eq!(b.top, 11.0);
  }

  #[test]
  fn scores_are_indexed_per_cell() {
    let mut decoder = EastText::new();
    decoder
      .configure(&LabelsSource::Inline("text".to_string()), "")
      .unwrap();

    // 2×2 网格，只有第 3 个单元 (x = 1, y = 1) 的分数超过阈值
    let scores = OwnedTensor::from_f32(vec![1, 2, 2, 1], &[0.1, 0.2, 0.3, 0.9]).unwrap();
    let mut geometry = vec![0.0f32; 20];
    geometry[15..20].copy_from_slice(&[2.0, 0.0, 0.0, 4.0, 0.0]);
    let geometry = OwnedTensor::from_f32(vec![1, 2, 2, 5], &geometry).unwrap();

    let params = Params::with_geometry(Region::new(0, 0, 8, 8), Resolution::new(8, 8));
    let mut output = Output::ObjectDetections(Vec::new());
    decoder
      .process(&[geometry.view(), scores.view()], &params, &mut output)
      .unwrap();

    let Output::ObjectDetections(out) = output else {
      unreachable!()
    };
    assert_eq!(out.len(), 1);
    assert!((out[0].confidence - 90.0).abs() < 1e-4);
    // right = 4, bottom = 4, left = 0, top = 2
    assert_eq!(out[0].right, 0.5);
    assert_eq!(out[0].left, 0.0);
    assert_eq!(out[0].top, 0.25);
  }

  #[test]
  fn score_at_threshold_is_kept() {
    let mut decoder = EastText::new();
    decoder
      .configure(&LabelsSource::Inline("text".to_string()), "")
      .unwrap();

    let scores = OwnedTensor::from_f32(vec![1, 1, 1, 1], &[EAST_DEFAULT_THRESHOLD]).unwrap();
    let geometry = OwnedTensor::from_f32(vec![1, 1, 1, 5], &[1.0, 1.0, 1.0, 1.0, 0.0]).unwrap();
    let params = Params::with_geometry(Region::new(0, 0, 8, 8), Resolution::new(8, 8));
    let mut output = Output::ObjectDetections(Vec::new());
    decoder
      .process(&[geometry.view(), scores.view()], &params, &mut output)
      .unwrap();
    assert_eq!(output.len(), 1);
  }
}
