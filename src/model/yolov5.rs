// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolov5.rs - YOLOv5 检测结果解码
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
  caps::{Caps, tensor_dims},
  geometry::{BoxCorners, Region, Resolution},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError},
  nms::push_with_suppression,
  output::{ObjectDetection, Output, OutputKind},
  params::Params,
  scoring::{argmax_first, sigmoid},
  tensor::{Tensor, TensorError, TensorType},
};

const YOLOV5_DEFAULT_THRESHOLD: f32 = 0.70;
const YOLOV5_NMS_THRESHOLD: f32 = 0.5;
/// 候选字段：cx, cy, w, h, 目标分数，之后为各类别分数
const OBJECT_SCORE_FIELD: usize = 4;
const CLASS_FIELD: usize = 5;
const ANCHORS_PER_CELL: usize = 3;
/// 三个输出层的步长
const STRIDES: [u32; 3] = [8, 16, 32];
/// 各层锚框的宽高，单位为像素
const ANCHORS: [[(f32, f32); ANCHORS_PER_CELL]; 3] = [
  [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
  [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
  [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridLayout {
  /// `[1, H, W, 3 × L]`，同一单元的三个锚框相邻
  Interleaved,
  /// `[1, 3, H, W, L]`，按锚框分块
  Planar,
}

/// 三块输出中的一层网格
struct GridLevel<'t, 'a> {
  tensor: &'t Tensor<'a>,
  layout: GridLayout,
  height: usize,
  width: usize,
  fields: usize,
}

impl<'t, 'a> GridLevel<'t, 'a> {
  fn resolve(tensor: &'t Tensor<'a>) -> Option<Self> {
    if tensor.dim(0) != Some(1) {
      return None;
    }
    let (layout, height, width, fields) = match tensor.rank() {
      4 if tensor.dim(3)? % ANCHORS_PER_CELL == 0 => (
        GridLayout::Interleaved,
        tensor.dim(1)?,
        tensor.dim(2)?,
        tensor.dim(3)? / ANCHORS_PER_CELL,
      ),
      5 if tensor.dim(1) == Some(ANCHORS_PER_CELL) => {
        (GridLayout::Planar, tensor.dim(2)?, tensor.dim(3)?, tensor.dim(4)?)
      }
      _ => return None,
    };
    (height > 0 && width > 0 && fields > CLASS_FIELD).then_some(Self {
      tensor,
      layout,
      height,
      width,
      fields,
    })
  }

  /// 候选 `(x, y, anchor)` 首个字段的下标
  fn offset(&self, x: usize, y: usize, anchor: usize) -> usize {
    match self.layout {
      GridLayout::Interleaved => ((y * self.width + x) * ANCHORS_PER_CELL + anchor) * self.fields,
      GridLayout::Planar => ((anchor * self.height + y) * self.width + x) * self.fields,
    }
  }

  /// 由输入宽度与网格宽度推出步长，返回锚框表的层号与步长
  fn scale(&self, resolution: Resolution) -> Option<(usize, f32)> {
    let stride = resolution.width / self.width as u32;
    let level = STRIDES.iter().position(|&s| s == stride)?;
    Some((level, stride as f32))
  }
}

/// YOLOv5 检测器，支持单块 `[1, N, L]` 与三层网格输出
#[derive(Debug, Clone)]
pub struct Yolov5 {
  config: BaseConfig,
}

impl Default for Yolov5 {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(YOLOV5_DEFAULT_THRESHOLD),
    }
  }
}

impl Yolov5 {
  pub const NAME: &'static str = "yolov5";

  pub fn new() -> Self {
    Self::default()
  }

  fn emit(
    &self,
    detections: &mut Vec<ObjectDetection>,
    class: usize,
    confidence: f32,
    corners: BoxCorners,
  ) {
    let labels = &self.config.labels;
    let class = class as i32;
    let detection = ObjectDetection::new(
      labels.name(class),
      confidence * 100.0,
      labels.color(class),
      corners,
    );
    push_with_suppression(detections, detection, YOLOV5_NMS_THRESHOLD);
  }

  /// 单块输出：坐标为相对输入分辨率的比例，分数已归一化
  fn decode_rows(
    &self,
    block: &Tensor<'_>,
    resolution: Resolution,
    region: &Region,
    detections: &mut Vec<ObjectDetection>,
  ) {
    let fields = block.dim(2).unwrap_or(0);
    let values = block.to_f32_vec();
    let (rw, rh) = (resolution.width as f32, resolution.height as f32);
    let threshold = self.config.threshold;

    for (idx, row) in values.chunks_exact(fields).enumerate() {
      let score = row[OBJECT_SCORE_FIELD];
      if score < threshold {
        continue;
      }
      let Some((class, class_score)) = argmax_first(&row[CLASS_FIELD..]) else {
        continue;
      };
      let confidence = class_score * score;
      if confidence < threshold {
        continue;
      }

      let corners = BoxCorners::from_center(row[0] * rw, row[1] * rh, row[2] * rw, row[3] * rh)
        .clamp_to(region)
        .normalize(region);
      trace!("候选 {}: 类别 {} 置信度 {:.3}", idx, class, confidence);
      self.emit(detections, class, confidence, corners);
    }
  }

  /// 网格输出：所有字段均为 logit，框相对网格单元与锚框回归
  fn decode_grid(
    &self,
    level: &GridLevel<'_, '_>,
    (scale, stride): (usize, f32),
    region: &Region,
    detections: &mut Vec<ObjectDetection>,
  ) -> Result<(), ProcessError> {
    let values = level.tensor.to_f32_vec();
    let threshold = self.config.threshold;

    for y in 0..level.height {
      for x in 0..level.width {
        for (anchor, &(anchor_w, anchor_h)) in ANCHORS[scale].iter().enumerate() {
          let base = level.offset(x, y, anchor);
          let row = values
            .get(base..base + level.fields)
            .ok_or(TensorError::OutOfBounds {
              index: base + level.fields - 1,
              len: values.len(),
            })?;
          let Some((class, class_score)) = argmax_first(&row[CLASS_FIELD..]) else {
            continue;
          };
          let confidence = sigmoid(class_score) * sigmoid(row[OBJECT_SCORE_FIELD]);
          if confidence < threshold {
            continue;
          }

          let [bx, by, bw, bh] = [row[0], row[1], row[2], row[3]].map(sigmoid);
          let cx = (bx * 2.0 - 0.5 + x as f32) * stride;
          let cy = (by * 2.0 - 0.5 + y as f32) * stride;
          let width = (bw * 2.0).powi(2) * anchor_w;
          let height = (bh * 2.0).powi(2) * anchor_h;
          let corners = BoxCorners::from_center(cx, cy, width, height)
            .clamp_to(region)
            .normalize(region);
          trace!(
            "步长 {} 单元 ({}, {}) 锚框 {}: 类别 {} 置信度 {:.3}",
            stride, x, y, anchor, class, confidence
          );
          self.emit(detections, class, confidence, corners);
        }
      }
    }
    Ok(())
  }
}

impl Decoder for Yolov5 {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    let float = &[TensorType::Float32];
    let interleaved = || tensor_dims![1, [1, 136], [1, 136], [18, 3018]];
    let planar = || tensor_dims![1, 3, [1, 136], [1, 136], [6, 85]];
    Caps::new(OutputKind::ObjectDetection)
      .signature(float, vec![interleaved(), interleaved(), interleaved()])
      .signature(float, vec![planar(), planar(), planar()])
      .signature(float, vec![tensor_dims![1, [21, 72828], [6, 85]]])
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
    let region = params.region()?;
    let resolution = params.resolution()?;

    match tensors {
      [block]
        if block.rank() == 3
          && block.dim(0) == Some(1)
          && block.dim(2).is_some_and(|fields| fields > CLASS_FIELD) =>
      {
        let detections = output.detections_mut()?;
        self.decode_rows(block, resolution, &region, detections);
      }
      [_, _, _] => {
        let levels = tensors
          .iter()
          .map(GridLevel::resolve)
          .collect::<Option<Vec<_>>>()
          .ok_or_else(|| ProcessError::unsupported(tensors))?;
        // 先确认每层的步长都有对应锚框，再开始写入
        let scales = levels
          .iter()
          .map(|level| level.scale(resolution))
          .collect::<Option<Vec<_>>>()
          .ok_or_else(|| {
            error!("{}: 网格宽度与输入宽度 {} 推不出已知步长", Self::NAME, resolution.width);
            ProcessError::unsupported(tensors)
          })?;

        let detections = output.detections_mut()?;
        for (level, scale) in levels.iter().zip(scales) {
          self.decode_grid(level, scale, &region, detections)?;
        }
      }
      _ => return Err(ProcessError::unsupported(tensors)),
    }

    debug!("{}: 输出 {} 个检测框", Self::NAME, output.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::OwnedTensor;

  fn decoder(settings: &str) -> Yolov5 {
    let mut decoder = Yolov5::new();
    decoder
      .configure(&LabelsSource::Inline("person\ncar\ndog".to_string()), settings)
      .unwrap();
    decoder
  }

  fn decode(
    decoder: &mut Yolov5,
    tensors: &[OwnedTensor],
    size: u32,
  ) -> Result<Vec<ObjectDetection>, ProcessError> {
    let views: Vec<_> = tensors.iter().map(OwnedTensor::view).collect();
    let resolution = Resolution::new(size, size);
    let params = Params::with_geometry(Region::full(resolution), resolution);
    let mut output = Output::ObjectDetections(Vec::new());
    decoder.process(&views, &params, &mut output)?;
    match output {
      Output::ObjectDetections(v) => Ok(v),
      _ => unreachable!(),
    }
  }

  #[test]
  fn mono_block_scales_by_object_score() {
    #[rustfmt::skip]
    let rows = [
      0.5, 0.5, 0.2, 0.4, 0.9, 0.1, 0.9, 0.2,
      0.5, 0.5, 0.2, 0.4, 0.9, 0.5, 0.5, 0.5,
    ];
    let block = OwnedTensor::from_f32(vec![1, 2, 8], &rows).unwrap();
    let out = decode(&mut decoder(""), &[block], 100).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "car");
    assert!((out[0].confidence - 81.0).abs() < 1e-3);
    assert!((out[0].left - 0.4).abs() < 1e-6);
    assert!((out[0].bottom - 0.7).abs() < 1e-6);
  }

  #[test]
  fn score_at_threshold_is_kept() {
    let rows = [0.5, 0.5, 0.2, 0.2, 1.0, 0.5, 0.0, 0.0];
    let block = OwnedTensor::from_f32(vec![1, 1, 8], &rows).unwrap();
    let out = decode(&mut decoder(r#"{"confidence": 50}"#), &[block], 100).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "person");
  }

  #[test]
  fn grid_levels_use_stride_anchors() {
    // 输入 64×64：步长 8、16、32 对应 8×8、4×4、2×2 网格，每个候选 6 个字段
    let mut fine = vec![0.0f32; 8 * 8 * 18];
    // 交错排布，单元 (2, 1) 的第 3 个锚框 (33 × 23)
    let base = ((8 + 2) * 3 + 2) * 6;
    fine[base..base + 6].copy_from_slice(&[0.0, 0.0, 0.0, 0.0, 4.0, 4.0]);
    let mid = vec![0.0f32; 4 * 4 * 18];
    let mut coarse = vec![0.0f32; 3 * 2 * 2 * 6];
    // 分块排布，锚框 1 (156 × 198) 的单元 (1, 0)
    let base = (2 * 2 + 1) * 6;
    coarse[base..base + 6].copy_from_slice(&[0.0, 0.0, -2.0, -2.0, 4.0, 4.0]);

    let tensors = [
      OwnedTensor::from_f32(vec![1, 8, 8, 18], &fine).unwrap(),
      OwnedTensor::from_f32(vec![1, 4, 4, 18], &mid).unwrap(),
      OwnedTensor::from_f32(vec![1, 3, 2, 2, 6], &coarse).unwrap(),
    ];
    let out = decode(&mut decoder(""), &tensors, 64).unwrap();
    assert_eq!(out.len(), 2);

    let expected = sigmoid(4.0) * sigmoid(4.0) * 100.0;
    assert!(out.iter().all(|d| (d.confidence - expected).abs() < 1e-3));

    // 中心 (20, 12)，宽高 33 × 23
    assert!((out[0].left - 3.5 / 64.0).abs() < 1e-5);
    assert!((out[0].bottom - 23.5 / 64.0).abs() < 1e-5);

    // 中心 (48, 16)，宽度 (2σ(-2))² × 156
    let width = (2.0 * sigmoid(-2.0)).powi(2) * 156.0;
    assert!((out[1].right - (48.0 + width / 2.0) / 64.0).abs() < 1e-5);
  }

  #[test]
  fn unknown_stride_is_rejected() {
    let tensors = [
      OwnedTensor::from_f32(vec![1, 8, 8, 18], &[0.0; 8 * 8 * 18]).unwrap(),
      OwnedTensor::from_f32(vec![1, 4, 4, 18], &[0.0; 4 * 4 * 18]).unwrap(),
      OwnedTensor::from_f32(vec![1, 2, 2, 18], &[0.0; 2 * 2 * 18]).unwrap(),
    ];
    assert!(matches!(
      decode(&mut decoder(""), &tensors, 100),
      Err(ProcessError::UnsupportedShape(_))
    ));
  }
}
