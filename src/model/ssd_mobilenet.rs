// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/ssd_mobilenet.rs - SSD MobileNet 直接框检测解码
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
  model::{BaseConfig, ConfigureError, Decoder, ProcessError},
  nms::push_with_suppression,
  output::{ObjectDetection, Output, OutputKind},
  params::Params,
  tensor::{Tensor, TensorType},
};

const SSD_DEFAULT_THRESHOLD: f32 = 0.70;
const SSD_NMS_THRESHOLD: f32 = 0.5;

/// 各字段所在的张量下标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SsdLayout {
  boxes: usize,
  classes: usize,
  scores: usize,
  count: usize,
}

impl SsdLayout {
  /// 根据张量数量与形状确定字段位置，并校验各张量的形状
  fn resolve(tensors: &[Tensor<'_>]) -> Option<(Self, usize)> {
    let layout = match tensors.len() {
      4 if tensors[3].rank() == 1 => SsdLayout {
        boxes: 0,
        classes: 1,
        scores: 2,
        count: 3,
      },
      4 if tensors[3].rank() == 2 => SsdLayout {
        classes: 0,
        count: 1,
        boxes: 2,
        scores: 3,
      },
      5 => SsdLayout {
        scores: 0,
        boxes: 1,
        count: 3,
        classes: 4,
      },
      _ => return None,
    };

    let boxes = &tensors[layout.boxes];
    if boxes.rank() != 3 || boxes.dim(2) != Some(4) {
      return None;
    }
    let rows = boxes.dim(1)?;
    let fits = |t: &Tensor<'_>| t.rank() == 2 && t.len() >= rows;
    if !fits(&tensors[layout.classes]) || !fits(&tensors[layout.scores]) || tensors[layout.count].len() != 1 {
      return None;
    }
    Some((layout, rows))
  }
}

/// SSD 类检测器：框坐标为归一化的 [top, left, bottom, right]
#[derive(Debug, Clone)]
pub struct SsdMobilenet {
  config: BaseConfig,
}

impl Default for SsdMobilenet {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(SSD_DEFAULT_THRESHOLD),
    }
  }
}

impl SsdMobilenet {
  pub const NAME: &'static str = "ssd-mobilenet";

  pub fn new() -> Self {
    Self::default()
  }
}

impl Decoder for SsdMobilenet {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    let float = &[TensorType::Float32];
    Caps::new(OutputKind::ObjectDetection)
      .signature(
        float,
        vec![tensor_dims![1, 10, 4], tensor_dims![1, 10], tensor_dims![1, 10], tensor_dims![1]],
      )
      .signature(
        float,
        vec![
          tensor_dims![1, 10],
          tensor_dims![1, 10, 4],
          tensor_dims![1, 10],
          tensor_dims![1],
          tensor_dims![1, 10],
        ],
      )
      .signature(
        float,
        vec![tensor_dims![1, 100], tensor_dims![1], tensor_dims![1, 100, 4], tensor_dims![1, 100]],
      )
      .signature(
        float,
        vec![tensor_dims![1, 25, 4], tensor_dims![1, 25], tensor_dims![1, 25], tensor_dims![1]],
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
    let (layout, rows) = SsdLayout::resolve(tensors).ok_or_else(|| ProcessError::unsupported(tensors))?;
    let region = params.region()?;
    let resolution = params.resolution()?;

    let boxes = &tensors[layout.boxes];
    let classes = &tensors[layout.classes];
    let scores = &tensors[layout.scores];
    let count = (tensors[layout.count].get(0)?.max(0.0) as usize).min(rows);

    let width = resolution.width as f32;
    let height = resolution.height as f32;
    let detections = output.detections_mut()?;

    for idx in 0..count {
      let score = scores.get(idx)?;
      if score < self.config.threshold {
        trace!("框 {} 置信度 {:.3} 低于阈值", idx, score);
        continue;
      }

      let corners = BoxCorners {
        top: boxes.get(idx * 4)? * height,
        left: boxes.get(idx * 4 + 1)? * width,
        bottom: boxes.get(idx * 4 + 2)? * height,
        right: boxes.get(idx * 4 + 3)? * width,
      }
      .normalize(&region);

      // 落在区域之外的框来自填充部分
      if !corners.is_normalized() {
        trace!("框 {} 超出区域: {:?}", idx, corners);
        continue;
      }

      let class = classes.get(idx)? as i32;
      let labels = &self.config.labels;
      let detection = ObjectDetection::new(labels.name(class), score * 100.0, labels.color(class), corners);
      push_with_suppression(detections, detection, SSD_NMS_THRESHOLD);
    }

    debug!("{}: {} 个候选, 输出 {} 个检测框", Self::NAME, count, detections.len());
    Ok(())
  }
}
