// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/hrnet.rs - HRNet 热力图姿态估计解码
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

use std::cmp::Ordering;

use tracing::{debug, trace};

use crate::{
  caps::{Caps, tensor_dims},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  output::{Keypoint, KeypointLink, Output, OutputKind, PoseEstimation},
  params::Params,
  settings::Connection,
  tensor::{Tensor, TensorType},
};

const HRNET_DEFAULT_THRESHOLD: f32 = 0.70;
/// 亚像素修正的步长，单位为网格单元
const SUBPIXEL_SHIFT: f32 = 0.25;

/// 热力图姿态估计，输入 `[1, H, W, K]`
#[derive(Debug, Clone)]
pub struct Hrnet {
  config: BaseConfig,
  connections: Vec<Connection>,
}

impl Default for Hrnet {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(HRNET_DEFAULT_THRESHOLD),
      connections: Vec::new(),
    }
  }
}

impl Hrnet {
  pub const NAME: &'static str = "hrnet";

  pub fn new() -> Self {
    Self::default()
  }
}

fn direction(higher: f32, lower: f32) -> f32 {
  match higher.partial_cmp(&lower) {
    Some(Ordering::Greater) => 1.0,
    Some(Ordering::Less) => -1.0,
    _ => 0.0,
  }
}

/// 热力图的一个通道
struct Heatmap<'h> {
  data: &'h [f32],
  width: usize,
  height: usize,
  channels: usize,
}

impl Heatmap<'_> {
  fn at(&self, x: usize, y: usize, channel: usize) -> f32 {
    self.data[(y * self.width + x) * self.channels + channel]
  }

  /// 线性扫描求最大值位置，相等时保留先出现的
  fn peak(&self, channel: usize) -> (usize, usize, f32) {
    let mut best = (0, 0, self.at(0, 0, channel));
    for y in 0..self.height {
      for x in 0..self.width {
        let value = self.at(x, y, channel);
        if value > best.2 {
          best = (x, y, value);
        }
      }
    }
    best
  }

  /// 按相邻单元的高低朝较高一侧偏移四分之一单元，边缘上不修正
  fn refine(&self, x: usize, y: usize, channel: usize) -> (f32, f32) {
    let dx = if x > 0 && x + 1 < self.width {
      direction(self.at(x + 1, y, channel), self.at(x - 1, y, channel))
    } else {
      0.0
    };
    let dy = if y > 0 && y + 1 < self.height {
      direction(self.at(x, y + 1, channel), self.at(x, y - 1, channel))
    } else {
      0.0
    };
    (x as f32 + dx * SUBPIXEL_SHIFT, y as f32 + dy * SUBPIXEL_SHIFT)
  }
}

impl Decoder for Hrnet {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::PoseEstimation).signature(
      &[TensorType::Float32],
      vec![tensor_dims![1, [1, 256], [1, 256], [1, 17]]],
    )
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    let settings = self.config.configure(Self::NAME, labels, settings)?;
    self.connections = settings
      .connections
      .ok_or(ConfigureError::MissingTable("connections"))?;
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::PoseEstimation)?;
    expect_tensor_count(tensors, 1, "1")?;
    let tensor = &tensors[0];
    let (height, width, channels) = match (tensor.dim(1), tensor.dim(2), tensor.dim(3)) {
      (Some(h), Some(w), Some(k))
        if tensor.rank() == 4 && tensor.dim(0) == Some(1) && h > 0 && w > 0 && k > 0 =>
      {
        (h, w, k)
      }
      _ => return Err(ProcessError::unsupported(tensors)),
    };

    let region = params.region()?;
    let resolution = params.resolution()?;
    let data = tensor.to_f32_vec();
    let required = height
      .checked_mul(width)
      .and_then(|cells| cells.checked_mul(channels));
    if required.is_none_or(|required| data.len() < required) {
      return Err(ProcessError::unsupported(tensors));
    }
    let heatmap = Heatmap {
      data: &data,
      width,
      height,
      channels,
    };

    let labels = &self.config.labels;
    let mut total = 0.0f32;
    let keypoints: Vec<Keypoint> = (0..channels)
      .map(|channel| {
        let (x, y, confidence) = heatmap.peak(channel);
        let (fx, fy) = heatmap.refine(x, y, channel);
        trace!("关键点 {}: ({}, {}) 置信度 {:.3}", channel, x, y, confidence);
        total += confidence;

        let px = fx / width as f32 * resolution.width as f32;
        let py = fy / height as f32 * resolution.height as f32;
        Keypoint {
          name: labels.name(channel as i32).to_string(),
          x: region.normalize_x(px),
          y: region.normalize_y(py),
          confidence: confidence * 100.0,
          color: labels.color(channel as i32),
        }
      })
      .collect();

    let confidence = total / channels as f32;
    if confidence < self.config.threshold {
      debug!("{}: 平均置信度 {:.3} 低于阈值", Self::NAME, confidence);
      return Ok(());
    }

    let links = self
      .connections
      .iter()
      .filter(|c| (c.id as usize) < channels && (c.connection as usize) < channels)
      .map(|c| KeypointLink {
        from: c.id as usize,
        to: c.connection as usize,
      })
      .collect();

    output.poses_mut()?.push(PoseEstimation {
      confidence: confidence * 100.0,
      keypoints,
      links: Some(links),
    });
    Ok(())
  }
}
