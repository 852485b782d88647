// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 解码结果与输出容器
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{frame::VideoFrame, geometry::BoxCorners, tensor::OwnedTensor};

#[cfg(feature = "save_mask")]
mod save_mask;
#[cfg(feature = "save_mask")]
pub use self::save_mask::{SaveMaskError, SaveMaskOutput};

/// 输出容器的类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
  ObjectDetection,
  PoseEstimation,
  ImageClassification,
  AudioClassification,
  ImageSegmentation,
  Tensor,
}

impl std::fmt::Display for OutputKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      OutputKind::ObjectDetection => "object-detection",
      OutputKind::PoseEstimation => "pose-estimation",
      OutputKind::ImageClassification => "image-classification",
      OutputKind::AudioClassification => "audio-classification",
      OutputKind::ImageSegmentation => "image-segmentation",
      OutputKind::Tensor => "tensor",
    };
    write!(f, "{}", name)
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("输出容器类型不匹配: 期望 {expected}, 实际 {actual}")]
pub struct OutputMismatch {
  pub expected: OutputKind,
  pub actual: OutputKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keypoint {
  pub name: String,
  pub x: f32,
  pub y: f32,
  /// 置信度，0-100
  pub confidence: f32,
  pub color: u32,
}

/// 目标检测结果，四条边为区域归一化坐标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectDetection {
  pub name: String,
  /// 置信度，0-100
  pub confidence: f32,
  pub top: f32,
  pub left: f32,
  pub bottom: f32,
  pub right: f32,
  pub color: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub landmarks: Option<Vec<Keypoint>>,
}

impl ObjectDetection {
  pub fn new(name: impl Into<String>, confidence: f32, color: u32, corners: BoxCorners) -> Self {
    Self {
      name: name.into(),
      confidence,
      top: corners.top,
      left: corners.left,
      bottom: corners.bottom,
      right: corners.right,
      color,
      landmarks: None,
    }
  }

  pub fn corners(&self) -> BoxCorners {
    BoxCorners {
      top: self.top,
      left: self.left,
      bottom: self.bottom,
      right: self.right,
    }
  }

  pub fn set_corners(&mut self, corners: BoxCorners) {
    self.top = corners.top;
    self.left = corners.left;
    self.bottom = corners.bottom;
    self.right = corners.right;
  }
}

/// 骨架连线，保存两端关键点在 `keypoints` 中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeypointLink {
  pub from: usize,
  pub to: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseEstimation {
  /// 置信度，0-100
  pub confidence: f32,
  pub keypoints: Vec<Keypoint>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub links: Option<Vec<KeypointLink>>,
}

/// 图像或音频分类条目
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
  pub name: String,
  /// 置信度，0-100
  pub confidence: f32,
  pub color: u32,
}

/// 预先分配、带类型标签的输出容器
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
  ObjectDetections(Vec<ObjectDetection>),
  PoseEstimations(Vec<PoseEstimation>),
  ImageClassifications(Vec<Classification>),
  AudioClassifications(Vec<Classification>),
  VideoFrame(VideoFrame),
  Tensors(Vec<OwnedTensor>),
}

macro_rules! output_accessor {
  ($name:ident, $variant:ident, $kind:ident, $ty:ty) => {
    pub fn $name(&mut self) -> Result<&mut $ty, OutputMismatch> {
      let actual = self.kind();
      match self {
        Output::$variant(inner) => Ok(inner),
        _ => Err(OutputMismatch {
          expected: OutputKind::$kind,
          actual,
        }),
      }
    }
  };
}

impl Output {
  /// 为列表类输出创建空容器，帧与张量输出需要调用方预先分配
  pub fn empty(kind: OutputKind) -> Option<Self> {
    match kind {
      OutputKind::ObjectDetection => Some(Output::ObjectDetections(Vec::new())),
      OutputKind::PoseEstimation => Some(Output::PoseEstimations(Vec::new())),
      OutputKind::ImageClassification => Some(Output::ImageClassifications(Vec::new())),
      OutputKind::AudioClassification => Some(Output::AudioClassifications(Vec::new())),
      OutputKind::ImageSegmentation | OutputKind::Tensor => None,
    }
  }

  pub fn kind(&self) -> OutputKind {
    match self {
      Output::ObjectDetections(_) => OutputKind::ObjectDetection,
      Output::PoseEstimations(_) => OutputKind::PoseEstimation,
      Output::ImageClassifications(_) => OutputKind::ImageClassification,
      Output::AudioClassifications(_) => OutputKind::AudioClassification,
      Output::VideoFrame(_) => OutputKind::ImageSegmentation,
      Output::Tensors(_) => OutputKind::Tensor,
    }
  }

  /// 检查容器类型，在写入之前调用
  pub fn expect_kind(&self, expected: OutputKind) -> Result<(), OutputMismatch> {
    let actual = self.kind();
    if actual == expected {
      Ok(())
    } else {
      Err(OutputMismatch { expected, actual })
    }
  }

  output_accessor!(detections_mut, ObjectDetections, ObjectDetection, Vec<ObjectDetection>);
  output_accessor!(poses_mut, PoseEstimations, PoseEstimation, Vec<PoseEstimation>);
  output_accessor!(
    image_classifications_mut,
    ImageClassifications,
    ImageClassification,
    Vec<Classification>
  );
  output_accessor!(
    audio_classifications_mut,
    AudioClassifications,
    AudioClassification,
    Vec<Classification>
  );
  output_accessor!(frame_mut, VideoFrame, ImageSegmentation, VideoFrame);
  output_accessor!(tensors_mut, Tensors, Tensor, Vec<OwnedTensor>);

  /// 列表类输出的条目数量
  pub fn len(&self) -> usize {
    match self {
      Output::ObjectDetections(v) => v.len(),
      Output::PoseEstimations(v) => v.len(),
      Output::ImageClassifications(v) | Output::AudioClassifications(v) => v.len(),
      Output::VideoFrame(_) => 0,
      Output::Tensors(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 按置信度降序稳定排序
  pub fn sort_by_confidence(&mut self) {
    match self {
      Output::ObjectDetections(v) => v.sort_by(|a, b| b.confidence.total_cmp(&a.confidence)),
      Output::PoseEstimations(v) => v.sort_by(|a, b| b.confidence.total_cmp(&a.confidence)),
      Output::ImageClassifications(v) | Output::AudioClassifications(v) => {
        v.sort_by(|a, b| b.confidence.total_cmp(&a.confidence))
      }
      Output::VideoFrame(_) | Output::Tensors(_) => {}
    }
  }
}
