// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 解码器接口
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

use thiserror::Error;
use tracing::info;

use crate::{
  caps::Caps,
  geometry::Region,
  labels::{LabelTable, LabelsError, LabelsSource},
  output::{Output, OutputMismatch},
  params::{ParamError, Params},
  settings::{Settings, SettingsError},
  template::TemplateError,
  tensor::{Tensor, TensorError},
};

/// 配置阶段的错误，出现后解码器不可再使用
#[derive(Error, Debug)]
pub enum ConfigureError {
  #[error("标签解析失败: {0}")]
  Labels(#[from] LabelsError),
  #[error("配置解析失败: {0}")]
  Settings(#[from] SettingsError),
  #[error("配置缺少必需的 {0} 表")]
  MissingTable(&'static str),
  #[error("骨架配置无效: {0}")]
  InvalidSkeleton(String),
  #[error("人脸模板库加载失败: {0}")]
  Template(#[from] TemplateError),
  #[error("模板库 {index} 的名称 '{actual}' 与标签 '{expected}' 不一致")]
  TemplateName {
    index: usize,
    expected: String,
    actual: String,
  },
}

/// 处理阶段的调用约定错误
#[derive(Error, Debug)]
pub enum ProcessError {
  #[error(transparent)]
  OutputMismatch(#[from] OutputMismatch),
  #[error("张量数量不匹配: 期望 {expected}, 实际 {actual}")]
  TensorCount { expected: &'static str, actual: usize },
  #[error("张量形状不受支持: {0}")]
  UnsupportedShape(String),
  #[error("输出张量数量不匹配: 期望 {expected}, 实际 {actual}")]
  OutputTensorCount { expected: usize, actual: usize },
  #[error("输出张量 {index} 与输入不一致: 输入 {input}, 输出 {output}")]
  TensorMismatch {
    index: usize,
    input: String,
    output: String,
  },
  #[error("区域 {region:?} 超出 {width}x{height} 的张量网格")]
  RegionOutsideGrid {
    region: Region,
    width: usize,
    height: usize,
  },
  #[error("张量访问错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("参数错误: {0}")]
  Param(#[from] ParamError),
}

impl ProcessError {
  pub(crate) fn unsupported(tensors: &[Tensor<'_>]) -> Self {
    let shapes = tensors
      .iter()
      .map(|t| format!("{:?}", t.dims()))
      .collect::<Vec<_>>()
      .join(", ");
    ProcessError::UnsupportedShape(shapes)
  }
}

/// 解码器模块的统一接口
///
/// 调用方负责串行化对同一实例的访问，`process` 会更新锚点缓存等内部状态。
pub trait Decoder: Send {
  /// 注册表中使用的名称
  fn name(&self) -> &'static str;

  /// 描述可接受的张量签名与输出类型，无副作用
  fn caps(&self) -> Caps;

  /// 加载标签与 JSON 配置
  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError>;

  /// 将一次推理结果解码到预先分配的输出容器
  ///
  /// 在写入之前检查容器类型。置信度不足或几何越界的候选只会被跳过，不产生错误。
  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError>;
}

/// 多数解码器共用的标签表与阈值
#[derive(Debug, Clone)]
pub(crate) struct BaseConfig {
  pub labels: LabelTable,
  pub threshold: f32,
  default_threshold: f32,
}

impl BaseConfig {
  pub fn new(default_threshold: f32) -> Self {
    Self {
      labels: LabelTable::default(),
      threshold: default_threshold,
      default_threshold,
    }
  }

  /// 解析标签与配置，返回配置供解码器读取专有字段
  pub fn configure(
    &mut self,
    name: &str,
    labels: &LabelsSource,
    settings: &str,
  ) -> Result<Settings, ConfigureError> {
    let table = LabelTable::load(labels)?;
    let settings = Settings::parse(settings)?;
    self.labels = table;
    self.threshold = settings.threshold_or(self.default_threshold);
    info!(
      "{}: 加载 {} 个标签, 阈值 {:.2}",
      name,
      self.labels.len(),
      self.threshold
    );
    Ok(settings)
  }
}

pub(crate) fn expect_tensor_count(
  tensors: &[Tensor<'_>],
  expected: usize,
  label: &'static str,
) -> Result<(), ProcessError> {
  if tensors.len() != expected {
    tracing::error!("张量数量错误: 期望 {}, 实际 {}", label, tensors.len());
    return Err(ProcessError::TensorCount {
      expected: label,
      actual: tensors.len(),
    });
  }
  Ok(())
}

mod registry;
pub use self::registry::{DecoderBuildError, DecoderBuilder, DecoderRegistry};

#[cfg(feature = "model_ssd_mobilenet")]
mod ssd_mobilenet;
#[cfg(feature = "model_ssd_mobilenet")]
pub use self::ssd_mobilenet::SsdMobilenet;

#[cfg(feature = "model_yolov8")]
mod yolov8;
#[cfg(feature = "model_yolov8")]
pub use self::yolov8::Yolov8;

#[cfg(feature = "model_yolov5")]
mod yolov5;
#[cfg(feature = "model_yolov5")]
pub use self::yolov5::Yolov5;

#[cfg(any(feature = "model_palm_detection", feature = "model_pose_detection"))]
mod anchor_detector;
#[cfg(any(feature = "model_palm_detection", feature = "model_pose_detection"))]
pub use self::anchor_detector::{AnchorDetector, AnchorProfile, BoxMode, PALM_DETECTION, POSE_DETECTION};

#[cfg(feature = "model_east_text")]
mod east_text;
#[cfg(feature = "model_east_text")]
pub use self::east_text::EastText;

#[cfg(feature = "model_hrnet")]
mod hrnet;
#[cfg(feature = "model_hrnet")]
pub use self::hrnet::Hrnet;

#[cfg(feature = "model_posenet")]
mod posenet;
#[cfg(feature = "model_posenet")]
pub use self::posenet::Posenet;

#[cfg(feature = "model_pose_landmark")]
mod pose_landmark;
#[cfg(feature = "model_pose_landmark")]
pub use self::pose_landmark::PoseLandmark;

#[cfg(any(feature = "model_mobilenet_softmax", feature = "model_yamnet"))]
mod classifier;
#[cfg(any(feature = "model_mobilenet_softmax", feature = "model_yamnet"))]
pub use self::classifier::{Classifier, ScoreMode};

#[cfg(feature = "model_deeplab_argmax")]
mod deeplab_argmax;
#[cfg(feature = "model_deeplab_argmax")]
pub use self::deeplab_argmax::DeeplabArgmax;

#[cfg(feature = "model_face_recognition")]
mod face_recognition;
#[cfg(feature = "model_face_recognition")]
pub use self::face_recognition::FaceRecognition;

#[cfg(feature = "model_tensor_passthrough")]
mod tensor_passthrough;
#[cfg(feature = "model_tensor_passthrough")]
pub use self::tensor_passthrough::TensorPassthrough;
