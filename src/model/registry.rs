// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/registry.rs - 解码器注册表与 URL 构造
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

use std::{collections::BTreeMap, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  labels::LabelsSource,
  model::{ConfigureError, Decoder},
  tensor::Tensor,
};

/// 解码器构造函数
pub type DecoderConstructor = fn() -> Box<dyn Decoder>;

/// 名称到解码器构造函数的映射，按名称排序
#[derive(Clone, Default)]
pub struct DecoderRegistry {
  constructors: BTreeMap<&'static str, DecoderConstructor>,
}

impl std::fmt::Debug for DecoderRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list().entries(self.constructors.keys()).finish()
  }
}

impl DecoderRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册所有已启用特性的解码器
  pub fn with_builtin() -> Self {
    let mut registry = Self::new();
    #[cfg(feature = "model_ssd_mobilenet")]
    registry.register(|| Box::new(super::SsdMobilenet::new()));
    #[cfg(feature = "model_yolov8")]
    registry.register(|| Box::new(super::Yolov8::new()));
    #[cfg(feature = "model_yolov5")]
    registry.register(|| Box::new(super::Yolov5::new()));
    #[cfg(feature = "model_palm_detection")]
    registry.register(|| Box::new(super::AnchorDetector::palm()));
    #[cfg(feature = "model_pose_detection")]
    registry.register(|| Box::new(super::AnchorDetector::pose()));
    #[cfg(feature = "model_east_text")]
    registry.register(|| Box::new(super::EastText::new()));
    #[cfg(feature = "model_hrnet")]
    registry.register(|| Box::new(super::Hrnet::new()));
    #[cfg(feature = "model_posenet")]
    registry.register(|| Box::new(super::Posenet::new()));
    #[cfg(feature = "model_pose_landmark")]
    registry.register(|| Box::new(super::PoseLandmark::new()));
    #[cfg(feature = "model_mobilenet_softmax")]
    registry.register(|| Box::new(super::Classifier::mobilenet_softmax()));
    #[cfg(feature = "model_yamnet")]
    registry.register(|| Box::new(super::Classifier::yamnet()));
    #[cfg(feature = "model_deeplab_argmax")]
    registry.register(|| Box::new(super::DeeplabArgmax::new()));
    #[cfg(feature = "model_face_recognition")]
    registry.register(|| Box::new(super::FaceRecognition::new()));
    #[cfg(feature = "model_tensor_passthrough")]
    registry.register(|| Box::new(super::TensorPassthrough::new()));
    debug!("注册 {} 个解码器", registry.constructors.len());
    registry
  }

  /// 以解码器自身的名称注册，同名时覆盖旧的构造函数
  pub fn register(&mut self, constructor: DecoderConstructor) {
    let name = constructor().name();
    self.constructors.insert(name, constructor);
  }

  pub fn create(&self, name: &str) -> Option<Box<dyn Decoder>> {
    self.constructors.get(name).map(|constructor| constructor())
  }

  pub fn names(&self) -> Vec<&'static str> {
    self.constructors.keys().copied().collect()
  }

  /// 能力描述接受这组张量的全部解码器
  pub fn matching(&self, tensors: &[Tensor<'_>]) -> Vec<&'static str> {
    self
      .constructors
      .iter()
      .filter(|(_, constructor)| constructor().caps().matches(tensors))
      .map(|(name, _)| *name)
      .collect()
  }
}

#[derive(Error, Debug)]
pub enum DecoderBuildError {
  #[error("解码器路径错误: {0}")]
  SchemeMismatch(String),
  #[error("解码器路径缺少名称")]
  MissingName,
  #[error("未知的解码器: {0}")]
  UnknownDecoder(String),
  #[error("读取配置文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("解码器配置失败: {0}")]
  Configure(#[from] ConfigureError),
}

/// 由 `decoder://<名称>?labels=<路径>&settings=<路径>` 构造并配置解码器
#[derive(Debug, Clone)]
pub struct DecoderBuilder {
  name: String,
  labels: LabelsSource,
  settings_path: Option<PathBuf>,
  settings: Option<String>,
}

impl FromUrlWithScheme for DecoderBuilder {
  const SCHEME: &'static str = "decoder";
}

impl FromUrl for DecoderBuilder {
  type Error = DecoderBuildError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DecoderBuildError::SchemeMismatch(format!(
        "解码器路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    let name = url
      .host_str()
      .filter(|name| !name.is_empty())
      .ok_or(DecoderBuildError::MissingName)?;

    let mut builder = DecoderBuilder::new(name);
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "labels" => builder.labels = LabelsSource::File(PathBuf::from(value.as_ref())),
        "settings" => builder.settings_path = Some(PathBuf::from(value.as_ref())),
        _ => debug!("忽略未知的解码器参数: {}", key),
      }
    }
    Ok(builder)
  }
}

impl DecoderBuilder {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      labels: LabelsSource::None,
      settings_path: None,
      settings: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn labels(mut self, labels: LabelsSource) -> Self {
    self.labels = labels;
    self
  }

  /// 直接给出配置文本，优先于 URL 中的配置文件
  pub fn settings(mut self, settings: impl Into<String>) -> Self {
    self.settings = Some(settings.into());
    self
  }

  fn settings_text(&self) -> Result<String, DecoderBuildError> {
    match (&self.settings, &self.settings_path) {
      (Some(text), _) => Ok(text.clone()),
      (None, Some(path)) => std::fs::read_to_string(path).map_err(|source| DecoderBuildError::Io {
        path: path.clone(),
        source,
      }),
      (None, None) => Ok(String::new()),
    }
  }

  pub fn build(self) -> Result<Box<dyn Decoder>, DecoderBuildError> {
    self.build_with(&DecoderRegistry::with_builtin())
  }

  pub fn build_with(self, registry: &DecoderRegistry) -> Result<Box<dyn Decoder>, DecoderBuildError> {
    let mut decoder = registry
      .create(&self.name)
      .ok_or_else(|| DecoderBuildError::UnknownDecoder(self.name.clone()))?;
    let settings = self.settings_text()?;
    decoder.configure(&self.labels, &settings)?;
    info!("解码器 {} 已就绪", self.name);
    Ok(decoder)
  }
}
