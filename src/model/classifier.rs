// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/classifier.rs - softmax 与直接置信度分类解码
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
  caps::{Caps, Dim},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  output::{Classification, Output, OutputKind},
  params::Params,
  scoring::softmax,
  tensor::{Tensor, TensorType},
};

const CLASSIFIER_DEFAULT_THRESHOLD: f32 = 0.70;

/// 原始输出到置信度的换算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
  /// 跨类别归一化
  Softmax,
  /// 原始值即为 0-1 置信度，多标签
  Direct,
}

/// `[1, C]` 向量分类
#[derive(Debug, Clone)]
pub struct Classifier {
  name: &'static str,
  kind: OutputKind,
  mode: ScoreMode,
  classes: Dim,
  config: BaseConfig,
}

impl Classifier {
  pub const MOBILENET_SOFTMAX: &'static str = "mobilenet-softmax";
  pub const YAMNET: &'static str = "yamnet";

  pub fn new(name: &'static str, kind: OutputKind, mode: ScoreMode, classes: Dim) -> Self {
    Self {
      name,
      kind,
      mode,
      classes,
      config: BaseConfig::new(CLASSIFIER_DEFAULT_THRESHOLD),
    }
  }

  pub fn mobilenet_softmax() -> Self {
    Self::new(
      Self::MOBILENET_SOFTMAX,
      OutputKind::ImageClassification,
      ScoreMode::Softmax,
      Dim::Range([400, 1001]),
    )
  }

  pub fn yamnet() -> Self {
    Self::new(
      Self::YAMNET,
      OutputKind::AudioClassification,
      ScoreMode::Direct,
      Dim::Exact(521),
    )
  }

  pub fn mode(&self) -> ScoreMode {
    self.mode
  }

  /// 以百分比表示的置信度
  fn percentages(&self, values: &[f32]) -> Vec<f32> {
    match self.mode {
      ScoreMode::Softmax => softmax(values).into_iter().map(|p| p * 100.0).collect(),
      ScoreMode::Direct => values.iter().map(|v| v * 100.0).collect(),
    }
  }
}

impl Decoder for Classifier {
  fn name(&self) -> &'static str {
    self.name
  }

  fn caps(&self) -> Caps {
    Caps::new(self.kind).signature(&[TensorType::Float32], vec![vec![Dim::Exact(1), self.classes]])
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    self.config.configure(self.name, labels, settings)?;
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    _params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(self.kind)?;
    expect_tensor_count(tensors, 1, "1")?;
    let tensor = &tensors[0];
    let classes = match tensor.dim(1) {
      Some(c) if tensor.rank() == 2 => c,
      _ => return Err(ProcessError::unsupported(tensors)),
    };

    let values = tensor.to_f32_vec();
    let percentages = self.percentages(&values[..classes.min(values.len())]);
    let threshold = self.config.threshold * 100.0;
    let labels = &self.config.labels;

    let mut entries: Vec<Classification> = percentages
      .into_iter()
      .enumerate()
      .filter(|(idx, confidence)| {
        let keep = *confidence >= threshold;
        if !keep {
          trace!("类别 {} 置信度 {:.2} 低于阈值", idx, confidence);
        }
        keep
      })
      .map(|(idx, confidence)| Classification {
        name: labels.name(idx as i32).to_string(),
        confidence,
        color: labels.color(idx as i32),
      })
      .collect();
    entries.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    debug!("{}: {} 个类别通过阈值", self.name, entries.len());

    let target = match self.kind {
      OutputKind::AudioClassification => output.audio_classifications_mut()?,
      _ => output.image_classifications_mut()?,
    };
    target.extend(entries);
    Ok(())
  }
}
