// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 批量解码任务
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

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  model::{Decoder, ProcessError},
  nms::DisplacementFilter,
  output::{Output, OutputKind},
  params::Params,
  tensor::{Tensor, TensorError},
};

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("批量任务不支持输出类型 {0}")]
  UnsupportedKind(OutputKind),
  #[error("没有输入张量")]
  NoTensors,
  #[error("输入张量的批次数不一致: {0:?}")]
  BatchMismatch(Vec<usize>),
  #[error("张量切分失败: {0}")]
  Tensor(#[from] TensorError),
  #[error("第 {batch} 批解码失败: {source}")]
  Process {
    batch: usize,
    #[source]
    source: ProcessError,
  },
}

pub trait Task<D: ?Sized> {
  type Output;
  type Error;
  fn run_task(
    &mut self,
    decoder: &mut D,
    tensors: &[Tensor<'_>],
    params: &Params,
  ) -> Result<Self::Output, Self::Error>;
}

/// 沿第 0 维逐批解码，每批得到一个按置信度降序排列的列表输出
///
/// 启用位移修正时，各批次按顺序视为连续的帧。
#[derive(Debug, Default)]
pub struct BatchTask {
  smoothing: Option<DisplacementFilter>,
}

impl BatchTask {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_smoothing(mut self, filter: DisplacementFilter) -> Self {
    self.smoothing = Some(filter);
    self
  }

  fn batch_count(tensors: &[Tensor<'_>]) -> Result<usize, TaskError> {
    let counts = tensors
      .iter()
      .map(|t| t.dim(0).ok_or(TensorError::NoBatchDimension))
      .collect::<Result<Vec<_>, _>>()?;
    match counts.first() {
      None => Err(TaskError::NoTensors),
      Some(&first) if counts.iter().all(|&c| c == first) => Ok(first),
      Some(_) => Err(TaskError::BatchMismatch(counts)),
    }
  }
}

impl<D: Decoder + ?Sized> Task<D> for BatchTask {
  type Output = Vec<Output>;
  type Error = TaskError;

  fn run_task(
    &mut self,
    decoder: &mut D,
    tensors: &[Tensor<'_>],
    params: &Params,
  ) -> Result<Self::Output, Self::Error> {
    let kind = decoder.caps().kind;
    if Output::empty(kind).is_none() {
      tracing::error!("{} 的输出类型 {} 不是列表", decoder.name(), kind);
      return Err(TaskError::UnsupportedKind(kind));
    }
    let batches = Self::batch_count(tensors)?;
    info!("开始解码 {} 批, 解码器 {}", batches, decoder.name());

    let mut outputs = Vec::with_capacity(batches);
    for batch in 0..batches {
      let views = tensors
        .iter()
        .map(|t| t.batch(batch))
        .collect::<Result<Vec<_>, _>>()?;
      let mut output = Output::empty(kind).ok_or(TaskError::UnsupportedKind(kind))?;

      let now = Instant::now();
      decoder
        .process(&views, params, &mut output)
        .map_err(|source| TaskError::Process { batch, source })?;
      output.sort_by_confidence();
      if let (Some(filter), Output::ObjectDetections(detections)) = (&mut self.smoothing, &mut output) {
        filter.apply(detections);
      }
      let elapsed = now.elapsed();
      debug!("({})解码完成, {} 个结果, 耗时: {:.2?}", batch, output.len(), elapsed);
      outputs.push(output);
    }

    Ok(outputs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    caps::Caps,
    labels::LabelsSource,
    model::ConfigureError,
    output::Classification,
    tensor::OwnedTensor,
  };

  /// 每个元素输出一个分类结果
  struct Echo(OutputKind);

  impl Decoder for Echo {
    fn name(&self) -> &'static str {
      "echo"
    }

    fn caps(&self) -> Caps {
      Caps::new(self.0)
    }

    fn configure(&mut self, _: &LabelsSource, _: &str) -> Result<(), ConfigureError> {
      Ok(())
    }

    fn process(
      &mut self,
      tensors: &[Tensor<'_>],
      _: &Params,
      output: &mut Output,
    ) -> Result<(), ProcessError> {
      let entries = output.image_classifications_mut()?;
      for (idx, value) in tensors[0].to_f32_vec().into_iter().enumerate() {
        entries.push(Classification {
          name: idx.to_string(),
          confidence: value,
          color: 0,
        });
      }
      Ok(())
    }
  }

  #[test]
  fn splits_batches_and_sorts() {
    let tensor = OwnedTensor::from_f32(vec![2, 3], &[1.0, 3.0, 2.0, 9.0, 8.0, 7.0]).unwrap();
    let mut decoder = Echo(OutputKind::ImageClassification);
    let outputs = BatchTask::new()
      .run_task(&mut decoder, &[tensor.view()], &Params::new())
      .unwrap();
    assert_eq!(outputs.len(), 2);
    let Output::ImageClassifications(first) = &outputs[0] else {
      unreachable!()
    };
    let names: Vec<_> = first.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["1", "2", "0"]);
    let Output::ImageClassifications(second) = &outputs[1] else {
      unreachable!()
    };
    assert_eq!(second[0].confidence, 9.0);
  }

  #[test]
  fn frame_kinds_are_rejected() {
    let tensor = OwnedTensor::from_f32(vec![1, 1], &[1.0]).unwrap();
    let mut decoder = Echo(OutputKind::ImageSegmentation);
    assert!(matches!(
      BatchTask::new().run_task(&mut decoder, &[tensor.view()], &Params::new()),
      Err(TaskError::UnsupportedKind(OutputKind::ImageSegmentation))
    ));
  }

  #[test]
  fn batch_counts_must_agree() {
    let a = OwnedTensor::from_f32(vec![2, 1], &[1.0, 2.0]).unwrap();
    let b = OwnedTensor::from_f32(vec![1, 1], &[1.0]).unwrap();
    let mut decoder = Echo(OutputKind::ImageClassification);
    assert!(matches!(
      BatchTask::new().run_task(&mut decoder, &[a.view(), b.view()], &Params::new()),
      Err(TaskError::BatchMismatch(_))
    ));
  }

  #[test]
  fn contract_errors_carry_batch_index() {
    let tensor = OwnedTensor::from_f32(vec![1, 1], &[1.0]).unwrap();
    let mut decoder = Echo(OutputKind::PoseEstimation);
    assert!(matches!(
      BatchTask::new().run_task(&mut decoder, &[tensor.view()], &Params::new()),
      Err(TaskError::Process { batch: 0, .. })
    ));
  }
}
