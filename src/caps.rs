// 该文件是 Shanan （山南西风） 项目的一部分。
// src/caps.rs - 解码器能力描述
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

use crate::{
  output::OutputKind,
  tensor::{Tensor, TensorType},
};

/// 单个维度的约束：固定值或闭区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
  Exact(u32),
  Range([u32; 2]),
}

impl Dim {
  pub fn accepts(&self, value: u32) -> bool {
    match *self {
      Dim::Exact(v) => v == value,
      Dim::Range([min, max]) => (min..=max).contains(&value),
    }
  }
}

/// 由维度列表构造 `Vec<Vec<Dim>>` 中的一项，`[a, b]` 表示区间
macro_rules! tensor_dims {
  (@one [$lo:expr, $hi:expr]) => {
    $crate::caps::Dim::Range([$lo, $hi])
  };
  (@one $d:expr) => {
    $crate::caps::Dim::Exact($d)
  };
  ($($d:tt),* $(,)?) => {
    vec![$($crate::caps::tensor_dims!(@one $d)),*]
  };
}
pub(crate) use tensor_dims;

/// 一组可接受的张量签名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSignature {
  pub format: Vec<TensorType>,
  pub dimensions: Vec<Vec<Dim>>,
}

impl TensorSignature {
  pub fn matches(&self, tensors: &[Tensor<'_>]) -> bool {
    self.dimensions.len() == tensors.len()
      && self.dimensions.iter().zip(tensors).all(|(dims, tensor)| {
        self.format.contains(&tensor.kind())
          && dims.len() == tensor.rank()
          && dims.iter().zip(tensor.dims()).all(|(d, &v)| d.accepts(v))
      })
  }
}

/// 解码器的能力描述，序列化后即宿主用于匹配模型的 JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
  #[serde(rename = "type")]
  pub kind: OutputKind,
  pub tensors: Vec<TensorSignature>,
}

impl Caps {
  pub fn new(kind: OutputKind) -> Self {
    Self {
      kind,
      tensors: Vec::new(),
    }
  }

  pub fn signature(mut self, format: &[TensorType], dimensions: Vec<Vec<Dim>>) -> Self {
    self.tensors.push(TensorSignature {
      format: format.to_vec(),
      dimensions,
    });
    self
  }

  /// 返回第一个与输入张量匹配的签名下标
  pub fn matching_signature(&self, tensors: &[Tensor<'_>]) -> Option<usize> {
    self.tensors.iter().position(|s| s.matches(tensors))
  }

  pub fn matches(&self, tensors: &[Tensor<'_>]) -> bool {
    self.matching_signature(tensors).is_some()
  }

  /// 按单个批次匹配，第 0 维可以大于 1
  pub fn matches_batched(&self, tensors: &[Tensor<'_>]) -> bool {
    tensors
      .iter()
      .map(|t| t.batch(0))
      .collect::<Result<Vec<_>, _>>()
      .is_ok_and(|first| self.matches(&first))
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::OwnedTensor;

  fn caps() -> Caps {
    Caps::new(OutputKind::ObjectDetection)
      .signature(
        &[TensorType::Float32],
        vec![tensor_dims![1, [21, 42840], 4], tensor_dims![1, [21, 42840]]],
      )
  }

  #[test]
  fn serializes_in_host_format() {
    let json: serde_json::Value = serde_json::from_str(&caps().to_json().unwrap()).unwrap();
    assert_eq!(json["type"], "object-detection");
    assert_eq!(json["tensors"][0]["format"][0], "FLOAT32");
    assert_eq!(json["tensors"][0]["dimensions"][0][1][1], 42840);
    assert_eq!(json["tensors"][0]["dimensions"][1][0], 1);
  }

  #[test]
  fn matches_ranges_and_formats() {
    let boxes = OwnedTensor::zeroed(TensorType::Float32, vec![1, 100, 4]).unwrap();
    let scores = OwnedTensor::zeroed(TensorType::Float32, vec![1, 100]).unwrap();
    let small = OwnedTensor::zeroed(TensorType::Float32, vec![1, 10]).unwrap();
    let ints = OwnedTensor::zeroed(TensorType::Int32, vec![1, 100]).unwrap();

    let caps = caps();
    assert!(caps.matches(&[boxes.view(), scores.view()]));
    assert!(!caps.matches(&[boxes.view(), small.view()]));
    assert!(!caps.matches(&[boxes.view(), ints.view()]));
    assert!(!caps.matches(&[boxes.view()]));
  }

  #[test]
  fn batched_inputs_match_per_batch() {
    let boxes = OwnedTensor::zeroed(TensorType::Float32, vec![3, 100, 4]).unwrap();
    let scores = OwnedTensor::zeroed(TensorType::Float32, vec![3, 100]).unwrap();
    let empty = OwnedTensor::zeroed(TensorType::Float32, vec![0, 100]).unwrap();

    let caps = caps();
    assert!(!caps.matches(&[boxes.view(), scores.view()]));
    assert!(caps.matches_batched(&[boxes.view(), scores.view()]));
    assert!(!caps.matches_batched(&[boxes.view(), empty.view()]));
  }
}
