// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 张量视图
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

use std::str::FromStr;

use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TensorType {
  Int8,
  UInt8,
  Int32,
  UInt32,
  Float16,
  Float32,
}

impl TensorType {
  /// 单个元素占用的字节数
  pub const fn size(self) -> usize {
    match self {
      TensorType::Int8 | TensorType::UInt8 => 1,
      TensorType::Float16 => 2,
      TensorType::Int32 | TensorType::UInt32 | TensorType::Float32 => 4,
    }
  }

  fn decode(self, bytes: &[u8]) -> Option<f32> {
    let value = match self {
      TensorType::Int8 => *bytes.first()? as i8 as f32,
      TensorType::UInt8 => *bytes.first()? as f32,
      TensorType::Float16 => f16::from_le_bytes(bytes.try_into().ok()?).to_f32(),
      TensorType::Int32 => i32::from_le_bytes(bytes.try_into().ok()?) as f32,
      TensorType::UInt32 => u32::from_le_bytes(bytes.try_into().ok()?) as f32,
      TensorType::Float32 => f32::from_le_bytes(bytes.try_into().ok()?),
    };
    Some(value)
  }
}

impl std::fmt::Display for TensorType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      TensorType::Int8 => "INT8",
      TensorType::UInt8 => "UINT8",
      TensorType::Int32 => "INT32",
      TensorType::UInt32 => "UINT32",
      TensorType::Float16 => "FLOAT16",
      TensorType::Float32 => "FLOAT32",
    };
    write!(f, "{}", name)
  }
}

impl FromStr for TensorType {
  type Err = TensorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "i8" | "int8" => Ok(TensorType::Int8),
      "u8" | "uint8" => Ok(TensorType::UInt8),
      "i32" | "int32" => Ok(TensorType::Int32),
      "u32" | "uint32" => Ok(TensorType::UInt32),
      "f16" | "float16" => Ok(TensorType::Float16),
      "f32" | "float32" => Ok(TensorType::Float32),
      _ => Err(TensorError::UnknownType(s.to_string())),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
  #[error("张量维度乘积溢出: {0:?}")]
  DimensionOverflow(Vec<u32>),
  #[error("张量数据长度不足: 需要 {required} 字节, 实际 {actual} 字节")]
  TooShort { required: usize, actual: usize },
  #[error("张量索引越界: 索引 {index}, 元素数量 {len}")]
  OutOfBounds { index: usize, len: usize },
  #[error("张量缺少批次维度")]
  NoBatchDimension,
  #[error("不支持的张量类型: {0}")]
  UnknownType(String),
}

fn byte_len(kind: TensorType, dims: &[u32]) -> Result<usize, TensorError> {
  dims
    .iter()
    .try_fold(kind.size(), |acc, &d| acc.checked_mul(d as usize))
    .ok_or_else(|| TensorError::DimensionOverflow(dims.to_vec()))
}

/// 推理输出张量的只读视图
///
/// 构造时校验一次 `维度乘积 × 元素大小 <= 数据长度`，此后所有按下标的访问都是带边界检查的。
/// 数据按小端序解释。
#[derive(Debug, Clone)]
pub struct Tensor<'a> {
  kind: TensorType,
  dims: Vec<u32>,
  data: &'a [u8],
}

impl<'a> Tensor<'a> {
  pub fn new(kind: TensorType, dims: impl Into<Vec<u32>>, data: &'a [u8]) -> Result<Self, TensorError> {
    let dims = dims.into();
    let required = byte_len(kind, &dims)?;
    if data.len() < required {
      return Err(TensorError::TooShort {
        required,
        actual: data.len(),
      });
    }

    Ok(Self {
      kind,
      dims,
      data: &data[..required],
    })
  }

  pub fn kind(&self) -> TensorType {
    self.kind
  }

  pub fn dims(&self) -> &[u32] {
    &self.dims
  }

  pub fn dim(&self, index: usize) -> Option<usize> {
    self.dims.get(index).map(|&d| d as usize)
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  /// 元素数量
  pub fn len(&self) -> usize {
    self.data.len() / self.kind.size()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_bytes(&self) -> &'a [u8] {
    self.data
  }

  /// 读取第 `index` 个元素并转换为 `f32`
  pub fn get(&self, index: usize) -> Result<f32, TensorError> {
    let size = self.kind.size();
    let out_of_bounds = || TensorError::OutOfBounds {
      index,
      len: self.len(),
    };
    let start = index.checked_mul(size).ok_or_else(out_of_bounds)?;
    let end = start.checked_add(size).ok_or_else(out_of_bounds)?;
    let bytes = self.data.get(start..end).ok_or_else(out_of_bounds)?;
    self.kind.decode(bytes).ok_or_else(out_of_bounds)
  }

  /// 将全部元素转换为 `f32`
  pub fn to_f32_vec(&self) -> Vec<f32> {
    self
      .data
      .chunks_exact(self.kind.size())
      .filter_map(|chunk| self.kind.decode(chunk))
      .collect()
  }

  /// 沿第 0 维切出第 `index` 个批次，批次维度置为 1
  pub fn batch(&self, index: usize) -> Result<Tensor<'a>, TensorError> {
    let batches = self.dim(0).ok_or(TensorError::NoBatchDimension)?;
    if index >= batches {
      return Err(TensorError::OutOfBounds {
        index,
        len: batches,
      });
    }

    let mut dims = self.dims.clone();
    dims[0] = 1;
    let stride = byte_len(self.kind, &dims)?;
    let start = stride * index;
    Ok(Tensor {
      kind: self.kind,
      dims,
      data: &self.data[start..start + stride],
    })
  }
}

/// 拥有数据的张量，作为张量透传输出的容器
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedTensor {
  kind: TensorType,
  dims: Vec<u32>,
  data: Vec<u8>,
}

impl OwnedTensor {
  pub fn zeroed(kind: TensorType, dims: impl Into<Vec<u32>>) -> Result<Self, TensorError> {
    let dims = dims.into();
    let size = byte_len(kind, &dims)?;
    Ok(Self {
      kind,
      dims,
      data: vec![0u8; size],
    })
  }

  pub fn from_bytes(
    kind: TensorType,
    dims: impl Into<Vec<u32>>,
    data: Vec<u8>,
  ) -> Result<Self, TensorError> {
    let dims = dims.into();
    let required = byte_len(kind, &dims)?;
    if data.len() != required {
      return Err(TensorError::TooShort {
        required,
        actual: data.len(),
      });
    }
    Ok(Self { kind, dims, data })
  }

  pub fn from_f32(dims: impl Into<Vec<u32>>, values: &[f32]) -> Result<Self, TensorError> {
    let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Self::from_bytes(TensorType::Float32, dims, data)
  }

  pub fn kind(&self) -> TensorType {
    self.kind
  }

  pub fn dims(&self) -> &[u32] {
    &self.dims
  }

  pub fn len(&self) -> usize {
    self.data.len() / self.kind.size()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn as_bytes_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  pub fn view(&self) -> Tensor<'_> {
    Tensor {
      kind: self.kind,
      dims: self.dims.clone(),
      data: &self.data,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_short_buffers() {
    let data = [0u8; 15];
    let err = Tensor::new(TensorType::Float32, vec![1, 4], &data).unwrap_err();
    assert_eq!(
      err,
      TensorError::TooShort {
        required: 16,
        actual: 15
      }
    );
  }

  #[test]
  fn reads_every_element_type() {
    let data = [0xffu8, 0x02];
    let t = Tensor::new(TensorType::Int8, vec![2], &data).unwrap();
    assert_eq!(t.get(0).unwrap(), -1.0);
    let t = Tensor::new(TensorType::UInt8, vec![2], &data).unwrap();
    assert_eq!(t.get(0).unwrap(), 255.0);

    let half = f16::from_f32(1.5).to_le_bytes();
    let t = Tensor::new(TensorType::Float16, vec![1], &half).unwrap();
    assert_eq!(t.get(0).unwrap(), 1.5);

    let bytes = (-7i32).to_le_bytes();
    let t = Tensor::new(TensorType::Int32, vec![1], &bytes).unwrap();
    assert_eq!(t.get(0).unwrap(), -7.0);
  }

  #[test]
  fn indexed_access_is_checked() {
    let owned = OwnedTensor::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap();
    let view = owned.view();
    assert_eq!(view.get(2).unwrap(), 3.0);
    assert!(matches!(
      view.get(3),
      Err(TensorError::OutOfBounds { index: 3, len: 3 })
    ));
    let last = usize::MAX / 4;
    assert!(matches!(
      view.get(last),
      Err(TensorError::OutOfBounds { len: 3, .. })
    ));
  }

  #[test]
  fn batch_slices_along_first_dimension() {
    let owned = OwnedTensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let view = owned.view();
    let second = view.batch(1).unwrap();
    assert_eq!(second.dims(), &[1, 2]);
    assert_eq!(second.to_f32_vec(), vec![3.0, 4.0]);
    assert!(view.batch(2).is_err());
  }

  #[test]
  fn parses_type_names() {
    assert_eq!("f32".parse::<TensorType>().unwrap(), TensorType::Float32);
    assert_eq!("UINT8".parse::<TensorType>().unwrap(), TensorType::UInt8);
    assert!("f64".parse::<TensorType>().is_err());
  }
}
