// 该文件是 Shanan （山南西风） 项目的一部分。
// src/params.rs - 处理参数字典
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

use std::collections::HashMap;

use thiserror::Error;

use crate::geometry::{Region, Resolution};

/// 模型输入在源帧中的裁剪区域
pub const INPUT_TENSOR_REGION: &str = "input-tensor-region";
/// 模型输入张量的分辨率
pub const INPUT_TENSOR_DIMENSIONS: &str = "input-tensor-dimensions";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
  #[error("缺少参数 {0}")]
  Missing(&'static str),
  #[error("参数 {key} 类型错误: 期望 {expected}")]
  WrongType {
    key: &'static str,
    expected: &'static str,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
  Region(Region),
  Resolution(Resolution),
}

/// 名称到参数值的字典
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
  values: HashMap<String, ParamValue>,
}

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// 构造只含区域与分辨率的常用参数
  pub fn with_geometry(region: Region, resolution: Resolution) -> Self {
    let mut params = Self::new();
    params.insert(INPUT_TENSOR_REGION, ParamValue::Region(region));
    params.insert(INPUT_TENSOR_DIMENSIONS, ParamValue::Resolution(resolution));
    params
  }

  pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) -> Option<ParamValue> {
    self.values.insert(key.into(), value)
  }

  pub fn get(&self, key: &str) -> Option<&ParamValue> {
    self.values.get(key)
  }

  pub fn region(&self) -> Result<Region, ParamError> {
    match self.get(INPUT_TENSOR_REGION) {
      Some(ParamValue::Region(region)) => Ok(*region),
      Some(_) => Err(ParamError::WrongType {
        key: INPUT_TENSOR_REGION,
        expected: "Region",
      }),
      None => Err(ParamError::Missing(INPUT_TENSOR_REGION)),
    }
  }

  pub fn resolution(&self) -> Result<Resolution, ParamError> {
    match self.get(INPUT_TENSOR_DIMENSIONS) {
      Some(ParamValue::Resolution(resolution)) => Ok(*resolution),
      Some(_) => Err(ParamError::WrongType {
        key: INPUT_TENSOR_DIMENSIONS,
        expected: "Resolution",
      }),
      None => Err(ParamError::Missing(INPUT_TENSOR_DIMENSIONS)),
    }
  }
}
