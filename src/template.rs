// 该文件是 Shanan （山南西风） 项目的一部分。
// src/template.rs - 人脸模板库二进制格式
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// 人脸特征向量长度
pub const FEATURE_COUNT: usize = 512;
/// 活体特征向量长度
pub const LIVELINESS_FEATURE_COUNT: usize = 32;
/// 名称字段长度，不足部分以 NUL 填充
pub const NAME_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum TemplateError {
  #[error("读取模板库 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("模板库数据截断: 偏移 {offset} 处需要 {needed} 字节, 总长 {len}")]
  Truncated {
    offset: usize,
    needed: usize,
    len: usize,
  },
  #[error("模板库头部无效: 特征长度 {features}, 活体特征长度 {liveliness}")]
  InvalidHeader { features: u32, liveliness: u32 },
  #[error("模板库名称不是合法的 UTF-8")]
  InvalidName,
}

/// 同一张脸的半脸与全脸特征
#[derive(Debug, Clone, PartialEq)]
pub struct TemplatePair {
  pub half: Vec<f32>,
  pub whole: Vec<f32>,
}

/// 一个身份的模板，加载后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTemplate {
  pub version: u32,
  pub name: String,
  pub liveliness: Vec<f32>,
  pub templates: Vec<TemplatePair>,
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], TemplateError> {
  let truncated = || TemplateError::Truncated {
    offset: *cursor,
    needed: len,
    len: bytes.len(),
  };
  let end = cursor.checked_add(len).ok_or_else(truncated)?;
  let out = bytes.get(*cursor..end).ok_or_else(truncated)?;
  *cursor = end;
  Ok(out)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, TemplateError> {
  let slice = read_slice(bytes, cursor, 4)?;
  Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_f32s(bytes: &[u8], cursor: &mut usize, count: usize) -> Result<Vec<f32>, TemplateError> {
  let slice = read_slice(bytes, cursor, count * 4)?;
  Ok(
    slice
      .chunks_exact(4)
      .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
      .collect(),
  )
}

impl FaceTemplate {
  pub fn load(path: &Path) -> Result<Self, TemplateError> {
    info!("加载人脸模板库: {}", path.display());
    let bytes = std::fs::read(path).map_err(|source| TemplateError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::decode(&bytes)
  }

  /// 按小端序解析模板库
  pub fn decode(bytes: &[u8]) -> Result<Self, TemplateError> {
    let mut cursor = 0usize;
    let version = read_u32(bytes, &mut cursor)?;
    let features = read_u32(bytes, &mut cursor)?;
    let liveliness_count = read_u32(bytes, &mut cursor)?;
    if features as usize != FEATURE_COUNT || liveliness_count as usize != LIVELINESS_FEATURE_COUNT {
      return Err(TemplateError::InvalidHeader {
        features,
        liveliness: liveliness_count,
      });
    }

    let raw_name = read_slice(bytes, &mut cursor, NAME_SIZE)?;
    let end = raw_name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
    let name = std::str::from_utf8(&raw_name[..end])
      .map_err(|_| TemplateError::InvalidName)?
      .to_string();

    let liveliness = read_f32s(bytes, &mut cursor, LIVELINESS_FEATURE_COUNT)?;

    let count = read_u32(bytes, &mut cursor)? as usize;
    let pair_size = FEATURE_COUNT * 4 * 2;
    let mut templates = Vec::with_capacity(count.min((bytes.len() - cursor) / pair_size));
    for _ in 0..count {
      let half = read_f32s(bytes, &mut cursor, FEATURE_COUNT)?;
      let whole = read_f32s(bytes, &mut cursor, FEATURE_COUNT)?;
      templates.push(TemplatePair { half, whole });
    }

    debug!("模板库 {}: 版本 {}, {} 组模板", name, version, templates.len());
    Ok(Self {
      version,
      name,
      liveliness,
      templates,
    })
  }

  /// 编码为模板库二进制格式，名称超长部分被截断
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&self.version.to_le_bytes());
    out.extend_from_slice(&(FEATURE_COUNT as u32).to_le_bytes());
    out.extend_from_slice(&(LIVELINESS_FEATURE_COUNT as u32).to_le_bytes());

    let mut name = [0u8; NAME_SIZE];
    let len = self.name.len().min(NAME_SIZE);
    name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
    out.extend_from_slice(&name);

    let fixed = |values: &[f32], count: usize| {
      (0..count)
        .flat_map(|i| values.get(i).copied().unwrap_or(0.0).to_le_bytes())
        .collect::<Vec<u8>>()
    };
    out.extend(fixed(&self.liveliness, LIVELINESS_FEATURE_COUNT));
    out.extend_from_slice(&(self.templates.len() as u32).to_le_bytes());
    for pair in &self.templates {
      out.extend(fixed(&pair.half, FEATURE_COUNT));
      out.extend(fixed(&pair.whole, FEATURE_COUNT));
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> FaceTemplate {
    FaceTemplate {
      version: 2,
      name: "alice".to_string(),
      liveliness: vec![0.5; LIVELINESS_FEATURE_COUNT],
      templates: vec![TemplatePair {
        half: vec![0.25; FEATURE_COUNT],
        whole: (0..FEATURE_COUNT).map(|i| i as f32).collect(),
      }],
    }
  }

  #[test]
  fn decodes_encoded_database() {
    let template = sample();
    let bytes = template.encode();
    assert_eq!(bytes.len(), 12 + NAME_SIZE + 32 * 4 + 4 + 2 * 512 * 4);
    assert_eq!(FaceTemplate::decode(&bytes).unwrap(), template);
  }

  #[test]
  fn rejects_bad_header() {
    let mut bytes = sample().encode();
    bytes[4..8].copy_from_slice(&128u32.to_le_bytes());
    assert!(matches!(
      FaceTemplate::decode(&bytes),
      Err(TemplateError::InvalidHeader { features: 128, .. })
    ));
  }

  #[test]
  fn rejects_truncated_templates() {
    let bytes = sample().encode();
    let err = FaceTemplate::decode(&bytes[..bytes.len() - 1]).unwrap_err();
    assert!(matches!(err, TemplateError::Truncated { .. }));
  }

  #[test]
  fn loads_from_disk() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), sample().encode()).unwrap();
    assert_eq!(FaceTemplate::load(file.path()).unwrap().name, "alice");
    assert!(FaceTemplate::load(Path::new("/nonexistent/face.bin")).is_err());
  }
}
