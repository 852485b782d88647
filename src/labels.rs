// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别标签与颜色查询
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

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

/// 查询不到标签时返回的名称
pub const UNKNOWN_LABEL: &str = "unknown";
/// 查询不到标签时返回的颜色
pub const UNKNOWN_COLOR: u32 = 0x0000_000F;

/// 纯文本标签按行号取色的调色板，RGBA
pub const PALETTE: [u32; 50] = [
  0x5548f8ff, 0xa515beff, 0x2dc305ff, 0x61458dff, 0x042547ff, 0x89561cff, 0x8c1e2fff, 0xe44999ff,
  0xaa9310ff, 0x09bf77ff, 0xafd032ff, 0x9638c3ff, 0x943e08ff, 0x386136ff, 0x4110fbff, 0x02d97cff,
  0xc67c67ff, 0x9d84e3ff, 0x886350ff, 0xe31f15ff, 0xbf6989ff, 0x662f8eff, 0x268a06ff, 0x8a743dff,
  0xc78f49ff, 0xbcbc6dff, 0x242b25ff, 0xc953a5ff, 0x7d710cff, 0x4d150bff, 0x95394cff, 0x782907ff,
  0x87f257ff, 0x20a9fbff, 0x7dd89bff, 0x3e2097ff, 0xe5e002ff, 0xeb3353ff, 0x101681ff, 0x5467dbff,
  0x520f53ff, 0xe2a4afff, 0x295e74ff, 0x43d4e3ff, 0xe1ae0dff, 0x3d2e5dff, 0x883a17ff, 0x7e42d8ff,
  0xfb04a4ff, 0xf04c61ff,
];

const DEPRECATED_MARKER: &str = "(structure)";

#[derive(Error, Debug)]
pub enum LabelsError {
  #[error("读取标签文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("检测到已弃用的标签格式，请使用每行一个标签或 JSON 格式")]
  Deprecated,
  #[error("标签 {id} 的颜色 '{color}' 不是合法的十六进制数")]
  InvalidColor { id: i32, color: String },
  #[error("标签 JSON 格式错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 标签来源：内联文本或文件路径
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LabelsSource {
  #[default]
  None,
  Inline(String),
  File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
  pub name: String,
  pub color: u32,
}

#[derive(Deserialize)]
struct JsonLabel {
  id: i32,
  label: String,
  color: String,
}

/// 类别下标到名称与颜色的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
  labels: BTreeMap<i32, Label>,
}

impl LabelTable {
  pub fn load(source: &LabelsSource) -> Result<Self, LabelsError> {
    match source {
      LabelsSource::None => Ok(Self::default()),
      LabelsSource::Inline(text) => Self::parse(text),
      LabelsSource::File(path) => {
        info!("加载标签文件: {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|source| LabelsError::Io {
          path: path.clone(),
          source,
        })?;
        Self::parse(&text)
      }
    }
  }

  /// 以 `[` 或 `{` 开头的文本按 JSON 数组解析，其余按每行一个标签的纯文本格式解析
  pub fn parse(text: &str) -> Result<Self, LabelsError> {
    if text.trim_start().starts_with(['[', '{']) {
      let entries = serde_json::from_str::<Vec<JsonLabel>>(text).inspect_err(|e| {
        warn!("标签文件看起来是 JSON 但解析失败: {}", e);
      })?;
      return Self::from_json_entries(entries);
    }
    debug!("标签不是 JSON 格式, 按纯文本解析");
    Self::parse_plain_text(text)
  }

  fn from_json_entries(entries: Vec<JsonLabel>) -> Result<Self, LabelsError> {
    let mut labels = BTreeMap::new();
    for entry in entries {
      let color = parse_color(&entry.color).ok_or_else(|| LabelsError::InvalidColor {
        id: entry.id,
        color: entry.color.clone(),
      })?;
      labels.insert(
        entry.id,
        Label {
          name: entry.label,
          color,
        },
      );
    }
    Ok(Self { labels })
  }

  fn parse_plain_text(text: &str) -> Result<Self, LabelsError> {
    let mut labels = BTreeMap::new();
    let lines = text
      .lines()
      .map(|line| line.trim_end_matches('\r'))
      .filter(|line| !line.is_empty());
    for (id, line) in lines.enumerate() {
      if line.contains(DEPRECATED_MARKER) {
        return Err(LabelsError::Deprecated);
      }
      labels.insert(
        id as i32,
        Label {
          name: line.to_string(),
          color: PALETTE[id % PALETTE.len()],
        },
      );
    }
    Ok(Self { labels })
  }

  pub fn get(&self, id: i32) -> Option<&Label> {
    self.labels.get(&id)
  }

  pub fn name(&self, id: i32) -> &str {
    self.get(id).map_or(UNKNOWN_LABEL, |l| l.name.as_str())
  }

  pub fn color(&self, id: i32) -> u32 {
    self.get(id).map_or(UNKNOWN_COLOR, |l| l.color)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }
}

fn parse_color(text: &str) -> Option<u32> {
  let text = text.trim();
  let digits = text
    .strip_prefix("0x")
    .or_else(|| text.strip_prefix("0X"))
    .or_else(|| text.strip_prefix('#'))
    .unwrap_or(text);
  u32::from_str_radix(digits, 16).ok()
}

impl FromUrlWithScheme for LabelTable {
  const SCHEME: &'static str = "file";
}

impl FromUrl for LabelTable {
  type Error = LabelsError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LabelsError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Self::load(&LabelsSource::File(PathBuf::from(url.path())))
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  #[test]
  fn parses_json_labels() {
    let text = r##"[
      {"id": 0, "label": "person", "color": "0x00FF00FF"},
      {"id": 3, "label": "car", "color": "#ff0000ff"}
    ]"##;
    let table = LabelTable::parse(text).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.name(3), "car");
    assert_eq!(table.color(0), 0x00FF00FF);
    assert_eq!(table.color(3), 0xFF0000FF);
  }

  #[test]
  fn falls_back_to_plain_text_with_palette() {
    let table = LabelTable::parse("person\r\n\nbicycle\ncar\n").unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.name(1), "bicycle");
    assert_eq!(table.color(0), PALETTE[0]);
    assert_eq!(table.color(2), PALETTE[2]);
  }

  #[test]
  fn unknown_ids_use_defaults() {
    let table = LabelTable::parse("person").unwrap();
    assert_eq!(table.name(7), UNKNOWN_LABEL);
    assert_eq!(table.color(-1), UNKNOWN_COLOR);
  }

  #[test]
  fn rejects_deprecated_and_bad_colors() {
    assert!(matches!(
      LabelTable::parse("person (structure)"),
      Err(LabelsError::Deprecated)
    ));
    let bad = r#"[{"id": 0, "label": "x", "color": "zz"}]"#;
    assert!(matches!(
      LabelTable::parse(bad),
      Err(LabelsError::InvalidColor { id: 0, .. })
    ));
  }

  #[test]
  fn malformed_json_is_not_read_as_text() {
    let truncated = r#"[{"id": 0, "label": "person""#;
    assert!(matches!(
      LabelTable::parse(truncated),
      Err(LabelsError::Json(_))
    ));
    assert!(matches!(
      LabelTable::parse("  {\"id\": 0}"),
      Err(LabelsError::Json(_))
    ));
  }

  #[test]
  fn loads_from_file_and_url() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "background\nperson").unwrap();
    let source = LabelsSource::File(file.path().to_path_buf());
    assert_eq!(LabelTable::load(&source).unwrap().name(1), "person");

    let url = Url::from_file_path(file.path()).unwrap();
    assert_eq!(LabelTable::from_url(&url).unwrap().len(), 2);

    let missing = LabelsSource::File(PathBuf::from("/nonexistent/labels.txt"));
    assert!(matches!(LabelTable::load(&missing), Err(LabelsError::Io { .. })));
  }
}
