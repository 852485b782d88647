// 该文件是 Shanan （山南西风） 项目的一部分。
// src/settings.rs - 解码器配置
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

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum SettingsError {
  #[error("配置不是合法的 JSON 对象: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("置信度 {0} 超出 0-100 范围")]
  ConfidenceOutOfRange(f64),
}

/// 骨架连线：关键点 `id` 连向关键点 `connection`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
  pub id: u32,
  pub connection: u32,
}

/// 一组关键点名称，`id` 对应类别下标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandmarkNames {
  pub id: u32,
  pub names: Vec<(u32, String)>,
}

impl LandmarkNames {
  pub fn name(&self, index: u32) -> Option<&str> {
    self
      .names
      .iter()
      .find(|(id, _)| *id == index)
      .map(|(_, name)| name.as_str())
  }
}

/// 骨架树中的一个节点，`links` 为由该关键点出发的边
///
/// 节点在数组中的下标与关键点编号一致，遍历时按下标查找子节点。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkeletonNode {
  pub id: Option<u32>,
  pub links: Vec<u32>,
  pub connection: Option<u32>,
}

#[derive(Deserialize, Default)]
struct RawSettings {
  confidence: Option<f64>,
  connections: Option<Vec<Value>>,
  landmarks: Option<Vec<Value>>,
  databases: Option<Vec<Value>>,
  posenet: Option<Vec<Value>>,
}

/// 解析后的配置
///
/// `connections` 与 `landmarks` 为 `None` 表示配置中没有该项，区别于空数组。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
  /// 置信度阈值，0-100
  pub confidence: Option<f64>,
  pub connections: Option<Vec<Connection>>,
  pub landmarks: Option<Vec<LandmarkNames>>,
  pub databases: Vec<PathBuf>,
  /// 非对象节点记为 `None`，保留下标
  pub skeleton: Option<Vec<Option<SkeletonNode>>>,
}

impl Settings {
  /// 空白文本视为没有配置
  pub fn parse(text: &str) -> Result<Self, SettingsError> {
    if text.trim().is_empty() {
      return Ok(Self::default());
    }

    let raw: RawSettings = serde_json::from_str(text)?;
    if let Some(confidence) = raw.confidence.filter(|c| !(0.0..=100.0).contains(c)) {
      return Err(SettingsError::ConfidenceOutOfRange(confidence));
    }

    Ok(Self {
      confidence: raw.confidence,
      connections: raw.connections.map(|nodes| parse_connections(&nodes)),
      landmarks: raw.landmarks.map(|nodes| parse_landmarks(&nodes)),
      databases: raw.databases.map(|nodes| parse_databases(&nodes)).unwrap_or_default(),
      skeleton: raw.posenet.map(|nodes| parse_skeleton(&nodes)),
    })
  }

  /// 配置中的置信度覆盖默认阈值，返回 0-1 的阈值
  pub fn threshold_or(&self, default: f32) -> f32 {
    self.confidence.map_or(default, |c| (c / 100.0) as f32)
  }

  pub fn landmark_names(&self, id: u32) -> Option<&LandmarkNames> {
    self.landmarks.as_ref()?.iter().find(|l| l.id == id)
  }
}

fn as_u32(node: &Value, key: &str) -> Option<u32> {
  node.get(key)?.as_u64().and_then(|v| u32::try_from(v).ok())
}

fn parse_connections(nodes: &[Value]) -> Vec<Connection> {
  nodes
    .iter()
    .filter_map(|node| {
      let parsed = as_u32(node, "id").zip(as_u32(node, "connection"));
      if parsed.is_none() {
        warn!("忽略不完整的骨架连线配置: {}", node);
      }
      parsed.map(|(id, connection)| Connection { id, connection })
    })
    .collect()
}

fn parse_landmarks(nodes: &[Value]) -> Vec<LandmarkNames> {
  nodes
    .iter()
    .filter_map(|node| {
      let Some(id) = as_u32(node, "id") else {
        warn!("忽略缺少 id 的关键点名称配置: {}", node);
        return None;
      };
      let Some(entries) = node.get("landmarks_names").and_then(Value::as_array) else {
        warn!("关键点名称配置 {} 缺少 landmarks_names", id);
        return None;
      };
      let names = entries
        .iter()
        .filter_map(|entry| {
          let name = entry.get("name")?.as_str()?;
          Some((as_u32(entry, "id")?, name.to_string()))
        })
        .collect();
      Some(LandmarkNames { id, names })
    })
    .collect()
}

fn parse_databases(nodes: &[Value]) -> Vec<PathBuf> {
  nodes
    .iter()
    .filter_map(|node| {
      let path = node.get("database").and_then(Value::as_str);
      if path.is_none() {
        warn!("忽略缺少 database 路径的模板库配置: {}", node);
      }
      path.map(PathBuf::from)
    })
    .collect()
}

fn parse_skeleton(nodes: &[Value]) -> Vec<Option<SkeletonNode>> {
  nodes
    .iter()
    .map(|node| {
      node.is_object().then(|| SkeletonNode {
        id: as_u32(node, "id"),
        links: node
          .get("links")
          .and_then(Value::as_array)
          .map(|links| {
            links
              .iter()
              .filter_map(|v| v.as_u64().and_then(|v| u32::try_from(v).ok()))
              .collect()
          })
          .unwrap_or_default(),
        connection: as_u32(node, "connection"),
      })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_text_means_defaults() {
    let settings = Settings::parse("  \n").unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.threshold_or(0.7), 0.7);
  }

  #[test]
  fn confidence_overrides_threshold() {
    let settings = Settings::parse(r#"{"confidence": 55}"#).unwrap();
    assert!((settings.threshold_or(0.7) - 0.55).abs() < 1e-6);
    assert!(matches!(
      Settings::parse(r#"{"confidence": 150}"#),
      Err(SettingsError::ConfidenceOutOfRange(_))
    ));
  }

  #[test]
  fn malformed_settings_fail() {
    assert!(Settings::parse("[1, 2]").is_err());
    assert!(Settings::parse("{confidence: }").is_err());
    assert!(Settings::parse(r#"{"confidence": "high"}"#).is_err());
  }

  #[test]
  fn parses_tables() {
    let text = r#"{
      "connections": [{"id": 0, "connection": 1}, {"id": 2}],
      "landmarks": [{"id": 0, "landmarks_names": [{"id": 0, "name": "wrist"}]}],
      "databases": [{"database": "/data/alice.bin"}]
    }"#;
    let settings = Settings::parse(text).unwrap();
    assert_eq!(
      settings.connections,
      Some(vec![Connection {
        id: 0,
        connection: 1
      }])
    );
    assert_eq!(settings.landmark_names(0).unwrap().name(0), Some("wrist"));
    assert!(settings.landmark_names(1).is_none());
    assert_eq!(settings.databases, vec![PathBuf::from("/data/alice.bin")]);
  }

  #[test]
  fn parses_skeleton_nodes_by_index() {
    let text = r#"{"posenet": [
      {"id": 0, "links": [1, "x"], "connection": 1},
      "skip",
      {"links": [0]}
    ]}"#;
    let skeleton = Settings::parse(text).unwrap().skeleton.unwrap();
    assert_eq!(skeleton.len(), 3);
    assert_eq!(
      skeleton[0],
      Some(SkeletonNode {
        id: Some(0),
        links: vec![1],
        connection: Some(1)
      })
    );
    assert_eq!(skeleton[1], None);
    assert_eq!(skeleton[2].as_ref().unwrap().id, None);
    assert!(Settings::parse("").unwrap().skeleton.is_none());
  }
}
