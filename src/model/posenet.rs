// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/posenet.rs - PoseNet 多人姿态解码
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

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::{
  caps::{Caps, tensor_dims},
  geometry::Resolution,
  labels::{LabelTable, LabelsSource},
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  nms::{NmsVerdict, suppress_pose},
  output::{Keypoint, KeypointLink, Output, OutputKind, PoseEstimation},
  params::Params,
  scoring::sigmoid,
  settings::{Connection, SkeletonNode},
  tensor::{Tensor, TensorType},
};

const POSENET_DEFAULT_THRESHOLD: f32 = 0.70;
/// 姿态间抑制的关键点距离，单位为像素
const POSE_NMS_RADIUS: f32 = 20.0;
/// 根关键点局部极大值的搜索半径，单位为网格单元
const LOCAL_MAXIMUM_RADIUS: usize = 1;
/// 沿骨架边位移后按偏移量修正的次数
const REFINEMENT_STEPS: usize = 2;

/// 骨架树上的一条有向边
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SkeletonEdge {
  source: usize,
  target: usize,
}

/// 热力图中的局部极大值，作为一个姿态的起点
#[derive(Debug, Clone, Copy)]
struct RootPoint {
  part: usize,
  x: f32,
  y: f32,
  /// 0-100
  confidence: f32,
}

/// 热力图 `[1, H, W, P]`、偏移量 `[1, H, W, 2P]` 与位移 `[1, H, W, 4E]`
///
/// 偏移量前 P 个通道为纵向，后 P 个为横向。位移依次为正向纵、横与反向纵、横，各 E 个通道。
struct PosenetMaps {
  heatmap: Vec<f32>,
  offsets: Vec<f32>,
  displacements: Vec<f32>,
  rows: usize,
  columns: usize,
  parts: usize,
  edges: usize,
  stride_x: f32,
  stride_y: f32,
  max_x: f32,
  max_y: f32,
}

impl PosenetMaps {
  fn new(tensors: &[Tensor<'_>], resolution: Resolution) -> Option<Self> {
    let [heatmap, offsets, displacements] = tensors else {
      return None;
    };
    let grid = |t: &Tensor<'_>| {
      (t.rank() == 4 && t.dim(0) == Some(1)).then(|| (t.dim(1), t.dim(2), t.dim(3)))
    };
    let (Some(rows), Some(columns), Some(parts)) = grid(heatmap)? else {
      return None;
    };
    let (offset_rows, offset_columns, offset_channels) = grid(offsets)?;
    let (disp_rows, disp_columns, disp_channels) = grid(displacements)?;
    let same_grid = |r: Option<usize>, c: Option<usize>| r == Some(rows) && c == Some(columns);
    let disp_channels = disp_channels?;
    let valid = rows > 1
      && columns > 1
      && parts > 0
      && same_grid(offset_rows, offset_columns)
      && same_grid(disp_rows, disp_columns)
      && offset_channels == Some(2 * parts)
      && disp_channels > 0
      && disp_channels % 4 == 0;
    if !valid {
      return None;
    }

    // 网格单元之间的像素间距，按整数计算
    let stride_x = resolution.width.saturating_sub(1) / (columns as u32 - 1);
    let stride_y = resolution.height.saturating_sub(1) / (rows as u32 - 1);
    if stride_x == 0 || stride_y == 0 {
      return None;
    }

    Some(Self {
      heatmap: heatmap.to_f32_vec(),
      offsets: offsets.to_f32_vec(),
      displacements: displacements.to_f32_vec(),
      rows,
      columns,
      parts,
      edges: disp_channels / 4,
      stride_x: stride_x as f32,
      stride_y: stride_y as f32,
      max_x: resolution.width.saturating_sub(1) as f32,
      max_y: resolution.height.saturating_sub(1) as f32,
    })
  }

  fn cell_index(&self, row: usize, column: usize) -> usize {
    row * self.columns + column
  }

  fn heat(&self, row: usize, column: usize, part: usize) -> f32 {
    self.heatmap[self.cell_index(row, column) * self.parts + part]
  }

  /// 返回 `(dy, dx)`
  fn offset(&self, row: usize, column: usize, part: usize) -> (f32, f32) {
    let base = self.cell_index(row, column) * self.parts * 2 + part;
    (self.offsets[base], self.offsets[base + self.parts])
  }

  /// 返回 `(dy, dx)`
  fn displacement(&self, row: usize, column: usize, edge: usize, backwards: bool) -> (f32, f32) {
    let mut base = self.cell_index(row, column) * self.edges * 4 + edge;
    if backwards {
      base += self.edges * 2;
    }
    (self.displacements[base], self.displacements[base + self.edges])
  }

  /// 像素坐标所在的网格单元 `(row, column)`
  fn cell(&self, x: f32, y: f32) -> (usize, usize) {
    let snap = |v: f32, stride: f32, count: usize| (v / stride).round().clamp(0.0, (count - 1) as f32) as usize;
    (snap(y, self.stride_y, self.rows), snap(x, self.stride_x, self.columns))
  }

  /// 在 `(row, column)` 处按偏移量修正后的像素坐标
  fn refined(&self, row: usize, column: usize, part: usize) -> (f32, f32) {
    let (dy, dx) = self.offset(row, column, part);
    (
      column as f32 * self.stride_x + dx,
      row as f32 * self.stride_y + dy,
    )
  }

  /// 邻域内没有更高的值
  fn is_local_maximum(&self, row: usize, column: usize, part: usize, value: f32) -> bool {
    let rows = row.saturating_sub(LOCAL_MAXIMUM_RADIUS)..(row + LOCAL_MAXIMUM_RADIUS + 1).min(self.rows);
    let columns =
      column.saturating_sub(LOCAL_MAXIMUM_RADIUS)..(column + LOCAL_MAXIMUM_RADIUS + 1).min(self.columns);
    rows
      .flat_map(|y| columns.clone().map(move |x| (y, x)))
      .all(|(y, x)| self.heat(y, x, part) <= value)
  }

  /// 热力图值不低于 `logit` 的局部极大值，按置信度降序
  fn root_points(&self, logit: f32) -> Vec<RootPoint> {
    let mut roots = Vec::new();
    for row in 0..self.rows {
      for column in 0..self.columns {
        for part in 0..self.parts {
          let value = self.heat(row, column, part);
          if value < logit || !self.is_local_maximum(row, column, part, value) {
            continue;
          }
          let (x, y) = self.refined(row, column, part);
          trace!("根关键点 {}: ({:.1}, {:.1}) 热力值 {:.3}", part, x, y, value);
          roots.push(RootPoint {
            part,
            x,
            y,
            confidence: sigmoid(value) * 100.0,
          });
        }
      }
    }
    roots.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    roots
  }
}

/// 从下标 0 的节点出发深度优先展开骨架边，重复到达的节点不再展开
fn skeleton_edges(nodes: &[Option<SkeletonNode>]) -> Result<Vec<SkeletonEdge>, ConfigureError> {
  fn walk(
    nodes: &[Option<SkeletonNode>],
    index: usize,
    visited: &mut BTreeSet<usize>,
    edges: &mut Vec<SkeletonEdge>,
  ) -> Result<(), ConfigureError> {
    let node = nodes
      .get(index)
      .ok_or_else(|| ConfigureError::InvalidSkeleton(format!("关键点 {} 没有对应的节点", index)))?;
    let Some(node) = node else {
      return Ok(());
    };
    if !visited.insert(index) {
      return Ok(());
    }
    let source = node
      .id
      .ok_or_else(|| ConfigureError::InvalidSkeleton(format!("节点 {} 缺少 id", index)))?;
    for &target in &node.links {
      edges.push(SkeletonEdge {
        source: source as usize,
        target: target as usize,
      });
      walk(nodes, target as usize, visited, edges)?;
    }
    Ok(())
  }

  let mut edges = Vec::new();
  walk(nodes, 0, &mut BTreeSet::new(), &mut edges)?;
  Ok(edges)
}

/// PoseNet 多人姿态估计
///
/// 以热力图局部极大值为根，沿骨架边的位移向量逐个找到其余关键点。
#[derive(Debug, Clone)]
pub struct Posenet {
  config: BaseConfig,
  edges: Vec<SkeletonEdge>,
  connections: Vec<Connection>,
}

impl Default for Posenet {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(POSENET_DEFAULT_THRESHOLD),
      edges: Vec::new(),
      connections: Vec::new(),
    }
  }
}

impl Posenet {
  pub const NAME: &'static str = "posenet";

  pub fn new() -> Self {
    Self::default()
  }

  /// 沿骨架边补全关键点，`backwards` 时逆序遍历并沿边的反方向位移
  fn traverse(&self, maps: &PosenetMaps, pose: &mut PoseEstimation, backwards: bool) {
    let count = self.edges.len().min(maps.edges);
    for step in 0..count {
      let id = if backwards { count - 1 - step } else { step };
      let edge = self.edges[id];
      let (source, target) = if backwards {
        (edge.target, edge.source)
      } else {
        (edge.source, edge.target)
      };
      if source >= maps.parts || target >= maps.parts {
        continue;
      }
      let (sx, sy) = {
        let kp = &pose.keypoints[source];
        if kp.confidence == 0.0 || pose.keypoints[target].confidence != 0.0 {
          continue;
        }
        (kp.x, kp.y)
      };

      let (row, column) = maps.cell(sx, sy);
      let (dy, dx) = maps.displacement(row, column, id, backwards);
      let (mut x, mut y) = (sx + dx, sy + dy);
      for _ in 0..REFINEMENT_STEPS {
        let (row, column) = maps.cell(x, y);
        (x, y) = maps.refined(row, column, target);
      }
      x = x.clamp(0.0, maps.max_x);
      y = y.clamp(0.0, maps.max_y);

      let (row, column) = maps.cell(x, y);
      let confidence = sigmoid(maps.heat(row, column, target)) * 100.0;
      trace!("骨架边 {}: {} -> {} ({:.1}, {:.1})", id, source, target, x, y);
      let kp = &mut pose.keypoints[target];
      kp.x = x;
      kp.y = y;
      kp.confidence = confidence;
      pose.confidence += confidence / maps.parts as f32;
    }
  }

  fn seed_pose(labels: &LabelTable, parts: usize, root: &RootPoint) -> PoseEstimation {
    let mut keypoints: Vec<Keypoint> = (0..parts as i32)
      .map(|part| Keypoint {
        name: labels.name(part).to_string(),
        x: 0.0,
        y: 0.0,
        confidence: 0.0,
        color: labels.color(part),
      })
      .collect();
    let seed = &mut keypoints[root.part];
    seed.x = root.x;
    seed.y = root.y;
    seed.confidence = root.confidence;
    PoseEstimation {
      confidence: root.confidence / parts as f32,
      keypoints,
      links: None,
    }
  }
}

impl Decoder for Posenet {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::PoseEstimation).signature(
      &[TensorType::Float32],
      vec![
        tensor_dims![1, [5, 251], [5, 251], [1, 17]],
        tensor_dims![1, [5, 251], [5, 251], [2, 34]],
        tensor_dims![1, [5, 251], [5, 251], [4, 64]],
      ],
    )
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    let settings = self.config.configure(Self::NAME, labels, settings)?;
    let nodes = settings
      .skeleton
      .ok_or(ConfigureError::MissingTable("posenet"))?;
    self.edges = skeleton_edges(&nodes)?;
    self.connections = nodes
      .iter()
      .flatten()
      .filter_map(|node| {
        Some(Connection {
          id: node.id?,
          connection: node.connection?,
        })
      })
      .collect();
    debug!(
      "{}: {} 条骨架边, {} 条连线",
      Self::NAME,
      self.edges.len(),
      self.connections.len()
    );
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::PoseEstimation)?;
    expect_tensor_count(tensors, 3, "3")?;
    let region = params.region()?;
    let resolution = params.resolution()?;
    let maps =
      PosenetMaps::new(tensors, resolution).ok_or_else(|| ProcessError::unsupported(tensors))?;

    // 阈值换算到 sigmoid 之前的热力值
    let threshold = self.config.threshold;
    let logit = (threshold / (1.0 - threshold)).ln();
    let links: Vec<KeypointLink> = self
      .connections
      .iter()
      .filter(|c| (c.id as usize) < maps.parts && (c.connection as usize) < maps.parts)
      .map(|c| KeypointLink {
        from: c.id as usize,
        to: c.connection as usize,
      })
      .collect();

    let mut poses: Vec<PoseEstimation> = Vec::new();
    for root in maps.root_points(logit) {
      let mut pose = Self::seed_pose(&self.config.labels, maps.parts, &root);
      self.traverse(&maps, &mut pose, true);
      self.traverse(&maps, &mut pose, false);

      match suppress_pose(&pose, &poses, POSE_NMS_RADIUS) {
        NmsVerdict::Reject => continue,
        NmsVerdict::Evict(idx) => {
          poses.remove(idx);
        }
        NmsVerdict::Accept => {}
      }
      pose.links = Some(links.clone());
      poses.push(pose);
    }

    for pose in poses.iter_mut() {
      for kp in pose.keypoints.iter_mut() {
        kp.x = region.normalize_x(kp.x);
        kp.y = region.normalize_y(kp.y);
      }
    }
    debug!("{}: 输出 {} 个姿态", Self::NAME, poses.len());
    output.poses_mut()?.extend(poses);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{geometry::Region, tensor::OwnedTensor};

  const SKELETON: &str = r#"{"confidence": 50, "posenet": [
    {"id": 0, "links": [1], "connection": 1},
    {"id": 1}
  ]}"#;

  fn configured() -> Posenet {
    let mut decoder = Posenet::new();
    decoder
      .configure(&LabelsSource::Inline("nose\neye".to_string()), SKELETON)
      .unwrap();
    decoder
  }

  /// 3×3 网格、2 个关键点、1 条骨架边，输入 9×9 时网格间距为 4 像素
  fn maps(root_heat: f32) -> [OwnedTensor; 3] {
    let mut heatmap = vec![-10.0f32; 3 * 3 * 2];
    heatmap[(3 + 1) * 2] = root_heat;
    heatmap[(2 * 3 + 2) * 2 + 1] = -1.0;

    let mut offsets = vec![0.0f32; 3 * 3 * 4];
    // 单元 (1, 1) 的关键点 0：dy = 0.5, dx = -0.5
    offsets[(3 + 1) * 4] = 0.5;
    offsets[(3 + 1) * 4 + 2] = -0.5;
    // 单元 (2, 2) 的关键点 1：dy = -1, dx = -0.5
    offsets[(2 * 3 + 2) * 4 + 1] = -1.0;
    offsets[(2 * 3 + 2) * 4 + 3] = -0.5;

    let mut displacements = vec![0.0f32; 3 * 3 * 4];
    // 单元 (1, 1) 的正向位移
    displacements[(3 + 1) * 4] = 4.0;
    displacements[(3 + 1) * 4 + 1] = 4.0;

    [
      OwnedTensor::from_f32(vec![1, 3, 3, 2], &heatmap).unwrap(),
      OwnedTensor::from_f32(vec![1, 3, 3, 4], &offsets).unwrap(),
      OwnedTensor::from_f32(vec![1, 3, 3, 4], &displacements).unwrap(),
    ]
  }

  fn decode(decoder: &mut Posenet, tensors: &[OwnedTensor]) -> Vec<PoseEstimation> {
    let views: Vec<_> = tensors.iter().map(OwnedTensor::view).collect();
    let params = Params::with_geometry(Region::new(0, 0, 9, 9), Resolution::new(9, 9));
    let mut output = Output::PoseEstimations(Vec::new());
    decoder.process(&views, &params, &mut output).unwrap();
    let Output::PoseEstimations(poses) = output else {
      unreachable!()
    };
    poses
  }

  #[test]
  fn follows_displacement_from_root() {
    let poses = decode(&mut configured(), &maps(2.0));
    assert_eq!(poses.len(), 1);
    let pose = &poses[0];

    let nose = &pose.keypoints[0];
    assert_eq!(nose.name, "nose");
    assert!((nose.x - 3.5 / 9.0).abs() < 1e-6);
    assert!((nose.y - 4.5 / 9.0).abs() < 1e-6);
    assert!((nose.confidence - sigmoid(2.0) * 100.0).abs() < 1e-4);

    // 位移到 (7.5, 8.5)，落入单元 (2, 2) 后按偏移修正为 (7.5, 7)
    let eye = &pose.keypoints[1];
    assert!((eye.x - 7.5 / 9.0).abs() < 1e-6);
    assert!((eye.y - 7.0 / 9.0).abs() < 1e-6);
    assert!((eye.confidence - sigmoid(-1.0) * 100.0).abs() < 1e-4);

    let expected = (nose.confidence + eye.confidence) / 2.0;
    assert!((pose.confidence - expected).abs() < 1e-4);
    assert_eq!(pose.links.as_ref().unwrap(), &vec![KeypointLink { from: 0, to: 1 }]);
  }

  #[test]
  fn root_at_threshold_is_kept() {
    let poses = decode(&mut configured(), &maps(0.0));
    assert_eq!(poses.len(), 1);
    assert!((poses[0].keypoints[0].confidence - 50.0).abs() < 1e-4);

    assert!(decode(&mut configured(), &maps(-0.01)).is_empty());
  }

  #[test]
  fn skeleton_table_is_required_and_checked() {
    let mut decoder = Posenet::new();
    let labels = LabelsSource::Inline("nose".to_string());
    assert!(matches!(
      decoder.configure(&labels, r#"{"confidence": 50}"#),
      Err(ConfigureError::MissingTable("posenet"))
    ));
    assert!(matches!(
      decoder.configure(&labels, r#"{"posenet": [{"id": 0, "links": [4]}]}"#),
      Err(ConfigureError::InvalidSkeleton(_))
    ));
    assert!(matches!(
      decoder.configure(&labels, r#"{"posenet": [{"links": [0]}]}"#),
      Err(ConfigureError::InvalidSkeleton(_))
    ));
  }

  #[test]
  fn cyclic_skeleton_terminates() {
    let nodes = vec![
      Some(SkeletonNode {
        id: Some(0),
        links: vec![1],
        connection: None,
      }),
      Some(SkeletonNode {
        id: Some(1),
        links: vec![0],
        connection: None,
      }),
    ];
    let edges = skeleton_edges(&nodes).unwrap();
    assert_eq!(
      edges,
      vec![
        SkeletonEdge { source: 0, target: 1 },
        SkeletonEdge { source: 1, target: 0 }
      ]
    );
  }

  #[test]
  fn mismatched_grids_are_rejected() {
    let mut decoder = configured();
    let [heatmap, _, displacements] = maps(2.0);
    let offsets = OwnedTensor::from_f32(vec![1, 3, 3, 2], &[0.0; 18]).unwrap();
    let views = [heatmap.view(), offsets.view(), displacements.view()];
    let params = Params::with_geometry(Region::new(0, 0, 9, 9), Resolution::new(9, 9));
    let mut output = Output::PoseEstimations(Vec::new());
    assert!(matches!(
      decoder.process(&views, &params, &mut output),
      Err(ProcessError::UnsupportedShape(_))
    ));
  }
}
