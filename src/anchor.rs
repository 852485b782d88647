// 该文件是 Shanan （山南西风） 项目的一部分。
// src/anchor.rs - 锚点网格
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

use tracing::debug;

use crate::geometry::Resolution;

/// 锚点中心，单位为模型输入像素
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
  pub cx: f32,
  pub cy: f32,
}

/// 一层锚点：步长与每个网格单元的锚点数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorLevel {
  pub stride: u32,
  pub per_cell: u32,
}

impl AnchorLevel {
  pub const fn new(stride: u32, per_cell: u32) -> Self {
    Self { stride, per_cell }
  }
}

/// 按层、行、列、单元内序号的顺序生成锚点
///
/// 该顺序与模型输出张量的行顺序一致，解码时按行号直接索引。
pub fn generate_anchors(levels: &[AnchorLevel], resolution: Resolution) -> Vec<Anchor> {
  let mut anchors = Vec::new();
  for level in levels {
    if level.stride == 0 {
      continue;
    }
    let rows = resolution.height / level.stride;
    let cols = resolution.width / level.stride;
    let stride = level.stride as f32;
    for y in 0..rows {
      for x in 0..cols {
        let anchor = Anchor {
          cx: (x as f32 + 0.5) * stride,
          cy: (y as f32 + 0.5) * stride,
        };
        anchors.extend(std::iter::repeat_n(anchor, level.per_cell as usize));
      }
    }
  }
  anchors
}

/// 解码器实例持有的锚点缓存，以分辨率为键，分辨率变化时重建
#[derive(Debug, Clone)]
pub struct AnchorGrid {
  levels: &'static [AnchorLevel],
  key: Option<Resolution>,
  anchors: Vec<Anchor>,
}

impl AnchorGrid {
  pub const fn new(levels: &'static [AnchorLevel]) -> Self {
    Self {
      levels,
      key: None,
      anchors: Vec::new(),
    }
  }

  pub fn anchors(&mut self, resolution: Resolution) -> &[Anchor] {
    if self.key != Some(resolution) {
      self.anchors = generate_anchors(self.levels, resolution);
      self.key = Some(resolution);
      debug!(
        "为分辨率 {}x{} 生成 {} 个锚点",
        resolution.width,
        resolution.height,
        self.anchors.len()
      );
    }
    &self.anchors
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const LEVELS: [AnchorLevel; 2] = [AnchorLevel::new(8, 2), AnchorLevel::new(16, 6)];

  #[test]
  fn mediapipe_pose_grid_has_896_anchors() {
    let anchors = generate_anchors(&LEVELS, Resolution::new(128, 128));
    assert_eq!(anchors.len(), 16 * 16 * 2 + 8 * 8 * 6);
    assert_eq!(anchors[0], Anchor { cx: 4.0, cy: 4.0 });
    assert_eq!(anchors[1], Anchor { cx: 4.0, cy: 4.0 });
    assert_eq!(anchors[2], Anchor { cx: 12.0, cy: 4.0 });
    assert_eq!(anchors[512], Anchor { cx: 8.0, cy: 8.0 });
  }

  #[test]
  fn generation_is_deterministic() {
    let res = Resolution::new(192, 192);
    assert_eq!(generate_anchors(&LEVELS, res), generate_anchors(&LEVELS, res));
  }

  #[test]
  fn grid_rebuilds_when_resolution_changes() {
    static LEVELS_STATIC: [AnchorLevel; 1] = [AnchorLevel::new(16, 1)];
    let mut grid = AnchorGrid::new(&LEVELS_STATIC);
    assert_eq!(grid.anchors(Resolution::new(32, 32)).len(), 4);
    assert_eq!(grid.anchors(Resolution::new(64, 32)).len(), 8);
    assert_eq!(grid.anchors(Resolution::new(64, 32)).len(), 8);
  }
}
