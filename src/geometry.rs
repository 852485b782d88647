// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 区域、分辨率与坐标变换
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryParseError {
  #[error("无法解析区域 '{0}'，格式应为 x,y,宽,高")]
  Region(String),
  #[error("无法解析分辨率 '{0}'，格式应为 宽x高")]
  Resolution(String),
}

/// 模型输入张量的分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

impl Resolution {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }
}

impl FromStr for Resolution {
  type Err = GeometryParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let err = || GeometryParseError::Resolution(s.to_string());
    let (w, h) = s.split_once(['x', 'X']).ok_or_else(err)?;
    Ok(Self {
      width: w.trim().parse().map_err(|_| err())?,
      height: h.trim().parse().map_err(|_| err())?,
    })
  }
}

/// 送入模型的源帧裁剪区域，单位为像素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl Region {
  pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 覆盖整个输入分辨率的区域
  pub const fn full(resolution: Resolution) -> Self {
    Self::new(0, 0, resolution.width, resolution.height)
  }

  pub fn left(&self) -> f32 {
    self.x as f32
  }

  pub fn top(&self) -> f32 {
    self.y as f32
  }

  pub fn right(&self) -> f32 {
    (self.x as u64 + self.width as u64) as f32
  }

  pub fn bottom(&self) -> f32 {
    (self.y as u64 + self.height as u64) as f32
  }

  /// 将像素横坐标映射到区域内的归一化坐标
  pub fn normalize_x(&self, x: f32) -> f32 {
    (x - self.left()) / self.width as f32
  }

  /// 将像素纵坐标映射到区域内的归一化坐标
  pub fn normalize_y(&self, y: f32) -> f32 {
    (y - self.top()) / self.height as f32
  }

  /// 将区域从 `from` 分辨率缩放到 `width × height` 的网格
  pub fn rescale(&self, from: Resolution, width: u32, height: u32) -> Region {
    let sx = width as f32 / from.width as f32;
    let sy = height as f32 / from.height as f32;
    Region {
      x: (self.x as f32 * sx) as u32,
      y: (self.y as f32 * sy) as u32,
      width: (self.width as f32 * sx) as u32,
      height: (self.height as f32 * sy) as u32,
    }
  }
}

impl FromStr for Region {
  type Err = GeometryParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let err = || GeometryParseError::Region(s.to_string());
    let values = s
      .split(',')
      .map(|v| v.trim().parse::<u32>().map_err(|_| err()))
      .collect::<Result<Vec<_>, _>>()?;
    match values.as_slice() {
      &[x, y, width, height] => Ok(Region::new(x, y, width, height)),
      _ => Err(err()),
    }
  }
}

/// 轴对齐包围框的四条边
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoxCorners {
  pub top: f32,
  pub left: f32,
  pub bottom: f32,
  pub right: f32,
}

impl BoxCorners {
  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    Self {
      top: cy - height / 2.0,
      left: cx - width / 2.0,
      bottom: cy + height / 2.0,
      right: cx + width / 2.0,
    }
  }

  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  /// 限制在区域的像素范围内
  pub fn clamp_to(self, region: &Region) -> Self {
    let cx = |v: f32| v.max(region.left()).min(region.right());
    let cy = |v: f32| v.max(region.top()).min(region.bottom());
    Self {
      top: cy(self.top),
      left: cx(self.left),
      bottom: cy(self.bottom),
      right: cx(self.right),
    }
  }

  /// 从像素坐标转换到区域归一化坐标
  pub fn normalize(self, region: &Region) -> Self {
    Self {
      top: region.normalize_y(self.top),
      left: region.normalize_x(self.left),
      bottom: region.normalize_y(self.bottom),
      right: region.normalize_x(self.right),
    }
  }

  /// 四条边是否都落在 [0, 1] 内
  pub fn is_normalized(&self) -> bool {
    [self.top, self.left, self.bottom, self.right]
      .iter()
      .all(|v| (0.0..=1.0).contains(v))
  }
}

/// 计算 `value × numerator / denominator`，在乘法可能溢出时拆分计算
///
/// 分母为 0 时返回 `u64::MAX`。
pub fn scale_u64_safe(value: u64, numerator: u64, denominator: u64) -> u64 {
  if denominator == 0 {
    return u64::MAX;
  }

  if numerator == 0 || value < u64::MAX / numerator {
    return value * numerator / denominator;
  }

  let whole = (value / denominator).saturating_mul(numerator);
  let rest = (value % denominator) as u128 * numerator as u128 / denominator as u128;
  whole.saturating_add(rest as u64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_region_and_resolution() {
    assert_eq!("10,20,300,400".parse::<Region>().unwrap(), Region::new(10, 20, 300, 400));
    assert_eq!("640x480".parse::<Resolution>().unwrap(), Resolution::new(640, 480));
    assert!("1,2,3".parse::<Region>().is_err());
    assert!("640*480".parse::<Resolution>().is_err());
  }

  #[test]
  fn normalizes_relative_to_region() {
    let region = Region::new(100, 50, 200, 100);
    let b = BoxCorners {
      top: 50.0,
      left: 100.0,
      bottom: 100.0,
      right: 300.0,
    }
    .normalize(&region);
    assert_eq!(b.top, 0.0);
    assert_eq!(b.left, 0.0);
    assert_eq!(b.bottom, 0.5);
    assert_eq!(b.right, 1.0);
    assert!(b.is_normalized());
  }

  #[test]
  fn clamps_to_region_pixels() {
    let region = Region::new(10, 10, 20, 20);
    let b = BoxCorners::from_center(10.0, 10.0, 10.0, 10.0).clamp_to(&region);
    assert_eq!(b.left, 10.0);
    assert_eq!(b.top, 10.0);
    assert_eq!(b.right, 15.0);
  }

  #[test]
  fn far_edges_do_not_overflow() {
    let region = Region::new(u32::MAX - 1, u32::MAX, 10, u32::MAX);
    assert_eq!(region.right(), (u32::MAX as u64 + 9) as f32);
    assert_eq!(region.bottom(), (2 * u32::MAX as u64) as f32);
  }

  #[test]
  fn scale_safe_matches_exact_arithmetic() {
    assert_eq!(scale_u64_safe(10, 3, 2), 15);
    assert_eq!(scale_u64_safe(7, 0, 2), 0);
    assert_eq!(scale_u64_safe(5, 1, 0), u64::MAX);

    let value = 1u64 << 63;
    let exact = (value as u128 * 3 / 2) as u64;
    assert_eq!(scale_u64_safe(value, 3, 2), exact);

    let value = u64::MAX - 1;
    let exact = value as u128 * 2 / 3;
    assert_eq!(scale_u64_safe(value, 2, 3) as u128, exact);
  }
}
