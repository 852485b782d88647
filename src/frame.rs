// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 视频帧缓冲
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

use thiserror::Error;

/// 视频帧像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoFormat {
  Rgb888,
  Rgba8888,
  Rgbx8888,
}

impl VideoFormat {
  /// 每像素字节数
  pub const fn bytes_per_pixel(self) -> usize {
    match self {
      VideoFormat::Rgb888 => 3,
      VideoFormat::Rgba8888 | VideoFormat::Rgbx8888 => 4,
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("行跨度 {stride} 小于一行像素所需的 {required} 字节")]
  StrideTooSmall { stride: usize, required: usize },
}

/// 单平面视频帧，分割结果写入其中
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
  width: u32,
  height: u32,
  format: VideoFormat,
  stride: usize,
  data: Box<[u8]>,
}

impl VideoFrame {
  /// 分配紧凑排列、全零的帧
  pub fn new(width: u32, height: u32, format: VideoFormat) -> Self {
    let stride = width as usize * format.bytes_per_pixel();
    let data = vec![0u8; stride * height as usize].into_boxed_slice();
    Self {
      width,
      height,
      format,
      stride,
      data,
    }
  }

  /// 使用外部数据构造，允许行尾填充
  pub fn from_raw(
    width: u32,
    height: u32,
    format: VideoFormat,
    stride: usize,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let required = width as usize * format.bytes_per_pixel();
    if stride < required {
      return Err(FrameError::StrideTooSmall { stride, required });
    }

    let expected = stride * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      format,
      stride,
      data: data.into_boxed_slice(),
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn format(&self) -> VideoFormat {
    self.format
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  /// 第 `row` 行的像素字节，不含行尾填充
  pub fn row_mut(&mut self, row: u32) -> Option<&mut [u8]> {
    let start = row as usize * self.stride;
    let len = self.width as usize * self.format.bytes_per_pixel();
    self.data.get_mut(start..start + len)
  }

  /// 读取 `(col, row)` 处的像素字节
  pub fn pixel(&self, col: u32, row: u32) -> Option<&[u8]> {
    if col >= self.width {
      return None;
    }
    let bpp = self.format.bytes_per_pixel();
    let start = row as usize * self.stride + col as usize * bpp;
    self.data.get(start..start + bpp)
  }
}

impl AsRef<[u8]> for VideoFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for VideoFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}
