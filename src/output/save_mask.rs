// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/save_mask.rs - 分割结果保存为图像文件
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
use tracing::warn;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{VideoFormat, VideoFrame},
};

pub struct SaveMaskOutput {
  path: PathBuf,
}

#[derive(Error, Debug)]
pub enum SaveMaskError {
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveMaskOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveMaskOutput {
  type Error = SaveMaskError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveMaskError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(Self::new(uri.path()))
  }
}

/// 按像素读取帧，缺失的像素写为 0
fn channel(frame: &VideoFrame, x: u32, y: u32, c: usize) -> u8 {
  frame
    .pixel(x, y)
    .and_then(|p| p.get(c).copied())
    .unwrap_or(0)
}

impl SaveMaskOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// RGBA 帧保留透明度，RGB 与 RGBx 帧保存为 RGB
  pub fn write(&self, frame: &VideoFrame) -> Result<(), SaveMaskError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent).map_err(SaveMaskError::IoError)?;
    }

    let (width, height) = (frame.width(), frame.height());
    let saved = match frame.format() {
      VideoFormat::Rgba8888 => image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba(std::array::from_fn(|c| channel(frame, x, y, c)))
      })
      .save(&self.path),
      VideoFormat::Rgb888 | VideoFormat::Rgbx8888 => {
        image::RgbImage::from_fn(width, height, |x, y| {
          image::Rgb(std::array::from_fn(|c| channel(frame, x, y, c)))
        })
        .save(&self.path)
      }
    };
    saved.map_err(SaveMaskError::ImageError)?;

    warn!("保存分割结果到文件: {}", self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn requires_image_scheme() {
    let url = Url::parse("file:///tmp/mask.png").unwrap();
    assert!(matches!(
      SaveMaskOutput::from_url(&url),
      Err(SaveMaskError::SchemeMismatch(_))
    ));
    let url = Url::parse("image:///tmp/mask.png").unwrap();
    assert_eq!(SaveMaskOutput::from_url(&url).unwrap().path(), Path::new("/tmp/mask.png"));
  }

  #[test]
  fn writes_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/mask.png");
    let mut frame = VideoFrame::new(2, 1, VideoFormat::Rgba8888);
    if let Some(row) = frame.row_mut(0) {
      row.copy_from_slice(&[255, 0, 0, 128, 0, 255, 0, 255]);
    }
    SaveMaskOutput::new(&path).write(&frame).unwrap();

    let saved = image::open(&path).unwrap().to_rgba8();
    assert_eq!(saved.dimensions(), (2, 1));
    assert_eq!(saved.get_pixel(0, 0).0, [255, 0, 0, 128]);
  }
}
