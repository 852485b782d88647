// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/deeplab_argmax.rs - 逐像素 argmax 分割着色
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

use tracing::{debug, info};

use crate::{
  caps::{Caps, tensor_dims},
  frame::VideoFrame,
  geometry::scale_u64_safe,
  labels::{LabelTable, LabelsSource},
  model::{ConfigureError, Decoder, ProcessError, expect_tensor_count},
  output::{Output, OutputKind},
  params::Params,
  scoring::argmax_last,
  settings::Settings,
  tensor::{Tensor, TensorError, TensorType},
};

/// 分割网络输出着色：`[1, H, W]` 为类别编号，`[1, H, W, C]` 为逐类别分数
#[derive(Debug, Clone, Default)]
pub struct DeeplabArgmax {
  labels: LabelTable,
}

impl DeeplabArgmax {
  pub const NAME: &'static str = "deeplab-argmax";

  pub fn new() -> Self {
    Self::default()
  }
}

/// 从张量网格中取出一个像素的类别编号
fn class_at(values: &[f32], base: usize, classes: usize) -> Result<i32, TensorError> {
  let out_of_bounds = || TensorError::OutOfBounds {
    index: base + classes - 1,
    len: values.len(),
  };
  let scores = values.get(base..base + classes).ok_or_else(out_of_bounds)?;
  if classes == 1 {
    return Ok(scores[0] as i32);
  }
  let (id, _) = argmax_last(scores).ok_or_else(out_of_bounds)?;
  Ok(id as i32)
}

fn write_color(pixel: &mut [u8], color: u32) {
  pixel[0] = (color >> 24) as u8;
  pixel[1] = (color >> 16) as u8;
  pixel[2] = (color >> 8) as u8;
  if let Some(alpha) = pixel.get_mut(3) {
    *alpha = color as u8;
  }
}

impl Decoder for DeeplabArgmax {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::ImageSegmentation)
      .signature(&[TensorType::Float32], vec![tensor_dims![1, [32, 2048], [32, 2048]]])
      .signature(
        &[TensorType::Float32],
        vec![tensor_dims![1, [32, 2048], [32, 2048], [1, 150]]],
      )
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    let table = LabelTable::load(labels)?;
    Settings::parse(settings)?;
    self.labels = table;
    info!("{}: 加载 {} 个标签", Self::NAME, self.labels.len());
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::ImageSegmentation)?;
    expect_tensor_count(tensors, 1, "1")?;
    let tensor = &tensors[0];
    let (grid_height, grid_width, classes) = match (tensor.rank(), tensor.dim(1), tensor.dim(2)) {
      (3, Some(h), Some(w)) if tensor.dim(0) == Some(1) => (h, w, 1),
      (4, Some(h), Some(w)) if tensor.dim(0) == Some(1) => (h, w, tensor.dim(3).unwrap_or(0)),
      _ => return Err(ProcessError::unsupported(tensors)),
    };
    if grid_height == 0 || grid_width == 0 || classes == 0 {
      return Err(ProcessError::unsupported(tensors));
    }

    let region = params.region()?;
    let resolution = params.resolution()?;
    // 区域换算到张量网格
    let crop = region.rescale(resolution, grid_width as u32, grid_height as u32);
    // 每个输出像素采样的网格坐标都落在 [x, x + max(width, 1)) 内
    let fits = |start: u32, extent: u32, limit: usize| {
      start as u64 + extent.max(1) as u64 <= limit as u64
    };
    if !fits(crop.x, crop.width, grid_width) || !fits(crop.y, crop.height, grid_height) {
      return Err(ProcessError::RegionOutsideGrid {
        region: crop,
        width: grid_width,
        height: grid_height,
      });
    }
    let values = tensor.to_f32_vec();

    let frame: &mut VideoFrame = output.frame_mut()?;
    let (width, height) = (frame.width(), frame.height());
    let bpp = frame.format().bytes_per_pixel();

    for row in 0..height {
      let grid_y = crop.y as u64 + scale_u64_safe(row as u64, crop.height as u64, height as u64);
      let Some(line) = frame.row_mut(row) else {
        break;
      };
      for (col, pixel) in line.chunks_exact_mut(bpp).enumerate() {
        let grid_x = crop.x as u64 + scale_u64_safe(col as u64, crop.width as u64, width as u64);
        let base = (grid_y as usize * grid_width + grid_x as usize) * classes;
        let id = class_at(&values, base, classes)?;
        write_color(pixel, self.labels.color(id));
      }
    }

    debug!(
      "{}: {}x{} 网格着色到 {}x{} 帧",
      Self::NAME,
      grid_width,
      grid_height,
      width,
      height
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::VideoFormat,
    geometry::{Region, Resolution},
    tensor::OwnedTensor,
  };

  const LABELS: &str = r#"[
    {"id": 0, "label": "background", "color": "0x00000000"},
    {"id": 1, "label": "person", "color": "0xFF000080"},
    {"id": 2, "label": "car", "color": "0x00FF00FF"}
  ]"#;

  fn configured() -> DeeplabArgmax {
    let mut decoder = DeeplabArgmax::new();
    decoder
      .configure(&LabelsSource::Inline(LABELS.to_string()), "")
      .unwrap();
    decoder
  }

  fn params() -> Params {
    Params::with_geometry(Region::new(0, 0, 4, 4), Resolution::new(4, 4))
  }

  #[test]
  fn colors_class_id_grid() {
    let mut decoder = configured();
    #[rustfmt::skip]
    let ids = [
      0.0, 0.0, 1.0, 1.0,
      0.0, 0.0, 1.0, 1.0,
      2.0, 2.0, 0.0, 0.0,
      2.0, 2.0, 0.0, 0.0,
    ];
    let tensor = OwnedTensor::from_f32(vec![1, 4, 4], &ids).unwrap();
    let mut output = Output::VideoFrame(VideoFrame::new(2, 2, VideoFormat::Rgba8888));
    decoder.process(&[tensor.view()], &params(), &mut output).unwrap();
    let Output::VideoFrame(frame) = output else {
      unreachable!()
    };
    assert_eq!(frame.pixel(0, 0), Some(&[0, 0, 0, 0][..]));
    assert_eq!(frame.pixel(1, 0), Some(&[0xFF, 0, 0, 0x80][..]));
    assert_eq!(frame.pixel(0, 1), Some(&[0, 0xFF, 0, 0xFF][..]));
  }

  #[test]
  fn argmax_ties_favor_higher_class() {
    let mut decoder = configured();
    let scores = [0.2, 0.5, 0.5];
    let tensor = OwnedTensor::from_f32(vec![1, 1, 1, 3], &scores).unwrap();
    let params = Params::with_geometry(Region::new(0, 0, 1, 1), Resolution::new(1, 1));
    let mut output = Output::VideoFrame(VideoFrame::new(1, 1, VideoFormat::Rgb888));
    decoder.process(&[tensor.view()], &params, &mut output).unwrap();
    let Output::VideoFrame(frame) = output else {
      unreachable!()
    };
    assert_eq!(frame.pixel(0, 0), Some(&[0, 0xFF, 0][..]));
  }

  #[test]
  fn crop_past_grid_edge_is_rejected_before_writing() {
    let mut decoder = configured();
    let tensor = OwnedTensor::from_f32(vec![1, 4, 4], &[1.0; 16]).unwrap();
    let mut output = Output::VideoFrame(VideoFrame::new(2, 2, VideoFormat::Rgba8888));

    // 右侧越界
    let params = Params::with_geometry(Region::new(2, 0, 4, 4), Resolution::new(4, 4));
    let err = decoder
      .process(&[tensor.view()], &params, &mut output)
      .unwrap_err();
    assert!(matches!(
      err,
      ProcessError::RegionOutsideGrid {
        width: 4,
        height: 4,
        ..
      }
    ));

    // 下方越界，帧保持未写入
    let params = Params::with_geometry(Region::new(0, 3, 4, 4), Resolution::new(4, 4));
    assert!(matches!(
      decoder.process(&[tensor.view()], &params, &mut output),
      Err(ProcessError::RegionOutsideGrid { .. })
    ));
    let Output::VideoFrame(frame) = output else {
      unreachable!()
    };
    assert_eq!(frame.pixel(0, 0), Some(&[0, 0, 0, 0][..]));
    assert_eq!(frame.pixel(1, 1), Some(&[0, 0, 0, 0][..]));
  }

  #[test]
  fn requires_frame_container() {
    let mut decoder = configured();
    let tensor = OwnedTensor::from_f32(vec![1, 1, 1], &[0.0]).unwrap();
    let mut output = Output::ImageClassifications(Vec::new());
    assert!(matches!(
      decoder.process(&[tensor.view()], &params(), &mut output),
      Err(ProcessError::OutputMismatch(_))
    ));
  }
}
