// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/decode_tensors.rs - 从原始张量文件解码推理结果
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

use std::{path::PathBuf, str::FromStr};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;
use url::Url;

use shanan_postprocess::{
  FromUrl,
  frame::{VideoFormat, VideoFrame},
  geometry::{Region, Resolution},
  model::{Decoder, DecoderBuilder},
  output::{Output, OutputKind},
  params::Params,
  task::{BatchTask, Task},
  tensor::{OwnedTensor, Tensor, TensorType},
};

/// 张量描述：`<类型>:<d0>x<d1>..`，可带 `:<文件路径>`
#[derive(Debug, Clone)]
struct TensorSpec {
  kind: TensorType,
  dims: Vec<u32>,
  path: Option<PathBuf>,
}

impl FromStr for TensorSpec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut parts = s.splitn(3, ':');
    let kind = parts
      .next()
      .unwrap_or_default()
      .parse::<TensorType>()
      .map_err(|e| e.to_string())?;
    let dims = parts
      .next()
      .ok_or_else(|| format!("张量描述缺少维度: {}", s))?
      .split('x')
      .map(|d| d.trim().parse::<u32>().map_err(|e| format!("维度 '{}' 无效: {}", d, e)))
      .collect::<Result<Vec<_>, _>>()?;
    let path = parts.next().map(PathBuf::from);
    Ok(Self { kind, dims, path })
  }
}

/// 张量解码工具参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 解码器，例如 decoder://ssd-mobilenet?labels=/path/labels.json
  #[arg(long, value_name = "DECODER")]
  pub decoder: Url,

  /// 输入张量，格式 <类型>:<d0>x<d1>..:<文件路径>，按模型输出顺序给出
  #[arg(long = "tensor", value_name = "TENSOR")]
  tensors: Vec<TensorSpec>,

  /// 预先分配的输出张量，格式 <类型>:<d0>x<d1>..，仅用于张量输出
  #[arg(long = "output-tensor", value_name = "TENSOR")]
  output_tensors: Vec<TensorSpec>,

  /// 模型输入在源图像中的区域 x,y,w,h，缺省为整幅图像
  #[arg(long, value_name = "REGION")]
  pub region: Option<Region>,

  /// 源图像分辨率 WxH
  #[arg(long, value_name = "RESOLUTION")]
  pub resolution: Resolution,

  /// 分割掩码尺寸 WxH
  #[arg(long, value_name = "SIZE")]
  pub mask: Option<Resolution>,

  /// 分割掩码保存路径，例如 image:///tmp/mask.png
  #[arg(long, value_name = "OUTPUT")]
  pub mask_output: Option<Url>,

  /// 只打印解码器的能力描述
  #[arg(long)]
  pub caps: bool,
}

fn load_tensors(specs: &[TensorSpec]) -> Result<Vec<OwnedTensor>> {
  specs
    .iter()
    .map(|spec| {
      let path = spec
        .path
        .as_ref()
        .with_context(|| format!("输入张量 {:?} 缺少文件路径", spec.dims))?;
      let data = std::fs::read(path).with_context(|| format!("无法读取张量文件 {}", path.display()))?;
      info!("读取张量 {} {:?}: {}", spec.kind, spec.dims, path.display());
      Ok(OwnedTensor::from_bytes(spec.kind, spec.dims.clone(), data)?)
    })
    .collect()
}

fn tensor_json(tensor: &OwnedTensor) -> Value {
  json!({
    "type": tensor.kind(),
    "dimensions": tensor.dims(),
    "data": tensor.view().to_f32_vec(),
  })
}

fn list_json(output: &Output) -> Result<Value> {
  Ok(match output {
    Output::ObjectDetections(v) => serde_json::to_value(v)?,
    Output::PoseEstimations(v) => serde_json::to_value(v)?,
    Output::ImageClassifications(v) | Output::AudioClassifications(v) => serde_json::to_value(v)?,
    Output::VideoFrame(frame) => json!({ "width": frame.width(), "height": frame.height() }),
    Output::Tensors(v) => Value::Array(v.iter().map(tensor_json).collect()),
  })
}

#[cfg(feature = "save_mask")]
fn save_mask(url: &Url, frame: &VideoFrame) -> Result<()> {
  shanan_postprocess::output::SaveMaskOutput::from_url(url)?.write(frame)?;
  Ok(())
}

#[cfg(not(feature = "save_mask"))]
fn save_mask(url: &Url, _frame: &VideoFrame) -> Result<()> {
  bail!("未启用 save_mask 特性，无法保存 {}", url)
}

fn decode_single(
  decoder: &mut dyn Decoder,
  tensors: &[Tensor<'_>],
  params: &Params,
  args: &Args,
  kind: OutputKind,
) -> Result<Value> {
  let mut output = match kind {
    OutputKind::ImageSegmentation => {
      let size = args.mask.unwrap_or(args.resolution);
      Output::VideoFrame(VideoFrame::new(size.width, size.height, VideoFormat::Rgba8888))
    }
    _ => {
      let outputs = args
        .output_tensors
        .iter()
        .map(|spec| OwnedTensor::zeroed(spec.kind, spec.dims.clone()))
        .collect::<Result<Vec<_>, _>>()?;
      Output::Tensors(outputs)
    }
  };

  let now = std::time::Instant::now();
  decoder.process(tensors, params, &mut output)?;
  info!("解码完成，耗时: {:.2?}", now.elapsed());

  if let (Output::VideoFrame(frame), Some(url)) = (&output, &args.mask_output) {
    save_mask(url, frame)?;
  }
  list_json(&output)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("解码器: {}", args.decoder);

  let mut decoder = DecoderBuilder::from_url(&args.decoder)?.build()?;
  let caps = decoder.caps();
  if args.caps {
    println!("{}", caps.to_json()?);
    return Ok(());
  }

  let owned = load_tensors(&args.tensors)?;
  let tensors: Vec<Tensor<'_>> = owned.iter().map(OwnedTensor::view).collect();
  // 列表类输出由 BatchTask 逐批次解码，其余输出只接受单个批次
  let batched = Output::empty(caps.kind).is_some();
  let accepted = if batched {
    caps.matches_batched(&tensors)
  } else {
    caps.matches(&tensors)
  };
  if !accepted {
    bail!("输入张量与解码器 {} 的能力描述不匹配", decoder.name());
  }

  let region = args.region.unwrap_or(Region::full(args.resolution));
  let params = Params::with_geometry(region, args.resolution);

  let result = if batched {
    let outputs = BatchTask::new().run_task(decoder.as_mut(), &tensors, &params)?;
    Value::Array(outputs.iter().map(list_json).collect::<Result<Vec<_>>>()?)
  } else {
    decode_single(decoder.as_mut(), &tensors, &params, &args, caps.kind)?
  };

  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}
