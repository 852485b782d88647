// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/tensor_passthrough.rs - 手部关键点张量透传
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

use crate::{
  caps::{Caps, tensor_dims},
  labels::LabelsSource,
  model::{ConfigureError, Decoder, ProcessError, expect_tensor_count},
  output::{Output, OutputKind},
  params::Params,
  settings::Settings,
  tensor::{OwnedTensor, Tensor, TensorType},
};

/// 输出张量下标到输入张量下标：坐标、左右手、世界坐标
const ROUTES: [(usize, usize); 3] = [(0, 0), (1, 2), (2, 3)];

/// 将手部关键点模型的部分输出原样复制到预先分配的输出张量
#[derive(Debug, Clone, Default)]
pub struct TensorPassthrough;

impl TensorPassthrough {
  pub const NAME: &'static str = "tensor-passthrough";

  pub fn new() -> Self {
    Self
  }
}

fn copy_into(index: usize, input: &Tensor<'_>, output: &mut OwnedTensor) -> Result<(), ProcessError> {
  if input.kind() != output.kind() || input.len() != output.len() {
    tracing::error!("输出张量 {} 的类型或大小与输入不一致", index);
    return Err(ProcessError::TensorMismatch {
      index,
      input: format!("{} {:?}", input.kind(), input.dims()),
      output: format!("{} {:?}", output.kind(), output.dims()),
    });
  }
  output.as_bytes_mut().copy_from_slice(input.as_bytes());
  Ok(())
}

impl Decoder for TensorPassthrough {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::Tensor).signature(
      &[TensorType::Float32],
      vec![
        tensor_dims![1, 63],
        tensor_dims![1, 1],
        tensor_dims![1, 1],
        tensor_dims![1, 63],
      ],
    )
  }

  /// 不需要标签，配置只做格式校验
  fn configure(&mut self, _labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    Settings::parse(settings)?;
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    _params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::Tensor)?;
    expect_tensor_count(tensors, 4, "4")?;
    if tensors[0].dim(1) != tensors[3].dim(1) {
      tracing::error!(
        "坐标与世界坐标张量的第二维不一致: {:?} != {:?}",
        tensors[0].dim(1),
        tensors[3].dim(1)
      );
      return Err(ProcessError::unsupported(tensors));
    }

    let outputs = output.tensors_mut()?;
    if outputs.len() != ROUTES.len() {
      tracing::error!("输出张量数量应为 {}, 实际 {}", ROUTES.len(), outputs.len());
      return Err(ProcessError::OutputTensorCount {
        expected: ROUTES.len(),
        actual: outputs.len(),
      });
    }

    for (out, input) in ROUTES {
      copy_into(out, &tensors[input], &mut outputs[out])?;
    }
    debug!("{}: 复制 {} 个张量", Self::NAME, ROUTES.len());
    Ok(())
  }
}
