// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/face_recognition.rs - 人脸特征余弦相似度识别
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

use tracing::{debug, info, trace};

use crate::{
  caps::{Caps, tensor_dims},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  output::{Classification, Output, OutputKind},
  params::Params,
  scoring::{cosine_distance, cosine_similarity, softmax},
  template::FaceTemplate,
  tensor::{Tensor, TensorType},
};

const FACE_DEFAULT_THRESHOLD: f32 = 0.70;
const UNKNOWN_FACE: &str = "UNKNOWN";
const UNKNOWN_FACE_COLOR: u32 = 0xFF00_00FF;

/// 辅助张量的下标
const LIVELINESS_TENSOR: usize = 1;
const OPEN_EYES_TENSOR: usize = 2;
const GLASSES_TENSOR: usize = 3;
const MASK_TENSOR: usize = 4;
const SUNGLASSES_TENSOR: usize = 5;

/// 与模板库逐一比对的人脸识别
///
/// 输入依次为全脸特征 `[1, 512]`、活体特征 `[1, 32]` 以及睁眼、眼镜、口罩、墨镜四个二分类 `[1, 2]`。
/// 辅助判断只写入日志，不影响识别结果。
#[derive(Debug, Clone)]
pub struct FaceRecognition {
  config: BaseConfig,
  database: Vec<FaceTemplate>,
}

impl Default for FaceRecognition {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(FACE_DEFAULT_THRESHOLD),
      database: Vec::new(),
    }
  }
}

/// 最佳匹配的身份下标与相似度
#[derive(Debug, Clone, Copy, PartialEq)]
struct BestMatch {
  identity: Option<usize>,
  score: f32,
}

impl FaceRecognition {
  pub const NAME: &'static str = "face-recognition";

  pub fn new() -> Self {
    Self::default()
  }

  pub fn templates(&self) -> &[FaceTemplate] {
    &self.database
  }

  /// 每个身份取其全脸模板中的最高分，再在身份间取最高分，相等时后者胜出
  fn best_match(&self, features: &[f32]) -> BestMatch {
    let mut best = BestMatch {
      identity: None,
      score: 0.0,
    };
    for (id, face) in self.database.iter().enumerate() {
      let score = face
        .templates
        .iter()
        .map(|pair| cosine_similarity(features, &pair.whole))
        .fold(0.0f32, f32::max);
      trace!("模板 {} [{}] 得分 {:.4}", id, face.name, score);
      if score >= best.score {
        best = BestMatch {
          identity: Some(id),
          score,
        };
      }
    }
    best
  }

  /// 二分类张量中第二类的概率
  fn accessory_score(tensor: &Tensor<'_>) -> f32 {
    if tensor.dim(1) != Some(2) {
      return 0.0;
    }
    softmax(&tensor.to_f32_vec()).get(1).copied().unwrap_or(0.0)
  }

  fn log_attributes(&self, face: &FaceTemplate, tensors: &[Tensor<'_>]) {
    let threshold = self.config.threshold;
    let flag = |idx: usize| Self::accessory_score(&tensors[idx]) >= threshold;
    let open_eyes = flag(OPEN_EYES_TENSOR);
    let glasses = flag(GLASSES_TENSOR);
    let mask = flag(MASK_TENSOR);
    let sunglasses = flag(SUNGLASSES_TENSOR);

    // 戴口罩时不做活体判断
    let lively = !mask && {
      let distance = cosine_distance(&tensors[LIVELINESS_TENSOR].to_f32_vec(), &face.liveliness);
      trace!("{} 活体距离 {:.4}", face.name, distance);
      distance >= threshold
    };

    debug!(
      "人脸 {}: 活体 {}, 睁眼 {}, 口罩 {}, 眼镜 {}, 墨镜 {}",
      face.name, lively, open_eyes, mask, glasses, sunglasses
    );
  }
}

impl Decoder for FaceRecognition {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::ImageClassification).signature(
      &[TensorType::Float32],
      vec![
        tensor_dims![1, 512],
        tensor_dims![1, 32],
        tensor_dims![1, 2],
        tensor_dims![1, 2],
        tensor_dims![1, 2],
        tensor_dims![1, 2],
      ],
    )
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    let settings = self.config.configure(Self::NAME, labels, settings)?;
    let mut database = Vec::with_capacity(settings.databases.len());
    for (index, path) in settings.databases.iter().enumerate() {
      let face = FaceTemplate::load(path)?;
      let expected = self.config.labels.name(index as i32);
      if face.name != expected {
        tracing::error!("模板库 {} 名称与标签不一致", path.display());
        return Err(ConfigureError::TemplateName {
          index,
          expected: expected.to_string(),
          actual: face.name,
        });
      }
      database.push(face);
    }
    info!("{}: 加载 {} 个身份", Self::NAME, database.len());
    self.database = database;
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    _params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::ImageClassification)?;
    expect_tensor_count(tensors, 6, "6")?;
    if tensors[0].rank() != 2 {
      return Err(ProcessError::unsupported(tensors));
    }

    let features = tensors[0].to_f32_vec();
    let best = self.best_match(&features);
    let recognized = best
      .identity
      .filter(|_| best.score >= self.config.threshold);

    let entry = match recognized {
      Some(id) => {
        let labels = &self.config.labels;
        self.log_attributes(&self.database[id], tensors);
        Classification {
          name: labels.name(id as i32).to_string(),
          confidence: best.score * 100.0,
          color: labels.color(id as i32),
        }
      }
      None => {
        debug!("{}: 未识别, 最高相似度 {:.4}", Self::NAME, best.score);
        Classification {
          name: UNKNOWN_FACE.to_string(),
          confidence: (1.0 - best.score) * 100.0,
          color: UNKNOWN_FACE_COLOR,
        }
      }
    };
    output.image_classifications_mut()?.push(entry);
    Ok(())
  }
}
