// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/pose_landmark.rs - MediaPipe 关键点直接回归解码
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

use tracing::{debug, trace};

use crate::{
  caps::{Caps, tensor_dims},
  labels::LabelsSource,
  model::{BaseConfig, ConfigureError, Decoder, ProcessError, expect_tensor_count},
  output::{Keypoint, KeypointLink, Output, OutputKind, PoseEstimation},
  params::Params,
  settings::Connection,
  tensor::{Tensor, TensorType},
};

const LANDMARK_DEFAULT_THRESHOLD: f32 = 0.5;
/// 每个关键点的字段：x, y, z, 可见度
const CONFIDENCE_FIELD: usize = 3;

/// 直接回归关键点：一个姿态分数与 `[1, K, F]` 的归一化坐标
#[derive(Debug, Clone)]
pub struct PoseLandmark {
  config: BaseConfig,
  connections: Vec<Connection>,
}

impl Default for PoseLandmark {
  fn default() -> Self {
    Self {
      config: BaseConfig::new(LANDMARK_DEFAULT_THRESHOLD),
      connections: Vec::new(),
    }
  }
}

impl PoseLandmark {
  pub const NAME: &'static str = "mediapipe-pose-landmark";

  pub fn new() -> Self {
    Self::default()
  }
}

impl Decoder for PoseLandmark {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  fn caps(&self) -> Caps {
    Caps::new(OutputKind::PoseEstimation)
      .signature(&[TensorType::Float32], vec![tensor_dims![1], tensor_dims![1, 25, 4]])
  }

  fn configure(&mut self, labels: &LabelsSource, settings: &str) -> Result<(), ConfigureError> {
    let settings = self.config.configure(Self::NAME, labels, settings)?;
    self.connections = settings
      .connections
      .ok_or(ConfigureError::MissingTable("connections"))?;
    Ok(())
  }

  fn process(
    &mut self,
    tensors: &[Tensor<'_>],
    params: &Params,
    output: &mut Output,
  ) -> Result<(), ProcessError> {
    output.expect_kind(OutputKind::PoseEstimation)?;
    expect_tensor_count(tensors, 2, "2")?;
    let (score, landmarks) = if tensors[0].len() == 1 {
      (&tensors[0], &tensors[1])
    } else {
      (&tensors[1], &tensors[0])
    };
    let (count, fields) = match (landmarks.dim(1), landmarks.dim(2)) {
      (Some(k), Some(f)) if landmarks.rank() == 3 && f >= 2 && score.len() == 1 => (k, f),
      _ => return Err(ProcessError::unsupported(tensors)),
    };

    let region = params.region()?;
    let resolution = params.resolution()?;

    let score = score.get(0)?;
    if score < self.config.threshold {
      trace!("姿态分数 {:.3} 低于阈值 {:.3}", score, self.config.threshold);
      return Ok(());
    }

    let labels = &self.config.labels;
    let values = landmarks.to_f32_vec();
    let keypoints: Vec<Keypoint> = values
      .chunks_exact(fields)
      .take(count)
      .enumerate()
      .map(|(idx, lm)| {
        let px = lm[0] * resolution.width as f32;
        let py = lm[1] * resolution.height as f32;
        let confidence = lm.get(CONFIDENCE_FIELD).copied().unwrap_or(score);
        // 区域变换之后再限制到 [0, 1]
        Keypoint {
          name: labels.name(idx as i32).to_string(),
          x: region.normalize_x(px).clamp(0.0, 1.0),
          y: region.normalize_y(py).clamp(0.0, 1.0),
          confidence: confidence * 100.0,
          color: labels.color(idx as i32),
        }
      })
      .collect();

    let links = self
      .connections
      .iter()
      .filter(|c| (c.id as usize) < count && (c.connection as usize) < count)
      .map(|c| KeypointLink {
        from: c.id as usize,
        to: c.connection as usize,
      })
      .collect();

    debug!("{}: 姿态分数 {:.3}, {} 个关键点", Self::NAME, score, keypoints.len());
    output.poses_mut()?.push(PoseEstimation {
      confidence: score * 100.0,
      keypoints,
      links: Some(links),
    });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    geometry::{Region, Resolution},
    tensor::OwnedTensor,
  };

  fn configured() -> PoseLandmark {
    let mut decoder = PoseLandmark::new();
    decoder
      .configure(
        &LabelsSource::Inline("nose\nleft_eye".to_string()),
        r#"{"connections": [{"id": 0, "connection": 1}, {"id": 1, "connection": 30}]}"#,
      )
      .unwrap();
    decoder
  }

  fn decode(decoder: &mut PoseLandmark, score: f32, landmarks: &[f32]) -> Vec<PoseEstimation> {
    let score = OwnedTensor::from_f32(vec![1], &[score]).unwrap();
    let landmarks = OwnedTensor::from_f32(vec![1, 2, 4], landmarks).unwrap();
    let params = Params::with_geometry(Region::new(64, 0, 128, 256), Resolution::new(256, 256));
    let mut output = Output::PoseEstimations(Vec::new());
    decoder
      .process(&[score.view(), landmarks.view()], &params, &mut output)
      .unwrap();
    let Output::PoseEstimations(poses) = output else {
      unreachable!()
    };
    poses
  }

  #[test]
  fn missing_settings_or_connections_fail() {
    let mut decoder = PoseLandmark::new();
    let labels = LabelsSource::Inline("nose".to_string());
    assert!(matches!(
      decoder.configure(&labels, ""),
      Err(ConfigureError::MissingTable("connections"))
    ));
    assert!(decoder.configure(&labels, r#"{"confidence": 40}"#).is_err());
    assert!(decoder.configure(&labels, "not json").is_err());
  }

  #[test]
  fn clamps_after_region_transform() {
    let mut decoder = configured();
    let poses = decode(&mut decoder, 0.8, &[0.5, 0.5, 0.0, 0.9, 0.1, 1.2, 0.0, 0.5]);
    assert_eq!(poses.len(), 1);
    let pose = &poses[0];
    assert!((pose.confidence - 80.0).abs() < 1e-4);
    assert!((pose.keypoints[0].x - 0.5).abs() < 1e-6);
    assert!((pose.keypoints[0].confidence - 90.0).abs() < 1e-4);
    // x = 25.6 在区域左侧之外，y = 307.2 在下方之外
    assert_eq!(pose.keypoints[1].x, 0.0);
    assert_eq!(pose.keypoints[1].y, 1.0);
    assert_eq!(pose.links.as_ref().unwrap().len(), 1);
  }

  #[test]
  fn low_score_produces_nothing() {
    let mut decoder = configured();
    assert!(decode(&mut decoder, 0.49, &[0.0; 8]).is_empty());
    assert_eq!(decode(&mut decoder, 0.5, &[0.0; 8]).len(), 1);
  }

  #[test]
  fn score_at_threshold_is_kept() {
    let mut decoder = configured();
    let poses = decode(&mut decoder, LANDMARK_DEFAULT_THRESHOLD, &[0.5; 8]);
    assert_eq!(poses.len(), 1);
    assert!((poses[0].confidence - 50.0).abs() < 1e-4);
  }
}
