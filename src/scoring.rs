// 该文件是 Shanan （山南西风） 项目的一部分。
// src/scoring.rs - 置信度变换与相似度
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

/// 模长平方低于该值的特征向量视为退化向量
const DEGENERATE_NORM_SQUARED: f64 = 0.1;

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 对 logits 做 softmax，返回 [0, 1] 内的概率
///
/// 先减去最大值再取指数，结果与直接归一化相同。
pub fn softmax(logits: &[f32]) -> Vec<f32> {
  let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  if sum <= 0.0 || !sum.is_finite() {
    return vec![0.0; logits.len()];
  }
  exps.into_iter().map(|v| v / sum).collect()
}

/// 余弦相似度，内部以 f64 累加
///
/// 任一向量模长接近 0 时返回 0。
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
  for (&x, &y) in a.iter().zip(b) {
    let (x, y) = (x as f64, y as f64);
    dot += x * y;
    norm_a += x * x;
    norm_b += y * y;
  }

  if norm_a < DEGENERATE_NORM_SQUARED || norm_b < DEGENERATE_NORM_SQUARED {
    return 0.0;
  }

  (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// 单位向量间的欧氏距离，`sqrt(2 × (1 − cos))`
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
  let similarity = cosine_similarity(a, b) as f64;
  (2.0 * (1.0 - similarity)).max(0.0).sqrt() as f32
}

/// 返回最大值的下标与值，相等时保留最先出现的
pub fn argmax_first(values: &[f32]) -> Option<(usize, f32)> {
  values
    .iter()
    .copied()
    .enumerate()
    .fold(None, |best, (idx, v)| match best {
      Some((_, b)) if v <= b => best,
      _ => Some((idx, v)),
    })
}

/// 返回最大值的下标与值，相等时保留最后出现的
pub fn argmax_last(values: &[f32]) -> Option<(usize, f32)> {
  values
    .iter()
    .copied()
    .enumerate()
    .fold(None, |best, (idx, v)| match best {
      Some((_, b)) if v < b => best,
      _ => Some((idx, v)),
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn softmax_is_a_distribution() {
    for logits in [
      vec![1.0, 2.0, 3.0],
      vec![-50.0, 0.0, 50.0, 100.0],
      vec![0.0; 5],
      vec![1000.0, 1000.0],
    ] {
      let probs = softmax(&logits);
      let percent: Vec<f32> = probs.iter().map(|p| p * 100.0).collect();
      assert!(percent.iter().all(|p| (0.0..=100.0).contains(p)));
      assert!(percent.iter().sum::<f32>() <= 100.0 + 1e-3);
    }
  }

  #[test]
  fn cosine_similarity_handles_degenerate_vectors() {
    let a = [1.0, 0.0, 0.0];
    let zero = [0.0, 0.0, 0.01];
    assert_eq!(cosine_similarity(&a, &zero), 0.0);
    assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    assert!(cosine_distance(&a, &a).abs() < 1e-3);
  }

  #[test]
  fn argmax_tie_breaking() {
    let values = [0.5, 0.9, 0.9, 0.1];
    assert_eq!(argmax_first(&values), Some((1, 0.9)));
    assert_eq!(argmax_last(&values), Some((2, 0.9)));
    assert_eq!(argmax_first(&[]), None);
  }

  #[test]
  fn sigmoid_midpoint() {
    assert_eq!(sigmoid(0.0), 0.5);
    assert!(sigmoid(10.0) > 0.99);
  }
}
