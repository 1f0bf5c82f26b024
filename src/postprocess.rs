// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess.rs - 检测后处理
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

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::{config::ConfigError, rewrite::RewriteError};

mod bbox;
mod nms;
mod pipeline;

pub use self::bbox::{box_iou, distance2bbox};
pub use self::nms::multiclass_nms;
pub use self::pipeline::{DecodedDetections, DensePipeline, LevelPredictions};

#[derive(Error, Debug)]
pub enum PostprocessError {
  #[error("没有任何特征层输入")]
  NoLevels,
  #[error("特征层数量不匹配: {left} 有 {left_len} 层, {right} 有 {right_len} 层")]
  LevelMismatch {
    left: &'static str,
    left_len: usize,
    right: &'static str,
    right_len: usize,
  },
  #[error("第 {level} 层形状不匹配: {left} {left_shape:?}, {right} {right_shape:?}")]
  ShapeMismatch {
    level: usize,
    left: &'static str,
    left_shape: Vec<usize>,
    right: &'static str,
    right_shape: Vec<usize>,
  },
  #[error("{tensor} 的通道数 {channels} 不能按 {expected} 整除")]
  ChannelMismatch {
    tensor: &'static str,
    channels: usize,
    expected: usize,
  },
  #[error("该后端仅支持批大小为 1，实际为 {0}")]
  BatchSize(usize),
  #[error("图像元信息数量 {metas} 与批大小 {batch} 不一致")]
  MetaMismatch { metas: usize, batch: usize },
  #[error("张量形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
  #[error("部署配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("重写错误: {0}")]
  Rewrite(#[from] RewriteError),
}

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// `(N, C) × (N, 1)` 的逐元素乘积
///
/// `rank_pad` 为真时先补一个尾部单例维度，按三维张量相乘后再还原，
/// 对应不支持二维隐式广播的后端。
pub fn fuse_confidence(
  scores: ArrayView2<'_, f32>,
  confidence: ArrayView2<'_, f32>,
  rank_pad: bool,
) -> Array2<f32> {
  if rank_pad {
    let scores = scores.insert_axis(Axis(2));
    let confidence = confidence.insert_axis(Axis(2));
    let fused = &scores * &confidence;
    fused.index_axis_move(Axis(2), 0)
  } else {
    &scores * &confidence
  }
}

/// 每个候选在所有类别上的最大分数
pub fn max_over_classes(scores: ArrayView2<'_, f32>) -> Array1<f32> {
  scores.map_axis(Axis(1), |row| {
    row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
  })
}

/// 分数最高的 k 个下标，按分数降序；同分时下标小者在前
pub fn topk_indices(scores: ArrayView1<'_, f32>, k: usize) -> Vec<usize> {
  let mut order: Vec<usize> = (0..scores.len()).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
  order.truncate(k);
  order
}
