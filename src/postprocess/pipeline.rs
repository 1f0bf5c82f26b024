// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/pipeline.rs - 密集检测头的逐层解码流水线
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

use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Axis, concatenate};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{
  PostprocessError, distance2bbox, fuse_confidence, max_over_classes, multiclass_nms, sigmoid,
  topk_indices,
};
use crate::{config::PostProcessingParams, model::DetectResult};

/// 单张图像解码后的候选：框 `[N, 4]`、类别分数 `[N, C]`、置信度 `[N, 1]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedDetections {
  pub boxes: Array2<f32>,
  pub scores: Array2<f32>,
  pub confidence: Array2<f32>,
}

impl DecodedDetections {
  pub fn len(&self) -> usize {
    self.boxes.nrows()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 一个特征层的输出与锚点
#[derive(Debug, Clone, Copy)]
pub struct LevelPredictions<'a> {
  pub cls_score: ArrayView4<'a, f32>,
  pub bbox_pred: ArrayView4<'a, f32>,
  pub centerness: Option<ArrayView4<'a, f32>>,
  pub points: ArrayView2<'a, f32>,
}

impl<'a> LevelPredictions<'a> {
  /// 按层配对各张量，层数不一致时报错
  pub fn zip_levels(
    cls_scores: &'a [Array4<f32>],
    bbox_preds: &'a [Array4<f32>],
    centernesses: Option<&'a [Array4<f32>]>,
    points: &'a [Array2<f32>],
  ) -> Result<Vec<Self>, PostprocessError> {
    if cls_scores.is_empty() {
      return Err(PostprocessError::NoLevels);
    }
    check_level_count("cls_scores", cls_scores.len(), "bbox_preds", bbox_preds.len())?;
    if let Some(centernesses) = centernesses {
      check_level_count("cls_scores", cls_scores.len(), "centernesses", centernesses.len())?;
    }
    check_level_count("cls_scores", cls_scores.len(), "points", points.len())?;

    Ok(
      (0..cls_scores.len())
        .map(|i| LevelPredictions {
          cls_score: cls_scores[i].view(),
          bbox_pred: bbox_preds[i].view(),
          centerness: centernesses.map(|c| c[i].view()),
          points: points[i].view(),
        })
        .collect(),
    )
  }

  pub fn batch_size(&self) -> usize {
    self.cls_score.shape()[0]
  }
}

fn check_level_count(
  left: &'static str,
  left_len: usize,
  right: &'static str,
  right_len: usize,
) -> Result<(), PostprocessError> {
  if left_len != right_len {
    error!("特征层数量不匹配: {} {} / {} {}", left, left_len, right, right_len);
    return Err(PostprocessError::LevelMismatch {
      left,
      left_len,
      right,
      right_len,
    });
  }
  Ok(())
}

fn shape_mismatch(
  level: usize,
  left: &'static str,
  left_shape: &[usize],
  right: &'static str,
  right_shape: &[usize],
) -> PostprocessError {
  error!(
    "第 {} 层形状不匹配: {} {:?} / {} {:?}",
    level, left, left_shape, right, right_shape
  );
  PostprocessError::ShapeMismatch {
    level,
    left,
    left_shape: left_shape.to_vec(),
    right,
    right_shape: right_shape.to_vec(),
  }
}

/// `[B, K, H, W]` 中第 `b` 张图像展开为 `[H·W·(K/channels), channels]`
fn flatten_level(
  tensor: ArrayView4<'_, f32>,
  b: usize,
  channels: usize,
) -> Result<Array2<f32>, PostprocessError> {
  let image = tensor.index_axis(Axis(0), b).permuted_axes([1, 2, 0]);
  let rows = image.len() / channels.max(1);
  Ok(
    image
      .as_standard_layout()
      .into_owned()
      .into_shape_with_order((rows, channels))?,
  )
}

/// 后端受限的密集检测头后处理
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensePipeline {
  pub num_classes: usize,
  /// 每层 NMS 前保留的候选数，None 表示不截断
  pub level_top_k: Option<usize>,
  /// 后端不支持二维隐式广播时为真
  pub rank_pad: bool,
}

impl DensePipeline {
  pub fn new(num_classes: usize) -> Self {
    Self {
      num_classes,
      level_top_k: None,
      rank_pad: false,
    }
  }

  pub fn with_level_top_k(mut self, level_top_k: Option<usize>) -> Self {
    self.level_top_k = level_top_k;
    self
  }

  pub fn with_rank_pad(mut self, rank_pad: bool) -> Self {
    self.rank_pad = rank_pad;
    self
  }

  /// 检查每层张量之间的批大小、空间尺寸与通道数，返回批大小
  pub fn validate(&self, levels: &[LevelPredictions<'_>]) -> Result<usize, PostprocessError> {
    let first = levels.first().ok_or(PostprocessError::NoLevels)?;
    let batch = first.batch_size();

    for (level, pred) in levels.iter().enumerate() {
      let cls = pred.cls_score.shape();
      let reg = pred.bbox_pred.shape();
      if cls[0] != batch {
        return Err(shape_mismatch(level, "cls_score", cls, "cls_scores[0]", first.cls_score.shape()));
      }
      if reg[0] != cls[0] || reg[2..] != cls[2..] {
        return Err(shape_mismatch(level, "cls_score", cls, "bbox_pred", reg));
      }
      if cls[1] % self.num_classes.max(1) != 0 {
        return Err(PostprocessError::ChannelMismatch {
          tensor: "cls_score",
          channels: cls[1],
          expected: self.num_classes,
        });
      }
      if reg[1] % 4 != 0 {
        return Err(PostprocessError::ChannelMismatch {
          tensor: "bbox_pred",
          channels: reg[1],
          expected: 4,
        });
      }
      let num_base = reg[1] / 4;
      if cls[1] / self.num_classes.max(1) != num_base {
        return Err(shape_mismatch(level, "cls_score", cls, "bbox_pred", reg));
      }
      if let Some(centerness) = pred.centerness {
        let aux = centerness.shape();
        if aux[0] != cls[0] || aux[2..] != cls[2..] || aux[1] != num_base {
          return Err(shape_mismatch(level, "cls_score", cls, "centerness", aux));
        }
      }
      let anchors = cls[2] * cls[3] * num_base;
      let points = pred.points.shape();
      if points[0] != anchors || points[1] != 2 {
        return Err(shape_mismatch(level, "cls_score", cls, "points", points));
      }
    }
    Ok(batch)
  }

  /// 解码批中第 `b` 张图像，层顺序保持不变
  pub fn decode(
    &self,
    levels: &[LevelPredictions<'_>],
    b: usize,
    max_shape: Option<(usize, usize)>,
  ) -> Result<DecodedDetections, PostprocessError> {
    self.validate(levels)?;

    let mut all_points = Vec::with_capacity(levels.len());
    let mut all_deltas = Vec::with_capacity(levels.len());
    let mut all_scores = Vec::with_capacity(levels.len());
    let mut all_confidence = Vec::with_capacity(levels.len());

    for (level, pred) in levels.iter().enumerate() {
      let scores = flatten_level(pred.cls_score, b, self.num_classes)?.mapv_into(sigmoid);
      let deltas = flatten_level(pred.bbox_pred, b, 4)?;
      let confidence = match pred.centerness {
        Some(centerness) => flatten_level(centerness, b, 1)?.mapv_into(sigmoid),
        None => Array2::ones((scores.nrows(), 1)),
      };
      let mut points = pred.points.to_owned();

      let (scores, deltas, confidence) = match self.level_top_k {
        Some(k) if k < scores.nrows() => {
          let fused = fuse_confidence(scores.view(), confidence.view(), self.rank_pad);
          let keep = topk_indices(max_over_classes(fused.view()).view(), k);
          points = points.select(Axis(0), &keep);
          (
            scores.select(Axis(0), &keep),
            deltas.select(Axis(0), &keep),
            confidence.select(Axis(0), &keep),
          )
        }
        _ => (scores, deltas, confidence),
      };
      debug!("第 {} 层解码: {} 个候选", level, scores.nrows());

      all_points.push(points);
      all_deltas.push(deltas);
      all_scores.push(scores);
      all_confidence.push(confidence);
    }

    let points = concat_rows(&all_points)?;
    let deltas = concat_rows(&all_deltas)?;
    let decoded = DecodedDetections {
      boxes: distance2bbox(points.view(), deltas.view(), max_shape),
      scores: concat_rows(&all_scores)?,
      confidence: concat_rows(&all_confidence)?,
    };
    debug!("解码完成: {} 个候选", decoded.len());
    Ok(decoded)
  }

  /// 融合置信度后执行多类别 NMS
  pub fn suppress(&self, decoded: &DecodedDetections, params: &PostProcessingParams) -> DetectResult {
    let scores = fuse_confidence(
      decoded.scores.view(),
      decoded.confidence.view(),
      self.rank_pad,
    );
    multiclass_nms(decoded.boxes.view(), scores.view(), params)
  }
}

fn concat_rows(parts: &[Array2<f32>]) -> Result<Array2<f32>, PostprocessError> {
  let views: Vec<ArrayView2<'_, f32>> = parts.iter().map(|p| p.view()).collect();
  Ok(concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array4, array};

  fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
  }

  /// 一层 1x3 的特征图，单类别，无中心度
  fn single_level(probs: [f32; 3]) -> (Array4<f32>, Array4<f32>, Array2<f32>) {
    let cls = Array4::from_shape_fn((1, 1, 1, 3), |(_, _, _, x)| logit(probs[x]));
    let reg = Array4::from_elem((1, 4, 1, 3), 1.0f32);
    let points = array![[4.0f32, 4.0], [12.0, 4.0], [20.0, 4.0]];
    (cls, reg, points)
  }

  #[test]
  fn decode_keeps_level_order() {
    let (cls_a, reg_a, points_a) = single_level([0.2, 0.4, 0.6]);
    let (cls_b, reg_b, _) = single_level([0.9, 0.1, 0.3]);
    let points_b = array![[100.0f32, 4.0], [108.0, 4.0], [116.0, 4.0]];
    let cls = [cls_a, cls_b];
    let reg = [reg_a, reg_b];
    let points = [points_a, points_b];
    let levels = LevelPredictions::zip_levels(&cls, &reg, None, &points).unwrap();

    let decoded = DensePipeline::new(1).decode(&levels, 0, None).unwrap();
    assert_eq!(decoded.len(), 6);
    assert_eq!(decoded.boxes.row(0).to_vec(), vec![3.0, 3.0, 5.0, 5.0]);
    assert_eq!(decoded.boxes.row(3).to_vec(), vec![99.0, 3.0, 101.0, 5.0]);
    assert!((decoded.scores[[3, 0]] - 0.9).abs() < 1e-5);
    assert!(decoded.confidence.iter().all(|&c| c == 1.0));
  }

  #[test]
  fn level_top_k_restricts_all_tensors() {
    let (cls, reg, points) = single_level([0.2, 0.9, 0.6]);
    let cls = [cls];
    let reg = [reg];
    let points = [points];
    let levels = LevelPredictions::zip_levels(&cls, &reg, None, &points).unwrap();

    let decoded = DensePipeline::new(1)
      .with_level_top_k(Some(2))
      .with_rank_pad(true)
      .decode(&levels, 0, None)
      .unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded.boxes.row(0).to_vec(), vec![11.0, 3.0, 13.0, 5.0]);
    assert_eq!(decoded.boxes.row(1).to_vec(), vec![19.0, 3.0, 21.0, 5.0]);
  }

  #[test]
  fn level_top_k_ranks_by_centerness_weighted_score() {
    let cls = [Array4::from_shape_fn((1, 1, 1, 2), |(_, _, _, x)| logit([0.9, 0.6][x]))];
    let reg = [Array4::from_shape_fn((1, 4, 1, 2), |(_, _, _, x)| (x + 1) as f32)];
    let centerness = [Array4::from_shape_fn((1, 1, 1, 2), |(_, _, _, x)| logit([0.1, 0.9][x]))];
    let points = [array![[4.0f32, 4.0], [12.0, 4.0]]];
    let levels = LevelPredictions::zip_levels(&cls, &reg, Some(&centerness), &points).unwrap();

    for rank_pad in [false, true] {
      let decoded = DensePipeline::new(1)
        .with_level_top_k(Some(1))
        .with_rank_pad(rank_pad)
        .decode(&levels, 0, None)
        .unwrap();
      assert_eq!(decoded.len(), 1);
      // 锚点 1 的点 (12, 4) 与距离 2
      assert_eq!(decoded.boxes.row(0).to_vec(), vec![10.0, 2.0, 14.0, 6.0]);
      assert!((decoded.scores[[0, 0]] - 0.6).abs() < 1e-5);
      assert!((decoded.confidence[[0, 0]] - 0.9).abs() < 1e-5);
    }
  }

  #[test]
  fn centerness_scales_fused_scores() {
    let (cls, reg, points) = single_level([0.8, 0.8, 0.8]);
    let centerness = Array4::from_shape_fn((1, 1, 1, 3), |(_, _, _, x)| logit([0.5, 0.25, 0.9][x]));
    let cls = [cls];
    let reg = [reg];
    let centerness = [centerness];
    let points = [points];
    let levels = LevelPredictions::zip_levels(&cls, &reg, Some(&centerness), &points).unwrap();

    let pipeline = DensePipeline::new(1).with_rank_pad(true);
    let decoded = pipeline.decode(&levels, 0, None).unwrap();
    let params = PostProcessingParams {
      keep_top_k: 1,
      ..PostProcessingParams::default()
    };
    let result = pipeline.suppress(&decoded, &params);
    assert_eq!(result.len(), 1);
    assert!((result.items[0].score - 0.72).abs() < 1e-4);
    assert_eq!(result.items[0].bbox, [19.0, 3.0, 21.0, 5.0]);
  }

  #[test]
  fn mismatched_level_count_names_tensors() {
    let (cls, reg, points) = single_level([0.1, 0.2, 0.3]);
    let cls = [cls.clone(), cls.clone(), cls];
    let reg = [reg.clone(), reg];
    let points = [points.clone(), points.clone(), points];
    match LevelPredictions::zip_levels(&cls, &reg, None, &points) {
      Err(PostprocessError::LevelMismatch {
        left,
        left_len,
        right,
        right_len,
      }) => {
        assert_eq!((left, left_len), ("cls_scores", 3));
        assert_eq!((right, right_len), ("bbox_preds", 2));
      }
      other => panic!("unexpected: {:?}", other.map(|l| l.len())),
    }
  }

  #[test]
  fn spatial_mismatch_is_fatal() {
    let (cls, _, points) = single_level([0.1, 0.2, 0.3]);
    let reg = Array4::from_elem((1, 4, 1, 2), 1.0f32);
    let cls = [cls];
    let reg = [reg];
    let points = [points];
    let levels = LevelPredictions::zip_levels(&cls, &reg, None, &points).unwrap();
    assert!(matches!(
      DensePipeline::new(1).decode(&levels, 0, None),
      Err(PostprocessError::ShapeMismatch { level: 0, .. })
    ));
  }
}
