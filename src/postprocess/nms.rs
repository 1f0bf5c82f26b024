// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/nms.rs - 按类别的非极大值抑制
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

use ndarray::ArrayView2;
use tracing::debug;

use super::{bbox::box_iou, max_over_classes, topk_indices};
use crate::{
  config::PostProcessingParams,
  model::{DetectItem, DetectResult},
};

/// 多类别 NMS
///
/// 顺序固定为：可选的预截断、逐类别贪心抑制与数量上限、合并、全局 `keep_top_k` 截断。
/// 分数不高于 `score_threshold` 的候选不参与任何类别。
pub fn multiclass_nms(
  boxes: ArrayView2<'_, f32>,
  scores: ArrayView2<'_, f32>,
  params: &PostProcessingParams,
) -> DetectResult {
  let num_anchors = boxes.nrows();
  let candidates: Vec<usize> = match params.pre_top_k() {
    Some(k) if k < num_anchors => {
      let mut kept = topk_indices(max_over_classes(scores).view(), k);
      kept.sort_unstable();
      kept
    }
    _ => (0..num_anchors).collect(),
  };

  let mut items = Vec::new();
  if params.max_output_boxes_per_class == 0 {
    return DetectResult::from(items);
  }

  for (class_id, class_scores) in scores.columns().into_iter().enumerate() {
    let mut order: Vec<usize> = candidates
      .iter()
      .copied()
      .filter(|&i| class_scores[i] > params.score_threshold)
      .collect();
    order.sort_by(|&a, &b| class_scores[b].total_cmp(&class_scores[a]));

    let mut selected: Vec<usize> = Vec::new();
    for i in order {
      if selected.len() >= params.max_output_boxes_per_class {
        break;
      }
      let suppressed = selected
        .iter()
        .any(|&j| box_iou(boxes.row(i), boxes.row(j)) > params.iou_threshold);
      if !suppressed {
        selected.push(i);
      }
    }

    items.extend(selected.into_iter().map(|i| {
      let row = boxes.row(i);
      DetectItem {
        class_id: class_id as u32,
        score: class_scores[i],
        bbox: [row[0], row[1], row[2], row[3]],
      }
    }));
  }

  items.sort_by(|a, b| b.score.total_cmp(&a.score));
  let merged = items.len();
  if let Some(k) = params.keep_top_k() {
    items.truncate(k);
  }
  debug!("NMS 完成: 候选 {}, 合并 {}, 保留 {}", candidates.len(), merged, items.len());

  DetectResult::from(items)
}
