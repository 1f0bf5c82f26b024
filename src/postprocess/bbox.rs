// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/bbox.rs - 边界框解码与交并比
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

use ndarray::{Array2, ArrayView1, ArrayView2, Zip};

/// 由锚点与 (左, 上, 右, 下) 距离得到 (x1, y1, x2, y2)
///
/// `max_shape` 为 (高, 宽)，给定时 x 坐标限制在 [0, 宽]，y 坐标限制在 [0, 高]。
pub fn distance2bbox(
  points: ArrayView2<'_, f32>,
  distances: ArrayView2<'_, f32>,
  max_shape: Option<(usize, usize)>,
) -> Array2<f32> {
  let mut boxes = Array2::<f32>::zeros((points.nrows(), 4));
  Zip::from(boxes.rows_mut())
    .and(points.rows())
    .and(distances.rows())
    .for_each(|mut out, point, dist| {
      let (x, y) = (point[0], point[1]);
      let mut decoded = [x - dist[0], y - dist[1], x + dist[2], y + dist[3]];
      if let Some((h, w)) = max_shape {
        let (w, h) = (w as f32, h as f32);
        decoded[0] = decoded[0].clamp(0.0, w);
        decoded[1] = decoded[1].clamp(0.0, h);
        decoded[2] = decoded[2].clamp(0.0, w);
        decoded[3] = decoded[3].clamp(0.0, h);
      }
      for (o, v) in out.iter_mut().zip(decoded) {
        *o = v;
      }
    });
  boxes
}

pub fn box_area(bbox: ArrayView1<'_, f32>) -> f32 {
  (bbox[2] - bbox[0]).max(0.0) * (bbox[3] - bbox[1]).max(0.0)
}

pub fn box_iou(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = box_area(a) + box_area(b) - intersection;
  if union <= 0.0 { 0.0 } else { intersection / union }
}
