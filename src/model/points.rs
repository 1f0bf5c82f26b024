// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/points.rs - 多层锚点生成
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

use ndarray::Array2;
use tracing::debug;

/// 无锚框检测头的网格中心点生成器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlvlPointGenerator {
  strides: Vec<usize>,
}

impl MlvlPointGenerator {
  pub fn new(strides: Vec<usize>) -> Self {
    Self { strides }
  }

  pub fn strides(&self) -> &[usize] {
    &self.strides
  }

  /// 单层网格，行优先，坐标为 `x * stride + stride / 2`
  pub fn single_level_grid_points(&self, featmap_size: (usize, usize), stride: usize) -> Array2<f32> {
    let (h, w) = featmap_size;
    let offset = stride as f32 / 2.0;
    Array2::from_shape_fn((h * w, 2), |(i, axis)| {
      let cell = if axis == 0 { i % w } else { i / w };
      (cell * stride) as f32 + offset
    })
  }

  /// 每层一组 `[H·W, 2]` 的 (x, y) 点；层数多于步长时多出的层被忽略
  pub fn grid_points(&self, featmap_sizes: &[(usize, usize)]) -> Vec<Array2<f32>> {
    featmap_sizes
      .iter()
      .zip(&self.strides)
      .map(|(&size, &stride)| {
        debug!("生成锚点: 尺寸 {:?}, 步长 {}", size, stride);
        self.single_level_grid_points(size, stride)
      })
      .collect()
  }
}
