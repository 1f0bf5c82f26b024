// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测头与可重写方法
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

use ndarray::{Array2, Array4};
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};

use crate::{
  config::TestConfig,
  postprocess::{DecodedDetections, PostprocessError},
  rewrite::{RewritableMethod, RewriteError, RewriteRegistry},
};

mod fcos_head;
mod points;

pub use self::fcos_head::{FcosHead, FcosHeadError};
pub use self::points::MlvlPointGenerator;

pub const FCOS_HEAD_GET_BBOXES: &str = "mmdet.models.dense_heads.FCOSHead.get_bboxes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

/// 单张图像的抑制结果，按分数降序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn boxes(&self) -> Vec<[f32; 4]> {
    self.items.iter().map(|item| item.bbox).collect()
  }

  pub fn scores(&self) -> Vec<f32> {
    self.items.iter().map(|item| item.score).collect()
  }

  pub fn labels(&self) -> Vec<u32> {
    self.items.iter().map(|item| item.class_id).collect()
  }
}

/// 图像元信息，`img_shape` 为 (高, 宽)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
  #[serde(default, deserialize_with = "deserialize_img_shape")]
  pub img_shape: Option<(usize, usize)>,
}

/// 接受 `[h, w]` 或带通道数的 `[h, w, c]`
fn deserialize_img_shape<'de, D>(deserializer: D) -> Result<Option<(usize, usize)>, D::Error>
where
  D: Deserializer<'de>,
{
  match Option::<Vec<usize>>::deserialize(deserializer)? {
    None => Ok(None),
    Some(dims) => match dims.as_slice() {
      [h, w] | [h, w, _] => Ok(Some((*h, *w))),
      _ => Err(D::Error::invalid_length(dims.len(), &"2 or 3 elements")),
    },
  }
}

fn default_with_nms() -> bool {
  true
}

/// `get_bboxes` 的参数，按特征层排列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBboxesArgs {
  pub cls_scores: Vec<Array4<f32>>,
  pub bbox_preds: Vec<Array4<f32>>,
  #[serde(default)]
  pub centernesses: Option<Vec<Array4<f32>>>,
  #[serde(default)]
  pub img_metas: Vec<ImageMeta>,
  #[serde(default = "default_with_nms")]
  pub with_nms: bool,
  #[serde(default)]
  pub cfg: Option<TestConfig>,
}

impl GetBboxesArgs {
  pub fn new(cls_scores: Vec<Array4<f32>>, bbox_preds: Vec<Array4<f32>>) -> Self {
    Self {
      cls_scores,
      bbox_preds,
      centernesses: None,
      img_metas: Vec::new(),
      with_nms: true,
      cfg: None,
    }
  }

  pub fn with_centernesses(mut self, centernesses: Vec<Array4<f32>>) -> Self {
    self.centernesses = Some(centernesses);
    self
  }

  pub fn with_img_metas(mut self, img_metas: Vec<ImageMeta>) -> Self {
    self.img_metas = img_metas;
    self
  }

  pub fn with_nms(mut self, with_nms: bool) -> Self {
    self.with_nms = with_nms;
    self
  }

  pub fn with_cfg(mut self, cfg: TestConfig) -> Self {
    self.cfg = Some(cfg);
    self
  }

  /// 各层 (高, 宽)
  pub fn featmap_sizes(&self) -> Vec<(usize, usize)> {
    self
      .cls_scores
      .iter()
      .map(|cls| (cls.shape()[2], cls.shape()[3]))
      .collect()
  }
}

/// 每张图像一项：跳过 NMS 时为解码候选，否则为抑制结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BboxOutput {
  Raw(Vec<DecodedDetections>),
  Suppressed(Vec<DetectResult>),
}

impl BboxOutput {
  pub fn num_images(&self) -> usize {
    match self {
      BboxOutput::Raw(images) => images.len(),
      BboxOutput::Suppressed(images) => images.len(),
    }
  }
}

/// 密集检测头
pub trait DenseHead {
  /// `get_bboxes` 的限定名，用于查找重写规则
  fn get_bboxes_name(&self) -> &'static str;

  fn cls_out_channels(&self) -> usize;

  fn test_cfg(&self) -> &TestConfig;

  /// 每层锚点，形状 `[H·W, 2]`
  fn get_points(&self, featmap_sizes: &[(usize, usize)]) -> Vec<Array2<f32>>;

  /// 模型自身的后处理实现
  fn get_bboxes(&self, args: GetBboxesArgs) -> Result<BboxOutput, PostprocessError>;
}

/// `DenseHead::get_bboxes` 的重写签名
pub struct GetBboxes;

impl RewritableMethod for GetBboxes {
  type Target = dyn DenseHead;
  type Args = GetBboxesArgs;
  type Output = BboxOutput;
  type Error = PostprocessError;

  fn call_original(target: &Self::Target, args: GetBboxesArgs) -> Result<BboxOutput, PostprocessError> {
    target.get_bboxes(args)
  }
}

/// 注册内置的检测头重写
pub fn register_rewriters(registry: &mut RewriteRegistry) -> Result<(), RewriteError> {
  fcos_head::register(registry)
}
