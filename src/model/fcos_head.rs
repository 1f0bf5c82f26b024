// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/fcos_head.rs - FCOS 检测头及其 get_bboxes 重写
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
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::{BboxOutput, DenseHead, FCOS_HEAD_GET_BBOXES, GetBboxes, GetBboxesArgs, MlvlPointGenerator};
use crate::{
  FromUrl, FromUrlWithScheme,
  backend::IrCapability,
  config::{NmsConfig, PostProcessingParams, TestConfig},
  postprocess::{DensePipeline, LevelPredictions, PostprocessError},
  rewrite::{BackendMatch, CapabilityMatch, RewriteContext, RewriteError, RewriteRegistry},
};

#[cfg(feature = "backend_ncnn")]
use crate::{backend::Backend, config::ConfigError};

const FCOS_DEFAULT_STRIDES: [usize; 5] = [8, 16, 32, 64, 128];

#[derive(Error, Debug)]
pub enum FcosHeadError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("检测头参数缺失: {0}")]
  MissingParam(&'static str),
  #[error("检测头参数 {0} 无效: {1}")]
  InvalidParam(String, String),
}

/// FCOS 无锚框检测头，每个位置一个锚点
#[derive(Debug, Clone, PartialEq)]
pub struct FcosHead {
  num_classes: usize,
  points: MlvlPointGenerator,
  test_cfg: TestConfig,
}

impl FromUrlWithScheme for FcosHead {
  const SCHEME: &'static str = "fcos";
}

/// `fcos:///?num_classes=80&strides=8,16,32&nms_pre=1000&score_thr=0.05&iou_threshold=0.5&max_per_img=100`
impl FromUrl for FcosHead {
  type Error = FcosHeadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(FcosHeadError::SchemeMismatch);
    }

    let mut num_classes = None;
    let mut strides = FCOS_DEFAULT_STRIDES.to_vec();
    let mut test_cfg = TestConfig::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "num_classes" => num_classes = Some(parse_param(&key, &value)?),
        "strides" => {
          strides = value
            .split(',')
            .map(|s| parse_param(&key, s.trim()))
            .collect::<Result<_, _>>()?
        }
        "nms_pre" => test_cfg.nms_pre = Some(parse_param(&key, &value)?),
        "score_thr" => test_cfg.score_thr = Some(parse_param(&key, &value)?),
        "iou_threshold" => {
          test_cfg.nms = Some(NmsConfig {
            iou_threshold: Some(parse_param(&key, &value)?),
          })
        }
        "max_per_img" => test_cfg.max_per_img = Some(parse_param(&key, &value)?),
        other => debug!("忽略未知的检测头参数: {}", other),
      }
    }

    let num_classes = num_classes.ok_or(FcosHeadError::MissingParam("num_classes"))?;
    info!("FCOS 检测头: {} 类, 步长 {:?}", num_classes, strides);
    Ok(FcosHead::new(num_classes, strides).with_test_cfg(test_cfg))
  }
}

fn parse_param<T>(key: &str, value: &str) -> Result<T, FcosHeadError>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  value
    .parse()
    .map_err(|e: T::Err| FcosHeadError::InvalidParam(key.to_string(), e.to_string()))
}

impl FcosHead {
  pub fn new(num_classes: usize, strides: Vec<usize>) -> Self {
    Self {
      num_classes,
      points: MlvlPointGenerator::new(strides),
      test_cfg: TestConfig::default(),
    }
  }

  pub fn with_test_cfg(mut self, test_cfg: TestConfig) -> Self {
    self.test_cfg = test_cfg;
    self
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn strides(&self) -> &[usize] {
    self.points.strides()
  }
}

impl DenseHead for FcosHead {
  fn get_bboxes_name(&self) -> &'static str {
    FCOS_HEAD_GET_BBOXES
  }

  fn cls_out_channels(&self) -> usize {
    self.num_classes
  }

  fn test_cfg(&self) -> &TestConfig {
    &self.test_cfg
  }

  fn get_points(&self, featmap_sizes: &[(usize, usize)]) -> Vec<Array2<f32>> {
    self.points.grid_points(featmap_sizes)
  }

  fn get_bboxes(&self, args: GetBboxesArgs) -> Result<BboxOutput, PostprocessError> {
    decode_and_suppress(self, args, PostProcessingParams::default(), false, true)
  }
}

/// 逐层解码并按需执行 NMS
///
/// 参数优先级：调用时的测试配置 > 检测头自身的测试配置 > `base`。
fn decode_and_suppress(
  head: &dyn DenseHead,
  args: GetBboxesArgs,
  base: PostProcessingParams,
  rank_pad: bool,
  allow_batch: bool,
) -> Result<BboxOutput, PostprocessError> {
  let cfg = args.cfg.clone().unwrap_or_else(|| head.test_cfg().clone());
  let params = base.with_test_cfg(&cfg);

  let points = head.get_points(&args.featmap_sizes());
  let levels = LevelPredictions::zip_levels(
    &args.cls_scores,
    &args.bbox_preds,
    args.centernesses.as_deref(),
    &points,
  )?;
  let pipeline = DensePipeline::new(head.cls_out_channels())
    .with_level_top_k(cfg.level_top_k())
    .with_rank_pad(rank_pad);

  let batch = pipeline.validate(&levels)?;
  if batch != 1 && !allow_batch {
    error!("批大小必须为 1，实际为 {}", batch);
    return Err(PostprocessError::BatchSize(batch));
  }
  if !args.img_metas.is_empty() && args.img_metas.len() != batch {
    error!("图像元信息数量 {} 与批大小 {} 不一致", args.img_metas.len(), batch);
    return Err(PostprocessError::MetaMismatch {
      metas: args.img_metas.len(),
      batch,
    });
  }

  let decoded = (0..batch)
    .map(|b| {
      let max_shape = args.img_metas.get(b).and_then(|meta| meta.img_shape);
      pipeline.decode(&levels, b, max_shape)
    })
    .collect::<Result<Vec<_>, _>>()?;

  if !args.with_nms {
    return Ok(BboxOutput::Raw(decoded));
  }

  debug!("NMS 参数: {:?}", params);
  Ok(BboxOutput::Suppressed(
    decoded
      .iter()
      .map(|image| pipeline.suppress(image, &params))
      .collect(),
  ))
}

/// 适用于所有后端的重写，按中间表示能力决定是否补秩
fn fcos_head_get_bboxes(
  ctx: &RewriteContext<'_, GetBboxes>,
  head: &(dyn DenseHead + 'static),
  args: GetBboxesArgs,
) -> Result<BboxOutput, PostprocessError> {
  let params = ctx.cfg().post_processing_params()?;
  let rank_pad = !ctx.capabilities().contains(IrCapability::ImplicitBroadcast2d);
  decode_and_suppress(head, args, params, rank_pad, ctx.cfg().batch_inference())
}

/// ncnn 不支持 Shape 节点、批推理与二维张量的隐式广播
#[cfg(feature = "backend_ncnn")]
fn fcos_head_get_bboxes_ncnn(
  ctx: &RewriteContext<'_, GetBboxes>,
  head: &(dyn DenseHead + 'static),
  args: GetBboxesArgs,
) -> Result<BboxOutput, PostprocessError> {
  if ctx.cfg().is_dynamic_shape()? {
    error!("{} 后端不支持动态形状", ctx.backend());
    return Err(ConfigError::DynamicShapeUnsupported(ctx.backend()).into());
  }
  let params = ctx.cfg().post_processing_params()?;
  decode_and_suppress(head, args, params, true, false)
}

pub(super) fn register(registry: &mut RewriteRegistry) -> Result<(), RewriteError> {
  registry.register::<GetBboxes, _>(
    FCOS_HEAD_GET_BBOXES,
    BackendMatch::Any,
    CapabilityMatch::Any,
    fcos_head_get_bboxes,
  )?;

  #[cfg(feature = "backend_ncnn")]
  registry.register::<GetBboxes, _>(
    FCOS_HEAD_GET_BBOXES,
    BackendMatch::Exact(Backend::Ncnn),
    CapabilityMatch::Any,
    fcos_head_get_bboxes_ncnn,
  )?;

  Ok(())
}
