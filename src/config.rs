// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 部署配置与测试配置
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

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  backend::{Backend, IrCapabilities, IrCapability, UnknownBackend},
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("部署配置必须是键值树")]
  NotATree,
  #[error("部署配置缺少字段: {0}")]
  MissingField(String),
  #[error("部署配置字段 {field} 无效: {reason}")]
  InvalidField { field: String, reason: String },
  #[error("后端错误: {0}")]
  UnknownBackend(#[from] UnknownBackend),
  #[error("后端 {0} 不支持动态形状导出")]
  DynamicShapeUnsupported(Backend),
}

impl ConfigError {
  fn invalid(field: &str, reason: impl Into<String>) -> Self {
    ConfigError::InvalidField {
      field: field.to_string(),
      reason: reason.into(),
    }
  }
}

/// 部署配置，只读的嵌套键值树
#[derive(Debug, Clone, PartialEq)]
pub struct DeployConfig {
  tree: Value,
}

impl FromUrlWithScheme for DeployConfig {
  const SCHEME: &'static str = "file";
}

impl FromUrl for DeployConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch);
    }

    info!("加载部署配置: {}", url.path());
    let text = std::fs::read_to_string(url.path())?;
    Self::from_json_str(&text)
  }
}

impl DeployConfig {
  pub fn from_value(tree: Value) -> Result<Self, ConfigError> {
    if !tree.is_object() {
      return Err(ConfigError::NotATree);
    }
    Ok(Self { tree })
  }

  pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
    Self::from_value(serde_json::from_str(text)?)
  }

  pub fn as_value(&self) -> &Value {
    &self.tree
  }

  /// 按 `a.b.c` 形式的路径取值
  pub fn get(&self, path: &str) -> Option<&Value> {
    path
      .split('.')
      .try_fold(&self.tree, |node, key| node.get(key))
  }

  fn require(&self, path: &str) -> Result<&Value, ConfigError> {
    self
      .get(path)
      .ok_or_else(|| ConfigError::MissingField(path.to_string()))
  }

  pub fn backend(&self) -> Result<Backend, ConfigError> {
    let name = self
      .require("backend_config.type")?
      .as_str()
      .ok_or_else(|| ConfigError::invalid("backend_config.type", "需要字符串"))?;
    Ok(name.parse()?)
  }

  /// 中间表示配置，新格式为 `ir_config`，旧格式为 `onnx_config`
  pub fn ir_config(&self) -> Option<&Value> {
    self
      .tree
      .get("ir_config")
      .or_else(|| self.tree.get("onnx_config"))
  }

  fn first_input_name(&self) -> String {
    self
      .ir_config()
      .and_then(|ir| ir.get("input_names"))
      .and_then(Value::as_array)
      .and_then(|names| names.first())
      .and_then(Value::as_str)
      .unwrap_or("input")
      .to_string()
  }

  pub fn is_dynamic_shape(&self) -> Result<bool, ConfigError> {
    if self.backend()? == Backend::TorchScript {
      return Ok(true);
    }

    let dynamic_axes = match self.ir_config().and_then(|ir| ir.get("dynamic_axes")) {
      None | Some(Value::Null) => return Ok(false),
      Some(axes) => axes,
    };

    let input_name = self.first_input_name();
    match dynamic_axes {
      Value::Array(names) => Ok(names.iter().any(|n| n.as_str() == Some(input_name.as_str()))),
      Value::Object(map) => match map.get(&input_name) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Object(axes)) => Ok(axes.contains_key("2") || axes.contains_key("3")),
        Some(Value::Array(axes)) => Ok(
          axes
            .iter()
            .filter_map(Value::as_u64)
            .any(|axis| axis == 2 || axis == 3),
        ),
        Some(_) => Err(ConfigError::invalid(
          "dynamic_axes",
          format!("输入 {} 的动态轴需要列表或映射", input_name),
        )),
      },
      _ => Err(ConfigError::invalid("dynamic_axes", "需要列表或映射")),
    }
  }

  /// 当前部署配置下中间表示具备的能力
  pub fn ir_capabilities(&self) -> Result<IrCapabilities, ConfigError> {
    let mut capabilities = self.backend()?.native_capabilities();
    if self.is_dynamic_shape()? {
      capabilities.insert(IrCapability::DynamicShape);
    }
    if let Some(extra) = self.ir_config().and_then(|ir| ir.get("capabilities")) {
      let extra: IrCapabilities = serde_json::from_value(extra.clone())
        .map_err(|e| ConfigError::invalid("capabilities", e.to_string()))?;
      capabilities.extend(&extra);
    }
    debug!("中间表示能力: {}", capabilities);
    Ok(capabilities)
  }

  /// 静态输入尺寸 (宽, 高)
  pub fn input_shape(&self) -> Result<Option<(usize, usize)>, ConfigError> {
    let shape = match self.ir_config().and_then(|ir| ir.get("input_shape")) {
      None | Some(Value::Null) => return Ok(None),
      Some(shape) => shape,
    };
    let dims: Vec<usize> = serde_json::from_value(shape.clone())
      .map_err(|e| ConfigError::invalid("input_shape", e.to_string()))?;
    match dims.as_slice() {
      [w, h] => Ok(Some((*w, *h))),
      _ => Err(ConfigError::invalid("input_shape", "需要两个整数 (宽, 高)")),
    }
  }

  pub fn post_processing_params(&self) -> Result<PostProcessingParams, ConfigError> {
    let section = self.require("codebase_config.post_processing")?;
    serde_json::from_value(section.clone())
      .map_err(|e| ConfigError::invalid("codebase_config.post_processing", e.to_string()))
  }

  /// 是否允许一次导出调用处理多张图像
  pub fn batch_inference(&self) -> bool {
    self
      .get("codebase_config.batch_inference")
      .and_then(Value::as_bool)
      .unwrap_or(false)
  }
}

fn default_max_output_boxes_per_class() -> usize {
  100
}

fn default_iou_threshold() -> f32 {
  0.5
}

fn default_score_threshold() -> f32 {
  0.05
}

fn default_pre_top_k() -> i64 {
  -1
}

fn default_keep_top_k() -> i64 {
  100
}

/// 多类别 NMS 参数，非正的 `pre_top_k` / `keep_top_k` 表示不截断
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PostProcessingParams {
  #[serde(default = "default_max_output_boxes_per_class")]
  pub max_output_boxes_per_class: usize,
  #[serde(default = "default_iou_threshold")]
  pub iou_threshold: f32,
  #[serde(default = "default_score_threshold")]
  pub score_threshold: f32,
  #[serde(default = "default_pre_top_k")]
  pub pre_top_k: i64,
  #[serde(default = "default_keep_top_k")]
  pub keep_top_k: i64,
}

impl Default for PostProcessingParams {
  fn default() -> Self {
    Self {
      max_output_boxes_per_class: default_max_output_boxes_per_class(),
      iou_threshold: default_iou_threshold(),
      score_threshold: default_score_threshold(),
      pre_top_k: default_pre_top_k(),
      keep_top_k: default_keep_top_k(),
    }
  }
}

impl PostProcessingParams {
  /// 测试配置中出现的字段优先于部署配置
  pub fn with_test_cfg(mut self, cfg: &TestConfig) -> Self {
    if let Some(v) = cfg.max_output_boxes_per_class {
      self.max_output_boxes_per_class = v;
    }
    if let Some(v) = cfg.nms.as_ref().and_then(|nms| nms.iou_threshold) {
      self.iou_threshold = v;
    }
    if let Some(v) = cfg.score_thr {
      self.score_threshold = v;
    }
    if let Some(v) = cfg.pre_top_k {
      self.pre_top_k = v;
    }
    if let Some(v) = cfg.max_per_img {
      self.keep_top_k = v;
    }
    self
  }

  pub fn pre_top_k(&self) -> Option<usize> {
    positive(self.pre_top_k)
  }

  pub fn keep_top_k(&self) -> Option<usize> {
    positive(self.keep_top_k)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NmsConfig {
  #[serde(default)]
  pub iou_threshold: Option<f32>,
}

/// 单次调用的测试配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
  /// 每个特征层在 NMS 前保留的候选数量
  #[serde(default)]
  pub nms_pre: Option<i64>,
  #[serde(default)]
  pub score_thr: Option<f32>,
  #[serde(default)]
  pub nms: Option<NmsConfig>,
  #[serde(default)]
  pub max_per_img: Option<i64>,
  #[serde(default)]
  pub max_output_boxes_per_class: Option<usize>,
  #[serde(default)]
  pub pre_top_k: Option<i64>,
}

impl TestConfig {
  pub fn level_top_k(&self) -> Option<usize> {
    self.nms_pre.and_then(positive)
  }
}

fn positive(value: i64) -> Option<usize> {
  if value > 0 { Some(value as usize) } else { None }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn ncnn_static() -> DeployConfig {
    DeployConfig::from_value(json!({
      "backend_config": { "type": "ncnn" },
      "onnx_config": { "type": "onnx", "input_names": ["input"], "input_shape": [320, 320] },
      "codebase_config": {
        "type": "mmdet",
        "post_processing": { "score_threshold": 0.05, "iou_threshold": 0.6, "keep_top_k": 50 }
      }
    }))
    .unwrap()
  }

  #[test]
  fn reads_backend_and_shape() {
    let cfg = ncnn_static();
    assert_eq!(cfg.backend().unwrap(), Backend::Ncnn);
    assert_eq!(cfg.input_shape().unwrap(), Some((320, 320)));
    assert!(!cfg.is_dynamic_shape().unwrap());
    assert!(cfg.ir_capabilities().unwrap().is_empty());
    assert!(!cfg.batch_inference());
  }

  #[test]
  fn missing_backend_is_config_error() {
    let cfg = DeployConfig::from_value(json!({ "onnx_config": {} })).unwrap();
    assert!(matches!(cfg.backend(), Err(ConfigError::MissingField(_))));
  }

  #[test]
  fn non_object_is_rejected() {
    assert!(matches!(
      DeployConfig::from_value(json!([1, 2])),
      Err(ConfigError::NotATree)
    ));
  }

  #[test]
  fn dynamic_axes_forms() {
    let map = DeployConfig::from_value(json!({
      "backend_config": { "type": "onnxruntime" },
      "onnx_config": {
        "input_names": ["input"],
        "dynamic_axes": { "input": { "0": "batch", "2": "height", "3": "width" } }
      }
    }))
    .unwrap();
    assert!(map.is_dynamic_shape().unwrap());
    assert!(
      map
        .ir_capabilities()
        .unwrap()
        .contains(IrCapability::DynamicShape)
    );

    let batch_only = DeployConfig::from_value(json!({
      "backend_config": { "type": "onnxruntime" },
      "onnx_config": { "dynamic_axes": { "input": [0] } }
    }))
    .unwrap();
    assert!(!batch_only.is_dynamic_shape().unwrap());

    let list = DeployConfig::from_value(json!({
      "backend_config": { "type": "tensorrt" },
      "onnx_config": { "input_names": ["img"], "dynamic_axes": ["img"] }
    }))
    .unwrap();
    assert!(list.is_dynamic_shape().unwrap());

    let torchscript = DeployConfig::from_value(json!({
      "backend_config": { "type": "torchscript" }
    }))
    .unwrap();
    assert!(torchscript.is_dynamic_shape().unwrap());
  }

  #[test]
  fn explicit_capabilities_are_added() {
    let cfg = DeployConfig::from_value(json!({
      "backend_config": { "type": "ncnn" },
      "ir_config": { "capabilities": ["implicit_broadcast_2d"] }
    }))
    .unwrap();
    assert!(
      cfg
        .ir_capabilities()
        .unwrap()
        .contains(IrCapability::ImplicitBroadcast2d)
    );
  }

  #[test]
  fn post_processing_defaults_and_overrides() {
    let params = ncnn_static().post_processing_params().unwrap();
    assert_eq!(params.max_output_boxes_per_class, 100);
    assert_eq!(params.iou_threshold, 0.6);
    assert_eq!(params.keep_top_k(), Some(50));
    assert_eq!(params.pre_top_k(), None);

    let test_cfg: TestConfig = serde_json::from_value(json!({
      "nms_pre": 1000,
      "score_thr": 0.3,
      "nms": { "iou_threshold": 0.45 },
      "max_per_img": 10
    }))
    .unwrap();
    let merged = params.with_test_cfg(&test_cfg);
    assert_eq!(merged.score_threshold, 0.3);
    assert_eq!(merged.iou_threshold, 0.45);
    assert_eq!(merged.keep_top_k(), Some(10));
    assert_eq!(merged.max_output_boxes_per_class, 100);
    assert_eq!(test_cfg.level_top_k(), Some(1000));
  }

  #[test]
  fn missing_post_processing_section() {
    let cfg = DeployConfig::from_value(json!({ "backend_config": { "type": "ncnn" } })).unwrap();
    assert!(matches!(
      cfg.post_processing_params(),
      Err(ConfigError::MissingField(_))
    ));
  }
}
