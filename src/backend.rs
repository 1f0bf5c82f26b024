// 该文件是 Shanan （山南西风） 项目的一部分。
// src/backend.rs - 推理后端与中间表示能力
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

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 导出目标推理后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  Default,
  TensorRT,
  OnnxRuntime,
  Pplnn,
  Ncnn,
  Snpe,
  OpenVino,
  Sdk,
  TorchScript,
  Rknn,
  CoreML,
  Ascend,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("未知的后端: {0}")]
pub struct UnknownBackend(pub String);

impl Backend {
  pub const ALL: [Backend; 12] = [
    Backend::Default,
    Backend::TensorRT,
    Backend::OnnxRuntime,
    Backend::Pplnn,
    Backend::Ncnn,
    Backend::Snpe,
    Backend::OpenVino,
    Backend::Sdk,
    Backend::TorchScript,
    Backend::Rknn,
    Backend::CoreML,
    Backend::Ascend,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Backend::Default => "default",
      Backend::TensorRT => "tensorrt",
      Backend::OnnxRuntime => "onnxruntime",
      Backend::Pplnn => "pplnn",
      Backend::Ncnn => "ncnn",
      Backend::Snpe => "snpe",
      Backend::OpenVino => "openvino",
      Backend::Sdk => "sdk",
      Backend::TorchScript => "torchscript",
      Backend::Rknn => "rknn",
      Backend::CoreML => "coreml",
      Backend::Ascend => "ascend",
    }
  }

  /// 后端本身提供的图表达能力，不含由部署配置决定的部分
  pub fn native_capabilities(&self) -> IrCapabilities {
    match self {
      // ncnn 的 BinaryOp 不支持二维张量隐式广播
      Backend::Ncnn => IrCapabilities::empty(),
      _ => IrCapabilities::from_iter([IrCapability::ImplicitBroadcast2d]),
    }
  }
}

impl fmt::Display for Backend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Backend {
  type Err = UnknownBackend;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.to_ascii_lowercase();
    Backend::ALL
      .into_iter()
      .find(|backend| backend.as_str() == lower)
      .ok_or(UnknownBackend(s.to_string()))
  }
}

/// 中间表示可表达的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IrCapability {
  #[serde(rename = "dynamic_shape")]
  DynamicShape,
  #[serde(rename = "implicit_broadcast_2d")]
  ImplicitBroadcast2d,
}

impl IrCapability {
  pub fn as_str(&self) -> &'static str {
    match self {
      IrCapability::DynamicShape => "dynamic_shape",
      IrCapability::ImplicitBroadcast2d => "implicit_broadcast_2d",
    }
  }
}

impl fmt::Display for IrCapability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IrCapabilities(BTreeSet<IrCapability>);

impl IrCapabilities {
  pub fn empty() -> Self {
    Self(BTreeSet::new())
  }

  pub fn insert(&mut self, capability: IrCapability) -> bool {
    self.0.insert(capability)
  }

  pub fn contains(&self, capability: IrCapability) -> bool {
    self.0.contains(&capability)
  }

  pub fn is_superset(&self, other: &IrCapabilities) -> bool {
    self.0.is_superset(&other.0)
  }

  pub fn extend(&mut self, other: &IrCapabilities) {
    self.0.extend(other.0.iter().copied());
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl FromIterator<IrCapability> for IrCapabilities {
  fn from_iter<T: IntoIterator<Item = IrCapability>>(iter: T) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl fmt::Display for IrCapabilities {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names: Vec<&str> = self.0.iter().map(IrCapability::as_str).collect();
    write!(f, "{{{}}}", names.join(", "))
  }
}
