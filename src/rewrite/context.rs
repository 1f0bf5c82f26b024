// 该文件是 Shanan （山南西风） 项目的一部分。
// src/rewrite/context.rs - 重写调用上下文
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

use serde_json::{Map, Value};

use super::RewritableMethod;
use crate::{
  backend::{Backend, IrCapabilities},
  config::DeployConfig,
};

/// 单次重写调用的上下文，仅在调用期间存在
pub struct RewriteContext<'a, M: RewritableMethod> {
  cfg: &'a DeployConfig,
  backend: Backend,
  capabilities: &'a IrCapabilities,
  target: &'a M::Target,
  extra: &'a Map<String, Value>,
}

impl<'a, M: RewritableMethod> RewriteContext<'a, M> {
  pub(crate) fn new(
    cfg: &'a DeployConfig,
    backend: Backend,
    capabilities: &'a IrCapabilities,
    target: &'a M::Target,
    extra: &'a Map<String, Value>,
  ) -> Self {
    Self {
      cfg,
      backend,
      capabilities,
      target,
      extra,
    }
  }

  pub fn cfg(&self) -> &'a DeployConfig {
    self.cfg
  }

  pub fn backend(&self) -> Backend {
    self.backend
  }

  pub fn capabilities(&self) -> &'a IrCapabilities {
    self.capabilities
  }

  pub fn extra(&self) -> &'a Map<String, Value> {
    self.extra
  }

  /// 调用绑定在同一实例上的原始实现
  pub fn origin_func(&self, args: M::Args) -> Result<M::Output, M::Error> {
    M::call_original(self.target, args)
  }
}
