// 该文件是 Shanan （山南西风） 项目的一部分。
// src/rewrite/dispatcher.rs - 重写调度与作用域修补
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

use std::cell::RefCell;
use std::collections::HashSet;
use std::marker::PhantomData;

use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{RewritableMethod, RewriteContext, RewriteError, RewriteRegistry};
use crate::{
  backend::{Backend, IrCapabilities},
  config::{ConfigError, DeployConfig},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatchKey {
  target: usize,
  qualified_name: String,
}

impl PatchKey {
  fn new<T: ?Sized>(target: &T, qualified_name: &str) -> Self {
    Self {
      target: std::ptr::from_ref(target).cast::<()>() as usize,
      qualified_name: qualified_name.to_string(),
    }
  }
}

/// 在调用点注入重写实现的调度器
///
/// 后端与中间表示能力在构造时从部署配置读取，之后不再变化。
pub struct Dispatcher<'r> {
  registry: &'r RewriteRegistry,
  cfg: &'r DeployConfig,
  backend: Backend,
  capabilities: IrCapabilities,
  extra: Map<String, Value>,
  patched: RefCell<HashSet<PatchKey>>,
}

impl<'r> Dispatcher<'r> {
  pub fn new(registry: &'r RewriteRegistry, cfg: &'r DeployConfig) -> Result<Self, ConfigError> {
    let backend = cfg.backend()?;
    let capabilities = cfg.ir_capabilities()?;
    info!("创建重写调度器: backend={}, capabilities={}", backend, capabilities);
    Ok(Self {
      registry,
      cfg,
      backend,
      capabilities,
      extra: Map::new(),
      patched: RefCell::new(HashSet::new()),
    })
  }

  /// 附加随上下文传递的调用元信息
  pub fn with_extra(mut self, key: &str, value: Value) -> Self {
    self.extra.insert(key.to_string(), value);
    self
  }

  pub fn backend(&self) -> Backend {
    self.backend
  }

  pub fn capabilities(&self) -> &IrCapabilities {
    &self.capabilities
  }

  pub fn cfg(&self) -> &'r DeployConfig {
    self.cfg
  }

  /// 修补目标实例的方法，返回的守卫释放时恢复原始实现
  ///
  /// 同一实例的同一方法在守卫存活期间不能再次修补。
  pub fn patch<'a, M: RewritableMethod>(
    &'a self,
    target: &'a M::Target,
    qualified_name: &str,
  ) -> Result<PatchGuard<'a, 'r, M>, RewriteError> {
    let key = PatchKey::new(target, qualified_name);
    if !self.patched.borrow_mut().insert(key.clone()) {
      return Err(RewriteError::AlreadyPatched(qualified_name.to_string()));
    }
    debug!("修补方法: {}", qualified_name);
    Ok(PatchGuard {
      dispatcher: self,
      target,
      key,
      _method: PhantomData,
    })
  }

  pub fn is_patched<M: RewritableMethod>(&self, target: &M::Target, qualified_name: &str) -> bool {
    self
      .patched
      .borrow()
      .contains(&PatchKey::new(target, qualified_name))
  }

  /// 模型代码的调用点：已修补时走重写，否则调用原始实现
  pub fn invoke<M: RewritableMethod>(
    &self,
    target: &M::Target,
    qualified_name: &str,
    args: M::Args,
  ) -> Result<M::Output, M::Error> {
    if self.is_patched::<M>(target, qualified_name) {
      self.dispatch::<M>(target, qualified_name, args)
    } else {
      M::call_original(target, args)
    }
  }

  fn dispatch<M: RewritableMethod>(
    &self,
    target: &M::Target,
    qualified_name: &str,
    args: M::Args,
  ) -> Result<M::Output, M::Error> {
    match self
      .registry
      .resolve::<M>(qualified_name, self.backend, &self.capabilities)
    {
      Ok(implementation) => {
        let ctx = RewriteContext::<M>::new(
          self.cfg,
          self.backend,
          &self.capabilities,
          target,
          &self.extra,
        );
        implementation(&ctx, target, args)
      }
      Err(e) if e.is_miss() => {
        debug!("{}，回退到原始实现", e);
        M::call_original(target, args)
      }
      Err(e) => Err(e.into()),
    }
  }
}

/// 修补守卫，释放（包括展开时）即恢复原始实现
pub struct PatchGuard<'a, 'r, M: RewritableMethod> {
  dispatcher: &'a Dispatcher<'r>,
  target: &'a M::Target,
  key: PatchKey,
  _method: PhantomData<fn() -> M>,
}

impl<M: RewritableMethod> PatchGuard<'_, '_, M> {
  pub fn qualified_name(&self) -> &str {
    &self.key.qualified_name
  }

  pub fn call(&self, args: M::Args) -> Result<M::Output, M::Error> {
    self
      .dispatcher
      .dispatch::<M>(self.target, &self.key.qualified_name, args)
  }

  /// 显式释放
  pub fn close(self) {}
}

impl<M: RewritableMethod> Drop for PatchGuard<'_, '_, M> {
  fn drop(&mut self) {
    self.dispatcher.patched.borrow_mut().remove(&self.key);
    debug!("恢复原始方法: {}", self.key.qualified_name);
  }
}
