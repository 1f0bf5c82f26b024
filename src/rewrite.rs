// 该文件是 Shanan （山南西风） 项目的一部分。
// src/rewrite.rs - 导出时的方法重写
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

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::error;

use crate::backend::{Backend, IrCapabilities};

mod context;
mod dispatcher;
mod registry;

pub use self::context::RewriteContext;
pub use self::dispatcher::{Dispatcher, PatchGuard};
pub use self::registry::{BackendMatch, CapabilityMatch, RewriteRegistry, RuleInfo};

/// 可在导出时被替换的模型方法
///
/// 每个实现类型对应一种方法签名，`call_original` 调用模型自身的实现。
pub trait RewritableMethod: 'static {
  type Target: ?Sized + 'static;
  type Args: 'static;
  type Output: 'static;
  type Error: From<RewriteError> + 'static;

  fn call_original(target: &Self::Target, args: Self::Args) -> Result<Self::Output, Self::Error>;
}

/// 重写实现：接收上下文、目标实例与原始参数
pub type RewriteFn<M> = Arc<
  dyn Fn(
      &RewriteContext<'_, M>,
      &<M as RewritableMethod>::Target,
      <M as RewritableMethod>::Args,
    ) -> Result<<M as RewritableMethod>::Output, <M as RewritableMethod>::Error>
    + Send
    + Sync,
>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
  #[error("重写规则重复注册: {name} [{backend}, {capability}]")]
  DuplicateRule {
    name: String,
    backend: BackendMatch,
    capability: CapabilityMatch,
  },
  #[error("未注册任何重写规则: {0}")]
  NoRuleFound(String),
  #[error("没有适用于 {backend} {capabilities} 的重写规则: {name}")]
  NoMatchingRule {
    name: String,
    backend: Backend,
    capabilities: IrCapabilities,
  },
  #[error("重写规则签名不匹配: {name}, 注册为 {registered}, 请求为 {requested}")]
  SignatureMismatch {
    name: String,
    registered: &'static str,
    requested: &'static str,
  },
  #[error("方法已被修补，不允许重复修补: {0}")]
  AlreadyPatched(String),
}

impl RewriteError {
  /// 解析未命中，调度器应回退到原始实现
  pub fn is_miss(&self) -> bool {
    matches!(
      self,
      RewriteError::NoRuleFound(_) | RewriteError::NoMatchingRule { .. }
    )
  }
}

/// 进程级的重写注册表，首次访问时注册内置重写
static FUNCTION_REWRITER: OnceCell<RwLock<RewriteRegistry>> = OnceCell::new();

fn global_registry() -> Result<&'static RwLock<RewriteRegistry>, RewriteError> {
  FUNCTION_REWRITER.get_or_try_init(|| {
    let mut registry = RewriteRegistry::new();
    crate::model::register_rewriters(&mut registry).inspect_err(|e| {
      error!("注册内置重写失败: {}", e);
    })?;
    Ok(RwLock::new(registry))
  })
}

/// 内置重写注册失败时返回错误，下次访问会重新尝试
pub fn function_rewriter() -> Result<RwLockReadGuard<'static, RewriteRegistry>, RewriteError> {
  Ok(
    global_registry()?
      .read()
      .unwrap_or_else(PoisonError::into_inner),
  )
}

pub fn function_rewriter_mut() -> Result<RwLockWriteGuard<'static, RewriteRegistry>, RewriteError> {
  Ok(
    global_registry()?
      .write()
      .unwrap_or_else(PoisonError::into_inner),
  )
}
