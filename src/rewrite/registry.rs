// 该文件是 Shanan （山南西风） 项目的一部分。
// src/rewrite/registry.rs - 重写规则注册表
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

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use super::{RewritableMethod, RewriteContext, RewriteError, RewriteFn};
use crate::backend::{Backend, IrCapabilities};

/// 规则适用的后端
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendMatch {
  Any,
  Exact(Backend),
}

impl fmt::Display for BackendMatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BackendMatch::Any => f.write_str("any"),
      BackendMatch::Exact(backend) => write!(f, "{}", backend),
    }
  }
}

/// 规则要求的中间表示能力
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityMatch {
  Any,
  Requires(IrCapabilities),
}

impl CapabilityMatch {
  /// 空集合与 `Any` 等价
  pub fn requires(capabilities: IrCapabilities) -> Self {
    if capabilities.is_empty() {
      CapabilityMatch::Any
    } else {
      CapabilityMatch::Requires(capabilities)
    }
  }
}

impl fmt::Display for CapabilityMatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CapabilityMatch::Any => f.write_str("any"),
      CapabilityMatch::Requires(capabilities) => write!(f, "{}", capabilities),
    }
  }
}

struct RewriteRule {
  backend: BackendMatch,
  capability: CapabilityMatch,
  signature: &'static str,
  implementation: Box<dyn Any + Send + Sync>,
}

impl RewriteRule {
  /// 返回 (优先级, 要求的能力数)，不适用时返回 None
  ///
  /// 优先级：后端与能力都匹配 3，仅后端 2，仅能力 1，都为 any 0。
  fn specificity(&self, backend: Backend, capabilities: &IrCapabilities) -> Option<(u8, usize)> {
    let backend_exact = match self.backend {
      BackendMatch::Any => false,
      BackendMatch::Exact(b) if b == backend => true,
      BackendMatch::Exact(_) => return None,
    };
    let required = match &self.capability {
      CapabilityMatch::Any => None,
      CapabilityMatch::Requires(req) if capabilities.is_superset(req) => Some(req.len()),
      CapabilityMatch::Requires(_) => return None,
    };
    let rank = match (backend_exact, required.is_some()) {
      (true, true) => 3,
      (true, false) => 2,
      (false, true) => 1,
      (false, false) => 0,
    };
    Some((rank, required.unwrap_or(0)))
  }

  fn info(&self, name: &str) -> RuleInfo {
    RuleInfo {
      qualified_name: name.to_string(),
      backend: self.backend.clone(),
      capability: self.capability.clone(),
      signature: self.signature,
    }
  }
}

/// 已注册规则的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
  pub qualified_name: String,
  pub backend: BackendMatch,
  pub capability: CapabilityMatch,
  pub signature: &'static str,
}

impl fmt::Display for RuleInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} [backend={}, capability={}]",
      self.qualified_name, self.backend, self.capability
    )
  }
}

/// 限定方法名到候选重写实现的映射
///
/// 同名规则按注册顺序保存，解析时按特异性挑选唯一结果。
#[derive(Default)]
pub struct RewriteRegistry {
  rules: HashMap<String, Vec<RewriteRule>>,
}

impl RewriteRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册一条规则，完全相同的 (名称, 后端, 能力) 组合会被拒绝
  pub fn register<M, F>(
    &mut self,
    qualified_name: &str,
    backend: BackendMatch,
    capability: CapabilityMatch,
    implementation: F,
  ) -> Result<(), RewriteError>
  where
    M: RewritableMethod,
    F: Fn(&RewriteContext<'_, M>, &M::Target, M::Args) -> Result<M::Output, M::Error>
      + Send
      + Sync
      + 'static,
  {
    let capability = normalize(capability);
    let rules = self.rules.entry(qualified_name.to_string()).or_default();
    if rules
      .iter()
      .any(|rule| rule.backend == backend && rule.capability == capability)
    {
      return Err(RewriteError::DuplicateRule {
        name: qualified_name.to_string(),
        backend,
        capability,
      });
    }

    info!(
      "注册重写规则: {} [backend={}, capability={}]",
      qualified_name, backend, capability
    );
    rules.push(RewriteRule {
      backend,
      capability,
      signature: type_name::<M>(),
      implementation: Box::new(erase::<M, F>(implementation)),
    });
    Ok(())
  }

  /// 显式替换已有规则，不存在时等同于注册
  pub fn replace<M, F>(
    &mut self,
    qualified_name: &str,
    backend: BackendMatch,
    capability: CapabilityMatch,
    implementation: F,
  ) -> Result<(), RewriteError>
  where
    M: RewritableMethod,
    F: Fn(&RewriteContext<'_, M>, &M::Target, M::Args) -> Result<M::Output, M::Error>
      + Send
      + Sync
      + 'static,
  {
    let capability = normalize(capability);
    if let Some(rules) = self.rules.get_mut(qualified_name) {
      if let Some(rule) = rules
        .iter_mut()
        .find(|rule| rule.backend == backend && rule.capability == capability)
      {
        info!(
          "替换重写规则: {} [backend={}, capability={}]",
          qualified_name, backend, capability
        );
        rule.signature = type_name::<M>();
        rule.implementation = Box::new(erase::<M, F>(implementation));
        return Ok(());
      }
    }
    self.register::<M, F>(qualified_name, backend, capability, implementation)
  }

  fn best_rule(
    &self,
    qualified_name: &str,
    backend: Backend,
    capabilities: &IrCapabilities,
  ) -> Result<&RewriteRule, RewriteError> {
    let rules = self
      .rules
      .get(qualified_name)
      .filter(|rules| !rules.is_empty())
      .ok_or_else(|| RewriteError::NoRuleFound(qualified_name.to_string()))?;

    let mut best: Option<((u8, usize), &RewriteRule)> = None;
    for rule in rules {
      if let Some(score) = rule.specificity(backend, capabilities) {
        // 同分时保留先注册的规则
        if best.is_none_or(|(best_score, _)| score > best_score) {
          best = Some((score, rule));
        }
      }
    }

    best
      .map(|(_, rule)| rule)
      .ok_or_else(|| RewriteError::NoMatchingRule {
        name: qualified_name.to_string(),
        backend,
        capabilities: capabilities.clone(),
      })
  }

  /// 解析给定后端与能力下最匹配的实现
  pub fn resolve<M: RewritableMethod>(
    &self,
    qualified_name: &str,
    backend: Backend,
    capabilities: &IrCapabilities,
  ) -> Result<RewriteFn<M>, RewriteError> {
    let rule = self.best_rule(qualified_name, backend, capabilities)?;
    let implementation = rule
      .implementation
      .downcast_ref::<RewriteFn<M>>()
      .cloned()
      .ok_or_else(|| RewriteError::SignatureMismatch {
        name: qualified_name.to_string(),
        registered: rule.signature,
        requested: type_name::<M>(),
      })?;
    debug!(
      "解析重写规则: {} -> [backend={}, capability={}]",
      qualified_name, rule.backend, rule.capability
    );
    Ok(implementation)
  }

  /// 不关心签名时查看会被选中的规则
  pub fn resolve_info(
    &self,
    qualified_name: &str,
    backend: Backend,
    capabilities: &IrCapabilities,
  ) -> Result<RuleInfo, RewriteError> {
    self
      .best_rule(qualified_name, backend, capabilities)
      .map(|rule| rule.info(qualified_name))
  }

  pub fn contains(&self, qualified_name: &str) -> bool {
    self
      .rules
      .get(qualified_name)
      .is_some_and(|rules| !rules.is_empty())
  }

  pub fn qualified_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.rules.keys().cloned().collect();
    names.sort();
    names
  }

  pub fn rules(&self, qualified_name: &str) -> Vec<RuleInfo> {
    self
      .rules
      .get(qualified_name)
      .map(|rules| rules.iter().map(|rule| rule.info(qualified_name)).collect())
      .unwrap_or_default()
  }
}

fn normalize(capability: CapabilityMatch) -> CapabilityMatch {
  match capability {
    CapabilityMatch::Requires(caps) => CapabilityMatch::requires(caps),
    any => any,
  }
}

fn erase<M, F>(implementation: F) -> RewriteFn<M>
where
  M: RewritableMethod,
  F: Fn(&RewriteContext<'_, M>, &M::Target, M::Args) -> Result<M::Output, M::Error>
    + Send
    + Sync
    + 'static,
{
  Arc::new(implementation)
}
