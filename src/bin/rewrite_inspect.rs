// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/rewrite_inspect.rs - 查看重写规则及其解析结果
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

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use shanan_deploy::{FromUrl, config::DeployConfig, rewrite::function_rewriter};

/// 重写规则查看工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 部署配置文件 (file://...)
  #[arg(long, value_name = "DEPLOY")]
  pub deploy: Url,
  /// 限定方法名，缺省时列出全部
  #[arg(long, value_name = "FUNCTION")]
  pub function: Option<String>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let args = Args::parse();
  info!("部署配置: {}", args.deploy);

  let cfg = DeployConfig::from_url(&args.deploy)?;
  let backend = cfg.backend()?;
  let capabilities = cfg.ir_capabilities()?;
  println!("backend: {}", backend);
  println!("capabilities: {}", capabilities);
  match cfg.input_shape()? {
    Some((w, h)) => println!("input_shape: {}x{}", w, h),
    None => println!("input_shape: dynamic"),
  }

  let registry = function_rewriter()?;
  let names = match args.function {
    Some(name) => vec![name],
    None => registry.qualified_names(),
  };

  for name in names {
    println!();
    println!("{}", name);
    let rules = registry.rules(&name);
    if rules.is_empty() {
      warn!("没有注册任何规则: {}", name);
    }
    for rule in &rules {
      println!("  rule: backend={}, capability={}", rule.backend, rule.capability);
    }
    match registry.resolve_info(&name, backend, &capabilities) {
      Ok(rule) => println!("  => backend={}, capability={}", rule.backend, rule.capability),
      Err(e) if e.is_miss() => println!("  => 原始实现 ({})", e),
      Err(e) => return Err(e.into()),
    }
  }

  Ok(())
}
