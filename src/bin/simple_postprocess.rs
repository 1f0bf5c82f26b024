// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_postprocess.rs - 在修补后的检测头上执行后处理
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

use std::fs::File;
use std::io::BufWriter;

use anyhow::{Result, bail};
use clap::Parser;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use shanan_deploy::{
  FromUrl,
  config::DeployConfig,
  model::{FcosHead, GetBboxesArgs},
  rewrite::{Dispatcher, function_rewriter},
  task::{ContinuousTask, JsonLinesSink, RepeatShotTask, Task},
};

/// 后处理测试工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 部署配置文件 (file://...)
  #[arg(long, value_name = "DEPLOY")]
  pub deploy: Url,
  /// 检测头 (fcos:///?num_classes=80&strides=8,16,32,64,128)
  #[arg(long, value_name = "HEAD")]
  pub head: Url,
  /// 检测头输出，JSON 对象或对象数组 (file://...)
  #[arg(long, value_name = "INPUT")]
  pub input: Url,
  /// 结果输出文件，缺省写到标准输出
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  #[arg(long, value_name = "INPUT_NUMBER")]
  pub input_number: Option<usize>,
  /// 对第一个输入重复执行的次数
  #[arg(long, value_name = "REPEAT")]
  pub repeat: Option<usize>,
}

fn load_inputs(url: &Url) -> Result<Vec<GetBboxesArgs>> {
  if url.scheme() != "file" {
    bail!("输入必须使用 file 方案: {}", url);
  }
  let text = std::fs::read_to_string(url.path())?;
  let inputs = match serde_json::from_str::<Value>(&text)? {
    Value::Array(items) => items
      .into_iter()
      .map(serde_json::from_value)
      .collect::<Result<Vec<GetBboxesArgs>, _>>()?,
    single => vec![serde_json::from_value(single)?],
  };
  info!("读取 {} 个输入", inputs.len());
  Ok(inputs)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  info!("部署配置: {}", args.deploy);
  info!("检测头: {}", args.head);
  info!("输入来源: {}", args.input);

  let cfg = DeployConfig::from_url(&args.deploy)?;
  let head = FcosHead::from_url(&args.head)?;
  let inputs = load_inputs(&args.input)?;

  let registry = function_rewriter()?;
  let dispatcher = Dispatcher::new(&registry, &cfg)?;

  let writer: Box<dyn std::io::Write> = match &args.output {
    Some(url) if url.scheme() == "file" => Box::new(BufWriter::new(File::create(url.path())?)),
    Some(url) => bail!("输出必须使用 file 方案: {}", url),
    None => Box::new(std::io::stdout().lock()),
  };
  let sink = JsonLinesSink::new(writer);

  match args.repeat {
    Some(repeat) => RepeatShotTask::default()
      .with_repeat_times(repeat)
      .run_task(&dispatcher, &head, inputs.into_iter(), sink)?,
    None => ContinuousTask::default()
      .with_input_number(args.input_number)
      .run_task(&dispatcher, &head, inputs.into_iter(), sink)?,
  }

  Ok(())
}
