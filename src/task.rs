// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 导出任务
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

use std::io::Write;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{
  model::{BboxOutput, DenseHead, GetBboxes, GetBboxesArgs},
  rewrite::Dispatcher,
};

/// 接收每次调用结果的输出端
pub trait Sink {
  type Error;
  fn record(&mut self, index: usize, output: &BboxOutput) -> Result<(), Self::Error>;
}

impl Sink for Vec<BboxOutput> {
  type Error = std::convert::Infallible;

  fn record(&mut self, _index: usize, output: &BboxOutput) -> Result<(), Self::Error> {
    self.push(output.clone());
    Ok(())
  }
}

impl<S: Sink + ?Sized> Sink for &mut S {
  type Error = S::Error;

  fn record(&mut self, index: usize, output: &BboxOutput) -> Result<(), Self::Error> {
    (**self).record(index, output)
  }
}

/// 每个结果写为一行 JSON
pub struct JsonLinesSink<W: Write> {
  writer: W,
}

impl<W: Write> JsonLinesSink<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}

impl<W: Write> Sink for JsonLinesSink<W> {
  type Error = std::io::Error;

  fn record(&mut self, _index: usize, output: &BboxOutput) -> Result<(), Self::Error> {
    serde_json::to_writer(&mut self.writer, output)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()
  }
}

/// 在修补后的检测头上驱动 `get_bboxes`
///
/// 修补只在任务执行期间有效，返回（包括出错）后原始实现即被恢复。
pub trait Task<I, O>: Sized {
  type Error;
  fn run_task(
    self,
    dispatcher: &Dispatcher<'_>,
    head: &(dyn DenseHead + 'static),
    input: I,
    output: O,
  ) -> Result<(), Self::Error>;
}

pub struct OneShotTask;

impl<SE, I, O> Task<I, O> for OneShotTask
where
  SE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = GetBboxesArgs>,
  O: Sink<Error = SE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    dispatcher: &Dispatcher<'_>,
    head: &(dyn DenseHead + 'static),
    mut input: I,
    mut output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let args = input.next().ok_or_else(|| anyhow::anyhow!("没有输入"))?;
    let guard = dispatcher.patch::<GetBboxes>(head, head.get_bboxes_name())?;
    info!("已修补 {}，开始后处理...", guard.qualified_name());
    let now = Instant::now();
    let result = guard.call(args)?;
    let elapsed = now.elapsed();
    info!("后处理完成，耗时: {:.2?}", elapsed);
    output.record(0, &result)?;
    info!("输出完成，共 {} 张图像", result.num_images());

    Ok(())
  }
}

/// 对同一输入重复执行，用于统计耗时
pub struct RepeatShotTask {
  repeat_times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { repeat_times: 100 }
  }
}

impl RepeatShotTask {
  pub fn with_repeat_times(mut self, repeat_times: usize) -> Self {
    self.repeat_times = repeat_times.max(1);
    self
  }
}

impl<SE, I, O> Task<I, O> for RepeatShotTask
where
  SE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = GetBboxesArgs>,
  O: Sink<Error = SE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    dispatcher: &Dispatcher<'_>,
    head: &(dyn DenseHead + 'static),
    mut input: I,
    mut output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let args = input.next().ok_or_else(|| anyhow::anyhow!("没有输入"))?;
    let guard = dispatcher.patch::<GetBboxes>(head, head.get_bboxes_name())?;
    let mut times = Vec::with_capacity(self.repeat_times);
    for i in 0..self.repeat_times {
      let now = Instant::now();
      let result = guard.call(args.clone())?;
      let elapsed = now.elapsed();
      info!("({})后处理完成，耗时: {:.2?}", i, elapsed);
      output.record(i, &result)?;
      times.push(elapsed);
    }

    // 前两次为预热
    let warm = if times.len() > 2 { &times[2..] } else { &times[..] };
    warn!(
      "平均后处理时间: {:.2?}",
      warm.iter().sum::<Duration>() / warm.len() as u32
    );

    Ok(())
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  input_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_input_number(mut self, input_number: Option<usize>) -> Self {
    self.input_number = input_number;
    self
  }
}

impl<SE, I, O> Task<I, O> for ContinuousTask
where
  SE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = GetBboxesArgs>,
  O: Sink<Error = SE>,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    dispatcher: &Dispatcher<'_>,
    head: &(dyn DenseHead + 'static),
    input: I,
    mut output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let guard = dispatcher.patch::<GetBboxes>(head, head.get_bboxes_name())?;

    // Some(0) 表示不处理任何输入
    let limit = self.input_number.unwrap_or(usize::MAX);
    let mut index = 0;
    let mut now = Instant::now();
    for args in input.take(limit) {
      info!("处理第 {} 个输入", index);
      let result = guard.call(args)?;
      let elapsed_a = now.elapsed();
      output.record(index, &result)?;
      let elapsed_b = now.elapsed();
      now = Instant::now();
      info!("后处理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
      index += 1;
    }
    if self.input_number.is_some_and(|n| index >= n) {
      info!("达到指定输入数 {}, 退出任务循环", index);
    }

    info!("任务结束，共处理 {} 个输入", index);
    Ok(())
  }
}
