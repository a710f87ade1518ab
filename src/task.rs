// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 采集、推理与发布任务
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

//! 每个设备一个后台线程：读帧、推理、标注，然后发布到信箱和实时画面。
//!
//! 读帧失败时进入重连：固定间隔重新打开输入源，连续失败达到上限后任务结束，
//! 直到设备被重新添加。重新打开后的第一帧有效画面会清零失败计数。

use std::{
  cell::Cell,
  sync::{
    Arc, Mutex,
    mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
  },
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  client,
  config::DeviceConfig,
  frame::Frame,
  input::{FrameSourceError, FrameSourceOpener},
  mailbox::Mailbox,
  model::{InferenceError, InferenceService, ModelInput, ModelSpec},
  output::{FrameSink, InferenceResult, annotate::Annotator, draw::Draw, encode_jpeg},
  tensor::{TensorError, decode_detections},
};

/// 连续失败的最大次数
pub const RECONNECT_ATTEMPTS: u32 = 60;
/// 两次重连之间的固定间隔
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub attempts: u32,
  pub interval: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: RECONNECT_ATTEMPTS,
      interval: RECONNECT_INTERVAL,
    }
  }
}

/// 单次任务运行内的连续失败计数
#[derive(Debug, Clone)]
pub struct RetryState {
  attempts: u32,
  max_attempts: u32,
}

impl RetryState {
  pub fn new(max_attempts: u32) -> Self {
    Self {
      attempts: 0,
      max_attempts: max_attempts.max(1),
    }
  }

  /// 记录一次失败，返回是否已耗尽
  pub fn record_failure(&mut self) -> bool {
    self.attempts = self.attempts.saturating_add(1);
    self.attempts >= self.max_attempts
  }

  pub fn reset(&mut self) {
    self.attempts = 0;
  }

  pub fn attempts(&self) -> u32 {
    self.attempts
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }
}

/// 流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Streaming,
  Reconnecting,
  Terminated,
}

/// 任务结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
  /// 收到停止信号
  Stopped,
  /// 连续失败次数耗尽
  Exhausted { attempts: u32 },
}

/// 导致重连的流错误
#[derive(Error, Debug)]
pub enum StreamError {
  #[error("打开输入源失败: {0}")]
  Open(#[source] FrameSourceError),
  #[error("获取模型元数据失败: {0}")]
  Metadata(#[source] InferenceError),
  #[error("读取帧失败: {0}")]
  Read(#[source] FrameSourceError),
}

/// 单帧处理错误，只跳过当前帧
#[derive(Error, Debug)]
pub enum FrameError {
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Tensor(#[from] TensorError),
  #[error("结果图像编码失败: {0}")]
  Encode(#[from] image::ImageError),
}

/// 任务侧的停止信号，发送端被丢弃同样视为停止
pub struct StopSignal {
  rx: Receiver<()>,
  stopped: Cell<bool>,
}

/// 控制侧的停止句柄
#[derive(Clone)]
pub struct StopHandle {
  tx: Sender<()>,
}

impl StopHandle {
  pub fn stop(&self) {
    let _ = self.tx.send(());
  }
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
  let (tx, rx) = mpsc::channel();
  (
    StopHandle { tx },
    StopSignal {
      rx,
      stopped: Cell::new(false),
    },
  )
}

impl StopSignal {
  pub fn is_stopped(&self) -> bool {
    if self.stopped.get() {
      return true;
    }
    let stopped = match self.rx.try_recv() {
      Ok(()) | Err(TryRecvError::Disconnected) => true,
      Err(TryRecvError::Empty) => false,
    };
    self.stopped.set(stopped);
    stopped
  }

  /// 等待 `timeout`，期间收到停止信号时提前返回 `true`
  pub fn wait(&self, timeout: Duration) -> bool {
    if self.is_stopped() {
      return true;
    }
    match self.rx.recv_timeout(timeout) {
      Ok(()) | Err(RecvTimeoutError::Disconnected) => {
        self.stopped.set(true);
        true
      }
      Err(RecvTimeoutError::Timeout) => false,
    }
  }
}

/// 运行中的任务
pub struct TaskHandle {
  stop: StopHandle,
  handle: thread::JoinHandle<TaskExit>,
}

impl TaskHandle {
  pub fn stop(&self) {
    self.stop.stop();
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }

  /// 等待线程退出，线程 panic 时返回 `None`
  pub fn join(self) -> Option<TaskExit> {
    self.handle.join().ok()
  }
}

/// 单个设备的采集推理任务
pub struct CaptureTask {
  device: String,
  uri: String,
  model: ModelSpec,
  snapshot: bool,
  opener: Arc<dyn FrameSourceOpener>,
  client: Arc<dyn InferenceService>,
  annotator: Annotator,
  sink: Arc<dyn FrameSink>,
  mailbox: Arc<Mailbox<InferenceResult>>,
  model_input: Arc<Mutex<Option<ModelInput>>>,
  retry: RetryPolicy,
}

impl CaptureTask {
  pub fn new(
    device: &str,
    config: &DeviceConfig,
    opener: Arc<dyn FrameSourceOpener>,
    client: Arc<dyn InferenceService>,
    sink: Arc<dyn FrameSink>,
    draw: Arc<Draw>,
  ) -> Self {
    Self {
      device: device.to_string(),
      uri: config.uri.clone(),
      model: config.model.clone(),
      snapshot: config.snapshot,
      opener,
      client,
      annotator: Annotator::new(config.score, draw),
      sink,
      mailbox: Arc::new(Mailbox::new()),
      model_input: Arc::new(Mutex::new(None)),
      retry: RetryPolicy::default(),
    }
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_mailbox(mut self, mailbox: Arc<Mailbox<InferenceResult>>) -> Self {
    self.mailbox = mailbox;
    self
  }

  pub fn mailbox(&self) -> Arc<Mailbox<InferenceResult>> {
    self.mailbox.clone()
  }

  /// 最近一次打开输入源时获取的模型输入
  pub fn model_input(&self) -> Arc<Mutex<Option<ModelInput>>> {
    self.model_input.clone()
  }

  /// 在独立线程上运行任务
  pub fn spawn(self) -> std::io::Result<TaskHandle> {
    let (stop, signal) = stop_channel();
    let handle = thread::Builder::new()
      .name(format!("capture-{}", self.device))
      .spawn(move || self.run(&signal))?;
    Ok(TaskHandle { stop, handle })
  }

  /// 运行直到收到停止信号或连续失败次数耗尽
  pub fn run(self, stop: &StopSignal) -> TaskExit {
    info!(
      "设备 {} 开始采集任务, 输入源: {}, 阈值: {}",
      self.device,
      self.uri,
      self.annotator.threshold()
    );
    let mut retry = RetryState::new(self.retry.attempts);
    let mut state = StreamState::Streaming;

    loop {
      match state {
        StreamState::Streaming => {
          if stop.is_stopped() {
            info!("设备 {} 收到停止信号, 退出任务", self.device);
            return TaskExit::Stopped;
          }
          state = match self.stream(stop, &mut retry) {
            Ok(()) => {
              info!("设备 {} 收到停止信号, 退出任务", self.device);
              return TaskExit::Stopped;
            }
            Err(e) => {
              error!("设备 {} 处理失败: {}", self.device, e);
              if retry.record_failure() {
                StreamState::Terminated
              } else {
                StreamState::Reconnecting
              }
            }
          };
        }
        StreamState::Reconnecting => {
          error!(
            "设备 {} 将在 {:?} 后重连 ({}/{})",
            self.device,
            self.retry.interval,
            retry.attempts(),
            retry.max_attempts()
          );
          if stop.wait(self.retry.interval) {
            info!("设备 {} 重连等待中收到停止信号", self.device);
            return TaskExit::Stopped;
          }
          state = StreamState::Streaming;
        }
        StreamState::Terminated => {
          error!(
            "设备 {} 已达到最大重连次数 {}, 任务结束",
            self.device,
            retry.max_attempts()
          );
          return TaskExit::Exhausted {
            attempts: retry.attempts(),
          };
        }
      }
    }
  }

  /// 打开输入源并持续处理，只在收到停止信号时返回 `Ok`
  fn stream(&self, stop: &StopSignal, retry: &mut RetryState) -> Result<(), StreamError> {
    let mut source = self.opener.open(&self.uri).map_err(StreamError::Open)?;
    let input =
      client::fetch_model_input(self.client.as_ref(), &self.model).map_err(StreamError::Metadata)?;
    *self
      .model_input
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(input.clone());
    info!(
      "设备 {} 输入源已打开, 模型输入 {} {}x{}",
      self.device, input.name, input.width, input.height
    );

    let mut recovered = false;
    while !stop.is_stopped() {
      let frame = source.read_frame().map_err(StreamError::Read)?;
      if frame.is_empty() {
        debug!("设备 {} 读取到空帧, 跳过", self.device);
        continue;
      }
      if !recovered {
        if retry.attempts() > 0 {
          info!("设备 {} 已重新连接", self.device);
        }
        retry.reset();
        recovered = true;
      }

      debug!(
        "设备 {} 处理第 {} 帧 ({}x{})",
        self.device,
        frame.index,
        frame.width(),
        frame.height()
      );
      if let Err(e) = self.process_frame(&frame, &input) {
        warn!("设备 {} 跳过第 {} 帧: {}", self.device, frame.index, e);
      }
    }
    Ok(())
  }

  /// 推理、标注并发布一帧，返回是否产生了结果
  fn process_frame(&self, frame: &Frame, input: &ModelInput) -> Result<bool, FrameError> {
    let started = Instant::now();
    let payload = input.prepare(&frame.image)?;
    let response = client::infer(self.client.as_ref(), &self.model, input, &payload)?;
    let inference = started.elapsed();
    debug!("设备 {} 推理耗时: {:.2?}", self.device, inference);

    let mut records = Vec::new();
    for output in response.outputs.iter() {
      records.extend(decode_detections(&output.raw, &output.shape)?);
    }

    let Some(annotation) = self
      .annotator
      .annotate(&frame.image, &records, started, inference)
    else {
      return Ok(false);
    };

    let original = if self.snapshot {
      Some(encode_jpeg(&frame.image)?)
    } else {
      None
    };
    let snapshot = encode_jpeg(&annotation.image)?;
    self.sink.update_jpeg(&snapshot);

    let result = InferenceResult {
      model_name: self.model.name.clone(),
      scores: annotation.scores(),
      infer_fps: annotation.total_fps,
      snapshot: Some(snapshot),
      original,
    };
    if let Err(dropped) = self.mailbox.try_put(result) {
      debug!(
        "设备 {} 信箱未被读取, 丢弃结果 (分数 {:?})",
        self.device, dropped.scores
      );
    }
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
  };

  use image::RgbImage;

  use super::*;
  use crate::{
    input::FrameSource,
    model::{Endpoint, InferResponse, OutputTensor, TensorSpec},
  };

  /// 每次打开按脚本返回帧，脚本为 `None` 或耗尽时打开失败
  struct ScriptedOpener {
    opens: AtomicU32,
    scripts: Mutex<VecDeque<Option<Vec<Frame>>>>,
  }

  impl ScriptedOpener {
    fn new(scripts: Vec<Option<Vec<Frame>>>) -> Arc<Self> {
      Arc::new(Self {
        opens: AtomicU32::new(0),
        scripts: Mutex::new(scripts.into()),
      })
    }

    fn opens(&self) -> u32 {
      self.opens.load(Ordering::SeqCst)
    }
  }

  struct ScriptedSource(VecDeque<Frame>);

  impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, FrameSourceError> {
      self.0.pop_front().ok_or(FrameSourceError::EndOfStream)
    }
  }

  impl FrameSourceOpener for ScriptedOpener {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, FrameSourceError> {
      self.opens.fetch_add(1, Ordering::SeqCst);
      match self.scripts.lock().unwrap().pop_front().flatten() {
        Some(frames) => Ok(Box::new(ScriptedSource(frames.into()))),
        None => Err(FrameSourceError::Open {
          uri: uri.to_string(),
          reason: "unreachable".to_string(),
        }),
      }
    }
  }

  /// 按队列返回推理结果，队列为空时返回无输出的响应
  #[derive(Default)]
  struct ScriptedService {
    responses: Mutex<VecDeque<Result<InferResponse, InferenceError>>>,
  }

  impl ScriptedService {
    fn new(responses: Vec<Result<InferResponse, InferenceError>>) -> Arc<Self> {
      Arc::new(Self {
        responses: Mutex::new(responses.into()),
      })
    }
  }

  impl InferenceService for ScriptedService {
    fn model_inputs(&self, _: &ModelSpec) -> Result<Vec<TensorSpec>, InferenceError> {
      Ok(vec![TensorSpec {
        name: "image".to_string(),
        datatype: "BYTES".to_string(),
        shape: vec![1, 8, 8, 3],
      }])
    }

    fn infer(&self, _: &ModelSpec, _: &str, _: &[u8]) -> Result<InferResponse, InferenceError> {
      self
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Ok(InferResponse::default()))
    }
  }

  #[derive(Default)]
  struct CountingSink(AtomicU32);

  impl FrameSink for CountingSink {
    fn update_jpeg(&self, _: &[u8]) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn detections(confidences: &[f32]) -> InferResponse {
    let raw = confidences
      .iter()
      .flat_map(|c| [0.0, 1.0, *c, 0.1, 0.1, 0.6, 0.6])
      .flat_map(f32::to_le_bytes)
      .collect();
    InferResponse {
      model_name: "ssd".to_string(),
      outputs: vec![OutputTensor {
        name: "detection_out".to_string(),
        datatype: "FP32".to_string(),
        shape: vec![1, 1, confidences.len() as i64, 7],
        raw,
      }],
    }
  }

  fn frame(index: u64) -> Frame {
    Frame::new(index, RgbImage::new(16, 16))
  }

  fn config(snapshot: bool) -> DeviceConfig {
    DeviceConfig {
      endpoint: Endpoint {
        host: "localhost".to_string(),
        port: 9000,
      },
      model: ModelSpec {
        name: "ssd".to_string(),
        version: "1".to_string(),
      },
      uri: "rtsp://camera/live".to_string(),
      score: 0.6,
      snapshot,
      record: false,
    }
  }

  fn task(
    opener: Arc<ScriptedOpener>,
    service: Arc<ScriptedService>,
    sink: Arc<CountingSink>,
    attempts: u32,
  ) -> CaptureTask {
    CaptureTask::new(
      "cam",
      &config(true),
      opener,
      service,
      sink,
      Arc::new(Draw::with_font(None)),
    )
    .with_retry_policy(RetryPolicy {
      attempts,
      interval: Duration::ZERO,
    })
  }

  fn run(task: CaptureTask) -> TaskExit {
    let (_handle, signal) = stop_channel();
    task.run(&signal)
  }

  #[test]
  fn retry_state_counts_consecutive_failures() {
    let mut state = RetryState::new(3);
    assert!(!state.record_failure());
    assert!(!state.record_failure());
    state.reset();
    assert_eq!(state.attempts(), 0);
    assert!(!state.record_failure());
    assert!(!state.record_failure());
    assert!(state.record_failure());
  }

  #[test]
  fn terminates_after_max_consecutive_failures() {
    let opener = ScriptedOpener::new(Vec::new());
    let sink = Arc::new(CountingSink::default());
    let task = task(opener.clone(), ScriptedService::new(Vec::new()), sink, RECONNECT_ATTEMPTS);
    let mailbox = task.mailbox();

    assert_eq!(
      run(task),
      TaskExit::Exhausted {
        attempts: RECONNECT_ATTEMPTS
      }
    );
    assert_eq!(opener.opens(), RECONNECT_ATTEMPTS);
    assert!(mailbox.is_empty());
  }

  #[test]
  fn successful_read_resets_failure_count() {
    let opener = ScriptedOpener::new(vec![
      None,
      None,
      Some(vec![frame(1)]),
      None,
      None,
      None,
    ]);
    let sink = Arc::new(CountingSink::default());
    let task = task(opener.clone(), ScriptedService::new(Vec::new()), sink, 3);

    assert_eq!(run(task), TaskExit::Exhausted { attempts: 3 });
    // 两次失败 + 一次成功后读到结尾 + 两次失败
    assert_eq!(opener.opens(), 5);
  }

  #[test]
  fn empty_frames_do_not_reset_failures() {
    let opener = ScriptedOpener::new(vec![None, Some(vec![Frame::empty(1)]), None]);
    let sink = Arc::new(CountingSink::default());
    let task = task(opener.clone(), ScriptedService::new(Vec::new()), sink, 3);

    assert_eq!(run(task), TaskExit::Exhausted { attempts: 3 });
    assert_eq!(opener.opens(), 3);
  }

  #[test]
  fn inference_failure_skips_only_that_frame() {
    let opener = ScriptedOpener::new(vec![Some(vec![frame(1), frame(2)])]);
    let service = ScriptedService::new(vec![
      Err(InferenceError::Timeout),
      Ok(detections(&[0.9, 0.3])),
    ]);
    let sink = Arc::new(CountingSink::default());
    let task = task(opener.clone(), service, sink.clone(), 2);
    let mailbox = task.mailbox();

    assert_eq!(run(task), TaskExit::Exhausted { attempts: 2 });
    // 推理失败不触发重连，结尾才触发
    assert_eq!(opener.opens(), 2);
    assert_eq!(sink.0.load(Ordering::SeqCst), 1);

    let result = mailbox.try_take().unwrap();
    assert_eq!(result.model_name, "ssd");
    assert_eq!(result.scores, vec![0.9]);
    assert!(result.snapshot.is_some());
    assert!(result.original.is_some());
  }

  #[test]
  fn empty_frame_is_skipped_and_next_frame_published() {
    let opener = ScriptedOpener::new(vec![Some(vec![Frame::empty(1), frame(2)])]);
    let service = ScriptedService::new(vec![Ok(detections(&[0.8]))]);
    let sink = Arc::new(CountingSink::default());
    let task = task(opener, service, sink, 1);
    let mailbox = task.mailbox();

    run(task);
    assert_eq!(mailbox.try_take().map(|r| r.scores), Some(vec![0.8]));
  }

  #[test]
  fn undrained_mailbox_keeps_first_result() {
    let opener = ScriptedOpener::new(vec![Some(vec![frame(1), frame(2)])]);
    let service = ScriptedService::new(vec![Ok(detections(&[0.9])), Ok(detections(&[0.7]))]);
    let sink = Arc::new(CountingSink::default());
    let task = task(opener, service, sink.clone(), 1);
    let mailbox = task.mailbox();

    run(task);
    assert_eq!(mailbox.try_take().map(|r| r.scores), Some(vec![0.9]));
    assert!(mailbox.try_take().is_none());
    // 实时画面始终更新为最新帧
    assert_eq!(sink.0.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn below_threshold_frame_publishes_nothing() {
    let opener = ScriptedOpener::new(vec![Some(vec![frame(1)])]);
    let service = ScriptedService::new(vec![Ok(detections(&[0.2, 0.5, 0.6]))]);
    let sink = Arc::new(CountingSink::default());
    let task = task(opener, service, sink.clone(), 1);
    let mailbox = task.mailbox();

    run(task);
    assert!(mailbox.is_empty());
    assert_eq!(sink.0.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn model_input_is_cached_on_open() {
    let opener = ScriptedOpener::new(vec![Some(Vec::new())]);
    let task = task(
      opener,
      ScriptedService::new(Vec::new()),
      Arc::new(CountingSink::default()),
      1,
    );
    let cache = task.model_input();

    run(task);
    let input = cache.lock().unwrap().clone().unwrap();
    assert_eq!((input.name.as_str(), input.width, input.height), ("image", 8, 8));
  }

  #[test]
  fn stop_interrupts_reconnect_wait() {
    let opener = ScriptedOpener::new(Vec::new());
    let task = CaptureTask::new(
      "cam",
      &config(false),
      opener.clone(),
      ScriptedService::new(Vec::new()),
      Arc::new(CountingSink::default()),
      Arc::new(Draw::with_font(None)),
    )
    .with_retry_policy(RetryPolicy {
      attempts: RECONNECT_ATTEMPTS,
      interval: Duration::from_secs(60),
    });

    let handle = task.spawn().unwrap();
    thread::sleep(Duration::from_millis(50));
    handle.stop();

    let started = Instant::now();
    assert_eq!(handle.join(), Some(TaskExit::Stopped));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(opener.opens(), 1);
  }

  #[test]
  fn dropped_stop_handle_stops_task() {
    let (handle, signal) = stop_channel();
    drop(handle);
    assert!(signal.is_stopped());
    assert!(signal.wait(Duration::from_secs(60)));
  }
}
