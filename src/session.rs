// 该文件是 Shanan （山南西风） 项目的一部分。
// src/session.rs - 设备会话管理
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

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  client::{ClientError, ClientRegistry, DialPolicy},
  config::{ConfigError, DeviceConfig, Devices, Protocols},
  input::FrameSourceOpener,
  mailbox::Mailbox,
  model::{Connector, ModelInput},
  output::{InferenceResult, draw::Draw, live::StreamRegistry},
  task::{CaptureTask, RetryPolicy, TaskHandle},
};

#[cfg(feature = "mjpeg_live")]
use crate::output::mjpeg::MjpegServer;

#[derive(Error, Debug)]
pub enum SessionError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Client(#[from] ClientError),
  #[error("设备 {0} 的任务仍在运行")]
  AlreadyRunning(String),
  #[error("未知设备 {0}")]
  UnknownDevice(String),
  #[error("无法启动设备 {device} 的采集线程: {source}")]
  Spawn {
    device: String,
    #[source]
    source: std::io::Error,
  },
  #[error("读数序列化失败: {0}")]
  Encode(#[from] serde_json::Error),
}

/// 单个设备持有的资源；输入源由任务线程独占
struct DeviceSession {
  config: DeviceConfig,
  mailbox: Arc<Mailbox<InferenceResult>>,
  model_input: Arc<Mutex<Option<ModelInput>>>,
  task: TaskHandle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn join_task(name: &str, task: TaskHandle) {
  match task.join() {
    Some(exit) => debug!("设备 {} 任务已退出: {:?}", name, exit),
    None => warn!("设备 {} 任务线程异常退出", name),
  }
}

/// 设备会话管理器
///
/// 会话表只在添加、移除和停止时加锁修改；任务线程在创建时取得自己的句柄，
/// 运行期间不再访问会话表。管理器被丢弃时各任务的停止句柄随之释放，任务自行退出。
///
/// 只发出停止信号的任务在 `stopping` 中等待回收：同名设备再次添加前、
/// 或 `stop(false)` 时会等待其线程退出，保证每个设备至多一个输入源句柄。
pub struct SessionManager {
  opener: Arc<dyn FrameSourceOpener>,
  clients: ClientRegistry,
  streams: Arc<StreamRegistry>,
  draw: Arc<Draw>,
  retry: RetryPolicy,
  live_port: Option<u16>,
  sessions: Mutex<HashMap<String, DeviceSession>>,
  stopping: Mutex<Vec<(String, TaskHandle)>>,
  #[cfg(feature = "mjpeg_live")]
  server: Mutex<Option<MjpegServer>>,
}

impl SessionManager {
  pub fn new(opener: Arc<dyn FrameSourceOpener>, connector: Arc<dyn Connector>) -> Self {
    Self {
      opener,
      clients: ClientRegistry::new(connector),
      streams: Arc::new(StreamRegistry::default()),
      draw: Arc::new(Draw::default()),
      retry: RetryPolicy::default(),
      live_port: None,
      sessions: Mutex::new(HashMap::new()),
      stopping: Mutex::new(Vec::new()),
      #[cfg(feature = "mjpeg_live")]
      server: Mutex::new(None),
    }
  }

  /// 实时画面端口，`None` 时不启动 HTTP 服务
  pub fn with_live_port(mut self, port: Option<u16>) -> Self {
    self.live_port = port;
    self
  }

  pub fn with_dial_policy(mut self, policy: DialPolicy) -> Self {
    self.clients = self.clients.with_policy(policy);
    self
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = Arc::new(draw);
    self
  }

  pub fn streams(&self) -> Arc<StreamRegistry> {
    self.streams.clone()
  }

  /// 启动实时画面服务并添加所有设备
  ///
  /// 实时画面服务或单个设备失败都只记录日志，不影响其余设备。
  pub fn initialize(&self, devices: &Devices) {
    if !self.draw.has_font() {
      warn!("未找到可用字体, 标注将不包含文字");
    }
    self.start_live_server();

    for (name, protocols) in devices.iter() {
      if let Err(e) = self.add_device(name, protocols) {
        error!("设备 {} 初始化失败, 跳过该设备: {}", name, e);
      }
    }
    info!(
      "会话管理器初始化完成, 运行中设备 {}/{}",
      self.devices().len(),
      devices.len()
    );
  }

  #[cfg(feature = "mjpeg_live")]
  fn start_live_server(&self) {
    let Some(port) = self.live_port else {
      return;
    };
    let mut server = lock(&self.server);
    if server.is_some() {
      return;
    }
    match MjpegServer::spawn(self.streams.clone(), port) {
      Ok(started) => *server = Some(started),
      Err(e) => error!("实时画面服务启动失败, 继续初始化设备: {}", e),
    }
  }

  #[cfg(not(feature = "mjpeg_live"))]
  fn start_live_server(&self) {
    if self.live_port.is_some() {
      warn!("未启用 mjpeg_live 特性, 忽略实时画面端口");
    }
  }

  /// 正在运行的实时画面服务端口
  #[cfg(feature = "mjpeg_live")]
  pub fn live_port(&self) -> Option<u16> {
    lock(&self.server).as_ref().map(MjpegServer::port)
  }

  #[cfg(not(feature = "mjpeg_live"))]
  pub fn live_port(&self) -> Option<u16> {
    None
  }

  #[cfg(feature = "mjpeg_live")]
  fn stop_live_server(&self) {
    if let Some(server) = lock(&self.server).take() {
      server.stop();
    }
  }

  #[cfg(not(feature = "mjpeg_live"))]
  fn stop_live_server(&self) {}

  pub fn validate_device(
    &self,
    name: &str,
    protocols: &Protocols,
  ) -> Result<DeviceConfig, SessionError> {
    debug!("校验设备 {}", name);
    DeviceConfig::from_protocols(name, protocols).map_err(|e| {
      error!("{}", e);
      e.into()
    })
  }

  /// 校验配置、建立推理会话并启动采集任务
  ///
  /// 之前的任务已结束时允许重新添加。
  pub fn add_device(&self, name: &str, protocols: &Protocols) -> Result<(), SessionError> {
    let config = self.validate_device(name, protocols)?;
    self.reap_finished(name)?;

    // 拨号可能耗时数秒，不持有会话锁
    let client = self.clients.get_or_create(name, &config.endpoint)?;

    let mut sessions = lock(&self.sessions);
    if sessions.contains_key(name) {
      return Err(SessionError::AlreadyRunning(name.to_string()));
    }

    let sink = self.streams.register(name);
    let task = CaptureTask::new(
      name,
      &config,
      self.opener.clone(),
      client,
      sink,
      self.draw.clone(),
    )
    .with_retry_policy(self.retry);
    let mailbox = task.mailbox();
    let model_input = task.model_input();
    let task = task.spawn().map_err(|source| {
      self.streams.remove(name);
      SessionError::Spawn {
        device: name.to_string(),
        source,
      }
    })?;

    sessions.insert(
      name.to_string(),
      DeviceSession {
        config,
        mailbox,
        model_input,
        task,
      },
    );
    info!("设备 {} 已添加", name);
    Ok(())
  }

  /// 清理已结束任务留下的会话，任务仍在运行时报错
  ///
  /// 已发出停止信号但尚未退出的同名任务在此等待退出。
  fn reap_finished(&self, name: &str) -> Result<(), SessionError> {
    let lingering: Vec<_> = {
      let mut stopping = lock(&self.stopping);
      let (matching, rest) = std::mem::take(&mut *stopping)
        .into_iter()
        .partition::<Vec<_>, _>(|(device, _)| device == name);
      *stopping = rest;
      matching
    };
    for (_, task) in lingering {
      debug!("设备 {} 等待停止中的任务退出", name);
      join_task(name, task);
    }

    let finished = {
      let mut sessions = lock(&self.sessions);
      match sessions.get(name).map(|s| s.task.is_finished()) {
        Some(false) => return Err(SessionError::AlreadyRunning(name.to_string())),
        Some(true) => sessions.remove(name),
        None => None,
      }
    };
    if let Some(session) = finished {
      debug!("设备 {} 清理已结束的任务", name);
      self.release(name, session, true);
    }
    Ok(())
  }

  /// 停止任务并释放设备的所有资源
  fn release(&self, name: &str, session: DeviceSession, wait: bool) {
    session.task.stop();
    if wait {
      join_task(name, session.task);
    } else {
      lock(&self.stopping).push((name.to_string(), session.task));
    }
    self.clients.remove(name);
    self.streams.remove(name);
  }

  /// 移除设备，返回设备是否存在
  pub fn remove_device(&self, name: &str) -> bool {
    let session = lock(&self.sessions).remove(name);
    match session {
      Some(session) => {
        self.release(name, session, true);
        info!("设备 {} 已移除", name);
        true
      }
      None => {
        debug!("移除未知设备 {}", name);
        false
      }
    }
  }

  pub fn update_device(&self, name: &str, protocols: &Protocols) -> Result<(), SessionError> {
    info!("设备 {} 配置更新", name);
    self.remove_device(name);
    self.add_device(name, protocols)
  }

  /// 非阻塞地取出最新结果
  pub fn drain(&self, name: &str) -> Result<Option<InferenceResult>, SessionError> {
    let mailbox = lock(&self.sessions)
      .get(name)
      .map(|session| session.mailbox.clone())
      .ok_or_else(|| SessionError::UnknownDevice(name.to_string()))?;
    Ok(mailbox.try_take())
  }

  /// 读命令：有结果时返回 JSON 读数，没有时返回 `None`
  pub fn handle_read_command(&self, name: &str) -> Result<Option<String>, SessionError> {
    let Some(result) = self.drain(name)? else {
      debug!("设备 {} 暂无推理结果", name);
      return Ok(None);
    };
    info!(
      "设备 {} 收到推理结果, 模型: {}, {} fps",
      name, result.model_name, result.infer_fps
    );
    Ok(Some(result.to_json()?))
  }

  pub fn is_running(&self, name: &str) -> bool {
    lock(&self.sessions)
      .get(name)
      .is_some_and(|session| !session.task.is_finished())
  }

  pub fn devices(&self) -> Vec<String> {
    let mut names: Vec<_> = lock(&self.sessions).keys().cloned().collect();
    names.sort();
    names
  }

  pub fn config(&self, name: &str) -> Option<DeviceConfig> {
    lock(&self.sessions)
      .get(name)
      .map(|session| session.config.clone())
  }

  /// 最近一次打开输入源时获取的模型输入
  pub fn model_input(&self, name: &str) -> Option<ModelInput> {
    let cache = lock(&self.sessions).get(name)?.model_input.clone();
    lock(&cache).clone()
  }

  /// 停止所有设备任务与实时画面服务。
  ///
  /// `force` 为 `true` 时只发出停止信号，不等待任务线程退出；
  /// 这些任务在同名设备再次添加或下一次 `stop(false)` 时回收。
  pub fn stop(&self, force: bool) {
    let sessions: Vec<_> = lock(&self.sessions).drain().collect();
    for (_, session) in sessions.iter() {
      session.task.stop();
    }
    for (name, session) in sessions {
      self.release(&name, session, !force);
    }
    if !force {
      let lingering = std::mem::take(&mut *lock(&self.stopping));
      for (name, task) in lingering {
        join_task(&name, task);
      }
    }
    self.clients.clear();
    self.streams.clear();
    self.stop_live_server();
    debug!("会话管理器已停止: force={}", force);
  }
}
