// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/live.rs - 实时画面
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
  sync::{Arc, Mutex, RwLock},
};

use crate::output::FrameSink;

/// 带序号的 JPEG 帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFrame {
  pub sequence: u64,
  pub jpeg: Arc<[u8]>,
}

/// 单个设备的实时画面，只保留最新一帧
#[derive(Debug, Default)]
pub struct LiveStream {
  latest: Mutex<Option<LiveFrame>>,
}

impl LiveStream {
  pub fn latest(&self) -> Option<LiveFrame> {
    self
      .latest
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }
}

impl FrameSink for LiveStream {
  fn update_jpeg(&self, jpeg: &[u8]) {
    let mut latest = self
      .latest
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let sequence = latest.as_ref().map_or(1, |f| f.sequence.wrapping_add(1));
    *latest = Some(LiveFrame {
      sequence,
      jpeg: Arc::from(jpeg),
    });
  }
}

/// 设备名到实时画面的映射，供 HTTP 服务查找
#[derive(Debug, Default)]
pub struct StreamRegistry {
  streams: RwLock<HashMap<String, Arc<LiveStream>>>,
}

impl StreamRegistry {
  /// 注册设备的画面，已存在时复用
  pub fn register(&self, device: &str) -> Arc<LiveStream> {
    self
      .streams
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .entry(device.to_string())
      .or_default()
      .clone()
  }

  pub fn get(&self, device: &str) -> Option<Arc<LiveStream>> {
    self
      .streams
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .get(device)
      .cloned()
  }

  pub fn remove(&self, device: &str) -> Option<Arc<LiveStream>> {
    self
      .streams
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .remove(device)
  }

  pub fn clear(&self) {
    self
      .streams
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clear();
  }
}
