// 该文件是 Shanan （山南西风） 项目的一部分。
// src/mailbox.rs - 单槽结果信箱
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

use std::sync::{Mutex, MutexGuard};

/// 采集线程与轮询方之间的单槽交接。
///
/// 只提供非阻塞的放入与取出：槽位已满时新值被退回，
/// 槽位为空时取出得到 `None`。
#[derive(Debug)]
pub struct Mailbox<T> {
  slot: Mutex<Option<T>>,
}

impl<T> Default for Mailbox<T> {
  fn default() -> Self {
    Self {
      slot: Mutex::new(None),
    }
  }
}

impl<T> Mailbox<T> {
  pub fn new() -> Self {
    Self::default()
  }

  fn slot(&self) -> MutexGuard<'_, Option<T>> {
    self
      .slot
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// 槽位为空时放入，否则原样退回新值
  pub fn try_put(&self, value: T) -> Result<(), T> {
    let mut slot = self.slot();
    if slot.is_some() {
      return Err(value);
    }
    *slot = Some(value);
    Ok(())
  }

  pub fn try_take(&self) -> Option<T> {
    self.slot().take()
  }

  pub fn is_empty(&self) -> bool {
    self.slot().is_none()
  }
}
