// 该文件是 Shanan （山南西风） 项目的一部分。
// src/client.rs - 推理客户端注册表
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
  sync::{Arc, Mutex, MutexGuard, TryLockError},
  thread,
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{
  Connector, Endpoint, InferResponse, InferenceError, InferenceService, ModelInput, ModelSpec,
};

/// 建立连接的最大尝试次数
pub const DIAL_ATTEMPTS: u32 = 3;
/// 两次尝试之间的固定间隔
pub const DIAL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ClientError {
  #[error("设备 {device} 连接推理服务 {endpoint} 失败, 已尝试 {attempts} 次: {source}")]
  DialExhausted {
    device: String,
    endpoint: Endpoint,
    attempts: u32,
    #[source]
    source: InferenceError,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
  pub attempts: u32,
  pub interval: Duration,
}

impl Default for DialPolicy {
  fn default() -> Self {
    Self {
      attempts: DIAL_ATTEMPTS,
      interval: DIAL_INTERVAL,
    }
  }
}

type Slot = Arc<Mutex<Option<Arc<dyn InferenceService>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 按设备缓存推理会话
///
/// 同一设备的查找与创建互斥；不同设备各自持有独立的槽位锁，
/// 拨号期间不会互相阻塞。
pub struct ClientRegistry {
  connector: Arc<dyn Connector>,
  policy: DialPolicy,
  slots: Mutex<HashMap<String, Slot>>,
}

impl ClientRegistry {
  pub fn new(connector: Arc<dyn Connector>) -> Self {
    Self {
      connector,
      policy: DialPolicy::default(),
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_policy(mut self, policy: DialPolicy) -> Self {
    self.policy = policy;
    self
  }

  fn slot(&self, device: &str) -> Slot {
    lock(&self.slots)
      .entry(device.to_string())
      .or_default()
      .clone()
  }

  /// 返回缓存的会话，不存在时按拨号策略建立连接。
  ///
  /// 拨号耗尽时不会缓存任何半初始化的会话。
  pub fn get_or_create(
    &self,
    device: &str,
    endpoint: &Endpoint,
  ) -> Result<Arc<dyn InferenceService>, ClientError> {
    let slot = self.slot(device);
    let mut cached = lock(&slot);
    if let Some(client) = cached.as_ref() {
      debug!("设备 {} 复用已有推理会话", device);
      return Ok(client.clone());
    }

    warn!("设备 {} 没有推理会话, 正在连接 {}", device, endpoint);
    let attempts = self.policy.attempts.max(1);
    let mut attempt = 0;
    let client = loop {
      attempt += 1;
      match self.connector.connect(endpoint) {
        Ok(client) => break client,
        Err(e) if attempt < attempts => {
          error!("无法连接 {} ({}/{}): {}", endpoint, attempt, attempts, e);
          thread::sleep(self.policy.interval);
        }
        Err(e) => {
          error!("连接 {} 失败, 已尝试 {} 次: {}", endpoint, attempts, e);
          drop(cached);
          self.forget_empty_slot(device, &slot);
          return Err(ClientError::DialExhausted {
            device: device.to_string(),
            endpoint: endpoint.clone(),
            attempts,
            source: e,
          });
        }
      }
    };

    info!("设备 {} 已连接推理服务 {}", device, endpoint);
    *cached = Some(client.clone());
    Ok(client)
  }

  /// 拨号失败后移除空槽位
  ///
  /// 持有映射锁时只尝试加锁槽位：若其他线程仍持有该槽位或正在拨号，保留条目。
  fn forget_empty_slot(&self, device: &str, slot: &Slot) {
    let mut slots = lock(&self.slots);
    let unused = slots.get(device).is_some_and(|current| {
      Arc::ptr_eq(current, slot)
        && Arc::strong_count(current) == 2
        && match current.try_lock() {
          Ok(cached) => cached.is_none(),
          Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_none(),
          Err(TryLockError::WouldBlock) => false,
        }
    });
    if unused {
      slots.remove(device);
    }
  }

  pub fn get(&self, device: &str) -> Option<Arc<dyn InferenceService>> {
    let slot = lock(&self.slots).get(device).cloned()?;
    lock(&slot).clone()
  }

  /// 移除设备的会话，返回是否存在
  pub fn remove(&self, device: &str) -> bool {
    let removed = lock(&self.slots).remove(device);
    removed.is_some_and(|slot| lock(&slot).take().is_some())
  }

  pub fn clear(&self) {
    lock(&self.slots).clear();
  }
}

/// 查询模型输入张量名称与尺寸，每次（重新）打开输入源时调用一次
pub fn fetch_model_input(
  client: &dyn InferenceService,
  model: &ModelSpec,
) -> Result<ModelInput, InferenceError> {
  let inputs = client.model_inputs(model)?;
  let first = inputs
    .first()
    .ok_or_else(|| InferenceError::NoInput(model.name.clone()))?;
  let input = ModelInput::from_declared(first);
  debug!(
    "模型 {} 输入: {} {}x{} (声明形状 {:?})",
    model.name, input.name, input.width, input.height, first.shape
  );
  Ok(input)
}

/// 单次推理请求，失败不重试
pub fn infer(
  client: &dyn InferenceService,
  model: &ModelSpec,
  input: &ModelInput,
  image: &[u8],
) -> Result<InferResponse, InferenceError> {
  let response = client.infer(model, &input.name, image)?;
  for output in response.outputs.iter() {
    debug!(
      "推理输出: {}, 类型: {}, 形状: {:?}, 数据长度: {}",
      output.name,
      output.datatype,
      output.shape,
      output.raw.len()
    );
  }
  Ok(response)
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};

  use super::*;
  use crate::model::TensorSpec;

  struct NullService;

  impl InferenceService for NullService {
    fn model_inputs(&self, _: &ModelSpec) -> Result<Vec<TensorSpec>, InferenceError> {
      Ok(Vec::new())
    }

    fn infer(&self, _: &ModelSpec, _: &str, _: &[u8]) -> Result<InferResponse, InferenceError> {
      Ok(InferResponse::default())
    }
  }

  /// 前 `failures` 次连接失败
  struct FlakyConnector {
    failures: u32,
    calls: AtomicU32,
  }

  impl FlakyConnector {
    fn new(failures: u32) -> Arc<Self> {
      Arc::new(Self {
        failures,
        calls: AtomicU32::new(0),
      })
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Connector for FlakyConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn InferenceService>, InferenceError> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if call < self.failures {
        Err(InferenceError::Connect {
          endpoint: endpoint.to_string(),
          reason: "refused".to_string(),
        })
      } else {
        Ok(Arc::new(NullService))
      }
    }
  }

  fn endpoint() -> Endpoint {
    Endpoint {
      host: "localhost".to_string(),
      port: 9001,
    }
  }

  fn registry(connector: Arc<FlakyConnector>) -> ClientRegistry {
    ClientRegistry::new(connector).with_policy(DialPolicy {
      attempts: DIAL_ATTEMPTS,
      interval: Duration::ZERO,
    })
  }

  #[test]
  fn reuses_cached_client() {
    let connector = FlakyConnector::new(0);
    let registry = registry(connector.clone());

    let a = registry.get_or_create("cam", &endpoint()).unwrap();
    let b = registry.get_or_create("cam", &endpoint()).unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(connector.calls(), 1);
  }

  #[test]
  fn retries_until_connected() {
    let connector = FlakyConnector::new(2);
    let registry = registry(connector.clone());

    assert!(registry.get_or_create("cam", &endpoint()).is_ok());
    assert_eq!(connector.calls(), 3);
  }

  #[test]
  fn exhaustion_leaves_nothing_cached() {
    let connector = FlakyConnector::new(3);
    let registry = registry(connector.clone());

    let err = registry.get_or_create("cam", &endpoint()).err().unwrap();
    assert!(matches!(err, ClientError::DialExhausted { attempts: 3, .. }));
    assert_eq!(connector.calls(), 3);
    assert!(registry.get("cam").is_none());

    // 之后的调用重新拨号
    assert!(registry.get_or_create("cam", &endpoint()).is_ok());
    assert_eq!(connector.calls(), 4);
  }

  #[test]
  fn removed_client_is_dialed_again() {
    let connector = FlakyConnector::new(0);
    let registry = registry(connector.clone());

    registry.get_or_create("cam", &endpoint()).unwrap();
    assert!(registry.remove("cam"));
    assert!(!registry.remove("cam"));
    registry.get_or_create("cam", &endpoint()).unwrap();
    assert_eq!(connector.calls(), 2);
  }

  /// 主机为 "down" 时总是失败
  struct SplitConnector;

  impl Connector for SplitConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn InferenceService>, InferenceError> {
      if endpoint.host == "down" {
        Err(InferenceError::Connect {
          endpoint: endpoint.to_string(),
          reason: "refused".to_string(),
        })
      } else {
        Ok(Arc::new(NullService))
      }
    }
  }

  #[test]
  fn failed_dial_does_not_block_other_devices() {
    let registry = Arc::new(ClientRegistry::new(Arc::new(SplitConnector)).with_policy(
      DialPolicy {
        attempts: 2,
        interval: Duration::from_millis(500),
      },
    ));
    let down = Endpoint {
      host: "down".to_string(),
      port: 9001,
    };

    // 两个线程争用同一设备：第一个约 500ms 后失败，第二个随即接手拨号至约 1s
    let dialers: Vec<_> = (0..2)
      .map(|i| {
        let registry = registry.clone();
        let down = down.clone();
        thread::sleep(Duration::from_millis(50 * i));
        thread::spawn(move || registry.get_or_create("cam", &down).is_err())
      })
      .collect();

    thread::sleep(Duration::from_millis(700));
    let started = std::time::Instant::now();
    assert!(registry.get_or_create("other", &endpoint()).is_ok());
    assert!(started.elapsed() < Duration::from_millis(200));

    for dialer in dialers {
      assert!(dialer.join().unwrap());
    }
    assert!(registry.get("cam").is_none());
    assert!(registry.get("other").is_some());
  }

  #[test]
  fn model_without_inputs_is_an_error() {
    let spec = ModelSpec {
      name: "ssd".to_string(),
      version: "1".to_string(),
    };
    assert!(matches!(
      fetch_model_input(&NullService, &spec),
      Err(InferenceError::NoInput(_))
    ));
  }
}
