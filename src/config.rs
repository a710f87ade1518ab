// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 设备协议属性校验
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

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::model::{Endpoint, ModelSpec};

/// 设备协议名称
pub const PROTOCOL: &str = "ovms";

pub const KEY_HOST: &str = "Host";
pub const KEY_PORT: &str = "Port";
pub const KEY_MODEL: &str = "Model";
pub const KEY_VERSION: &str = "Version";
pub const KEY_URI: &str = "Uri";
pub const KEY_SCORE: &str = "Score";
pub const KEY_RECORD: &str = "Record";
pub const KEY_SNAPSHOT: &str = "Snapshot";

/// 单个协议的属性
pub type ProtocolProperties = HashMap<String, String>;
/// 协议名到属性的映射
pub type Protocols = HashMap<String, ProtocolProperties>;
/// 设备名到协议配置的映射
pub type Devices = BTreeMap<String, Protocols>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
  #[error("缺少 '{0}' 配置")]
  Missing(&'static str),
  #[error("'{0}' 为空")]
  Empty(&'static str),
  #[error("'{key}' 必须是数字, 实际为 '{value}'")]
  NotANumber { key: &'static str, value: String },
  #[error("'{key}' 必须是布尔值 (true 或 false), 实际为 '{value}'")]
  NotABool { key: &'static str, value: String },
  #[error("'{key}' 不是有效端口: '{value}'")]
  InvalidPort { key: &'static str, value: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("设备 '{device}' 缺少 '{PROTOCOL}' 协议配置")]
  MissingProtocol { device: String },
  #[error("设备 '{device}' 配置无效: {}", join_errors(.errors))]
  InvalidFields {
    device: String,
    errors: Vec<FieldError>,
  },
}

fn join_errors(errors: &[FieldError]) -> String {
  errors
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}

/// 与 Go `strconv.ParseBool` 相同的取值
fn parse_bool(value: &str) -> Option<bool> {
  match value {
    "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
    "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
    _ => None,
  }
}

/// 逐项读取属性并收集所有错误
struct FieldReader<'a> {
  properties: &'a ProtocolProperties,
  errors: Vec<FieldError>,
}

impl<'a> FieldReader<'a> {
  fn raw(&mut self, key: &'static str) -> Option<&'a str> {
    match self.properties.get(key).map(|v| v.trim()) {
      None => {
        self.errors.push(FieldError::Missing(key));
        None
      }
      Some("") => {
        self.errors.push(FieldError::Empty(key));
        None
      }
      Some(value) => Some(value),
    }
  }

  fn string(&mut self, key: &'static str) -> Option<String> {
    self.raw(key).map(String::from)
  }

  /// 数值字段，保留原始文本
  fn number(&mut self, key: &'static str) -> Option<(&'a str, f64)> {
    let value = self.raw(key)?;
    match value.parse::<f64>() {
      Ok(number) if number.is_finite() => Some((value, number)),
      _ => {
        self.errors.push(FieldError::NotANumber {
          key,
          value: value.to_string(),
        });
        None
      }
    }
  }

  fn port(&mut self, key: &'static str) -> Option<u16> {
    let (value, number) = self.number(key)?;
    if number.fract() == 0.0 && (1.0..=u16::MAX as f64).contains(&number) {
      Some(number as u16)
    } else {
      self.errors.push(FieldError::InvalidPort {
        key,
        value: value.to_string(),
      });
      None
    }
  }

  fn boolean(&mut self, key: &'static str) -> Option<bool> {
    let value = self.raw(key)?;
    let parsed = parse_bool(value);
    if parsed.is_none() {
      self.errors.push(FieldError::NotABool {
        key,
        value: value.to_string(),
      });
    }
    parsed
  }
}

/// 校验后的设备配置
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
  pub endpoint: Endpoint,
  pub model: ModelSpec,
  pub uri: String,
  /// 配置的原始阈值，超出 (0, 1] 时由标注器回退为默认值
  pub score: f32,
  pub snapshot: bool,
  pub record: bool,
}

impl DeviceConfig {
  /// 读取 `ovms` 协议属性，报告所有缺失或格式错误的字段
  pub fn from_protocols(device: &str, protocols: &Protocols) -> Result<Self, ConfigError> {
    let properties = protocols
      .get(PROTOCOL)
      .ok_or_else(|| ConfigError::MissingProtocol {
        device: device.to_string(),
      })?;

    let mut reader = FieldReader {
      properties,
      errors: Vec::new(),
    };
    let host = reader.string(KEY_HOST);
    let port = reader.port(KEY_PORT);
    let model = reader.string(KEY_MODEL);
    let version = reader.number(KEY_VERSION).map(|(raw, _)| raw.to_string());
    let uri = reader.string(KEY_URI);
    let score = reader.number(KEY_SCORE).map(|(_, v)| v as f32);
    let record = reader.boolean(KEY_RECORD);
    let snapshot = reader.boolean(KEY_SNAPSHOT);

    match (host, port, model, version, uri, score, record, snapshot) {
      (
        Some(host),
        Some(port),
        Some(model),
        Some(version),
        Some(uri),
        Some(score),
        Some(record),
        Some(snapshot),
      ) if reader.errors.is_empty() => Ok(Self {
        endpoint: Endpoint { host, port },
        model: ModelSpec {
          name: model,
          version,
        },
        uri,
        score,
        snapshot,
        record,
      }),
      _ => Err(ConfigError::InvalidFields {
        device: device.to_string(),
        errors: reader.errors,
      }),
    }
  }
}
