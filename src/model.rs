// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 远程推理服务接口
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

use std::{fmt, io::Cursor, sync::Arc, time::Duration};

use image::{ImageFormat, RgbImage, imageops::FilterType};
use thiserror::Error;

pub mod coco;

#[cfg(feature = "kserve_rest")]
mod kserve;
#[cfg(feature = "kserve_rest")]
pub use self::kserve::{KServeClient, KServeConnector};

/// 模型未声明输入尺寸时使用的默认边长
pub const DEFAULT_INPUT_SIZE: u32 = 640;
/// 元数据与推理请求的超时时间
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("无法连接推理服务 {endpoint}: {reason}")]
  Connect { endpoint: String, reason: String },
  #[error("推理请求超时")]
  Timeout,
  #[error("推理请求失败: {0}")]
  Transport(String),
  #[error("推理服务返回错误状态 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("推理服务响应格式错误: {0}")]
  Protocol(String),
  #[error("模型 {0} 没有声明输入张量")]
  NoInput(String),
  #[error("输入图像编码失败: {0}")]
  Encode(#[from] image::ImageError),
}

/// 推理服务地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
  pub host: String,
  pub port: u16,
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// 模型名称与版本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
  pub name: String,
  pub version: String,
}

/// 模型声明的张量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
  pub name: String,
  pub datatype: String,
  pub shape: Vec<i64>,
}

/// 模型输入：张量名称和缩放尺寸
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInput {
  pub name: String,
  pub width: u32,
  pub height: u32,
}

impl ModelInput {
  /// 按 NHWC 约定读取声明的输入尺寸，负值或缺省时回退到 640x640
  pub fn from_declared(spec: &TensorSpec) -> Self {
    let dim = |axis: usize| {
      spec
        .shape
        .get(axis)
        .copied()
        .filter(|v| *v > 0)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_INPUT_SIZE)
    };

    Self {
      name: spec.name.clone(),
      height: dim(1),
      width: dim(2),
    }
  }

  /// 缩放到模型输入尺寸并编码为 JPEG
  pub fn prepare(&self, image: &RgbImage) -> Result<Vec<u8>, InferenceError> {
    let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
    let mut buffer = Cursor::new(Vec::new());
    resized.write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(buffer.into_inner())
  }
}

/// 推理服务返回的单个输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  pub name: String,
  pub datatype: String,
  pub shape: Vec<i64>,
  pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferResponse {
  pub model_name: String,
  pub outputs: Vec<OutputTensor>,
}

/// 已建立连接的推理服务会话
///
/// 每个请求由实现自身限制在 [`RPC_TIMEOUT`] 内；本层不做重试。
pub trait InferenceService: Send + Sync {
  /// 查询模型声明的输入张量
  fn model_inputs(&self, model: &ModelSpec) -> Result<Vec<TensorSpec>, InferenceError>;

  /// 以单个 BYTES 张量提交已编码的图像
  fn infer(
    &self,
    model: &ModelSpec,
    input_name: &str,
    image: &[u8],
  ) -> Result<InferResponse, InferenceError>;
}

/// 建立推理服务连接
pub trait Connector: Send + Sync {
  fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn InferenceService>, InferenceError>;
}
