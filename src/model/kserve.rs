// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/kserve.rs - KServe v2 REST 推理客户端
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

//! # KServe v2 REST 客户端
//!
//! OpenVINO Model Server 同时提供 gRPC 与 REST 两种 KServe v2 接口，
//! 这里使用 REST 接口和二进制数据扩展：
//!
//! - `GET  /v2/health/live` 用于建立连接时探活
//! - `GET  /v2/models/{model}/versions/{version}` 查询模型元数据
//! - `POST /v2/models/{model}/versions/{version}/infer` 提交推理请求
//!
//! 推理请求体由 JSON 头和二进制数据拼接而成，JSON 头长度放在
//! `Inference-Header-Content-Length` 头中。BYTES 类型的每个元素
//! 以 4 字节小端长度为前缀。

use std::{sync::Arc, time::Duration};

use reqwest::{
  StatusCode,
  blocking::{Client, Response},
  header::CONTENT_TYPE,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  model::{
    Connector, Endpoint, InferResponse, InferenceError, InferenceService, ModelSpec,
    OutputTensor, RPC_TIMEOUT, TensorSpec,
  },
};

const HEADER_LENGTH: &str = "Inference-Header-Content-Length";
const BYTES_DATATYPE: &str = "BYTES";

/// 按 `host:port` 建立 KServe REST 会话
pub struct KServeConnector {
  timeout: Duration,
}

impl Default for KServeConnector {
  fn default() -> Self {
    Self {
      timeout: RPC_TIMEOUT,
    }
  }
}

impl KServeConnector {
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl Connector for KServeConnector {
  fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn InferenceService>, InferenceError> {
    let connect_error = |reason: String| InferenceError::Connect {
      endpoint: endpoint.to_string(),
      reason,
    };

    let base =
      Url::parse(&format!("http://{}/", endpoint)).map_err(|e| connect_error(e.to_string()))?;
    let client = KServeClient::from_url(&base)?.with_timeout(self.timeout)?;

    let live = client.url("v2/health/live")?;
    let response = client
      .http
      .get(live)
      .send()
      .map_err(|e| connect_error(e.to_string()))?;
    if !response.status().is_success() {
      return Err(connect_error(format!("探活返回状态 {}", response.status())));
    }

    info!("已连接推理服务: {}", base);
    Ok(Arc::new(client))
  }
}

/// KServe v2 REST 会话
pub struct KServeClient {
  base: Url,
  http: Client,
}

impl FromUrl for KServeClient {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != "http" && url.scheme() != "https" {
      return Err(InferenceError::Connect {
        endpoint: url.to_string(),
        reason: format!("不支持的协议 '{}'", url.scheme()),
      });
    }

    Ok(Self {
      base: url.clone(),
      http: build_client(RPC_TIMEOUT)?,
    })
  }
}

fn build_client(timeout: Duration) -> Result<Client, InferenceError> {
  Client::builder()
    .timeout(timeout)
    .build()
    .map_err(|e| InferenceError::Transport(e.to_string()))
}

impl KServeClient {
  pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, InferenceError> {
    self.http = build_client(timeout)?;
    Ok(self)
  }

  fn url(&self, path: &str) -> Result<Url, InferenceError> {
    self
      .base
      .join(path)
      .map_err(|e| InferenceError::Protocol(format!("无效的请求路径 {}: {}", path, e)))
  }

  fn model_url(&self, model: &ModelSpec, suffix: &str) -> Result<Url, InferenceError> {
    let mut path = format!("v2/models/{}", urlencoding::encode(&model.name));
    if !model.version.is_empty() {
      path.push_str(&format!("/versions/{}", urlencoding::encode(&model.version)));
    }
    path.push_str(suffix);
    self.url(&path)
  }
}

fn transport_error(err: reqwest::Error) -> InferenceError {
  if err.is_timeout() {
    InferenceError::Timeout
  } else {
    InferenceError::Transport(err.to_string())
  }
}

fn check_status(response: Response) -> Result<Response, InferenceError> {
  let status = response.status();
  if status == StatusCode::OK {
    return Ok(response);
  }
  let body = response.text().unwrap_or_default();
  Err(InferenceError::Status {
    status: status.as_u16(),
    body,
  })
}

#[derive(Deserialize, Debug)]
struct MetadataResponse {
  #[serde(default)]
  inputs: Vec<TensorMetadata>,
}

#[derive(Deserialize, Debug)]
struct TensorMetadata {
  name: String,
  datatype: String,
  #[serde(default)]
  shape: Vec<i64>,
}

#[derive(Serialize)]
struct InferRequestHeader<'a> {
  inputs: [InferInputHeader<'a>; 1],
  parameters: Value,
}

#[derive(Serialize)]
struct InferInputHeader<'a> {
  name: &'a str,
  shape: [i64; 1],
  datatype: &'static str,
  parameters: Value,
}

#[derive(Deserialize, Debug)]
struct InferResponseHeader {
  #[serde(default)]
  model_name: String,
  #[serde(default)]
  outputs: Vec<InferOutputHeader>,
}

#[derive(Deserialize, Debug)]
struct InferOutputHeader {
  name: String,
  datatype: String,
  #[serde(default)]
  shape: Vec<i64>,
  #[serde(default)]
  parameters: Option<Value>,
  #[serde(default)]
  data: Option<Vec<Value>>,
}

impl InferOutputHeader {
  fn binary_size(&self) -> Option<usize> {
    self
      .parameters
      .as_ref()?
      .get("binary_data_size")?
      .as_u64()
      .and_then(|v| usize::try_from(v).ok())
  }
}

/// 构造带二进制扩展的推理请求体，返回 (请求体, JSON 头长度)
fn encode_infer_request(
  input_name: &str,
  image: &[u8],
) -> Result<(Vec<u8>, usize), InferenceError> {
  let element_len = u32::try_from(image.len())
    .map_err(|_| InferenceError::Protocol(format!("输入数据过大: {} 字节", image.len())))?;
  let header = InferRequestHeader {
    inputs: [InferInputHeader {
      name: input_name,
      shape: [1],
      datatype: BYTES_DATATYPE,
      parameters: json!({ "binary_data_size": image.len() + 4 }),
    }],
    parameters: json!({ "binary_data_output": true }),
  };
  let header =
    serde_json::to_vec(&header).map_err(|e| InferenceError::Protocol(e.to_string()))?;

  let mut body = Vec::with_capacity(header.len() + 4 + image.len());
  body.extend_from_slice(&header);
  body.extend_from_slice(&element_len.to_le_bytes());
  body.extend_from_slice(image);
  Ok((body, header.len()))
}

/// 解析推理响应；二进制输出按 `binary_data_size` 切分，
/// JSON `data` 数组转换为小端 float32 字节以统一后续解码。
fn decode_infer_response(
  body: &[u8],
  header_length: Option<usize>,
) -> Result<InferResponse, InferenceError> {
  let header_length = header_length.unwrap_or(body.len());
  if header_length > body.len() {
    return Err(InferenceError::Protocol(format!(
      "JSON 头长度 {} 超过响应长度 {}",
      header_length,
      body.len()
    )));
  }
  let (header, mut binary) = body.split_at(header_length);
  let header: InferResponseHeader =
    serde_json::from_slice(header).map_err(|e| InferenceError::Protocol(e.to_string()))?;

  let mut outputs = Vec::with_capacity(header.outputs.len());
  for output in header.outputs {
    let raw = if let Some(size) = output.binary_size() {
      if size > binary.len() {
        return Err(InferenceError::Protocol(format!(
          "输出 {} 声明 {} 字节, 剩余 {} 字节",
          output.name,
          size,
          binary.len()
        )));
      }
      let (raw, rest) = binary.split_at(size);
      binary = rest;
      raw.to_vec()
    } else if let Some(data) = &output.data {
      data
        .iter()
        .map(|v| {
          v.as_f64()
            .map(|f| (f as f32).to_le_bytes())
            .ok_or_else(|| {
              InferenceError::Protocol(format!("输出 {} 含有非数值数据", output.name))
            })
        })
        .collect::<Result<Vec<_>, _>>()?
        .concat()
    } else {
      Vec::new()
    };

    outputs.push(OutputTensor {
      name: output.name,
      datatype: output.datatype,
      shape: output.shape,
      raw,
    });
  }

  Ok(InferResponse {
    model_name: header.model_name,
    outputs,
  })
}

impl InferenceService for KServeClient {
  fn model_inputs(&self, model: &ModelSpec) -> Result<Vec<TensorSpec>, InferenceError> {
    let url = self.model_url(model, "")?;
    debug!("查询模型元数据: {}", url);

    let response = self.http.get(url).send().map_err(transport_error)?;
    let metadata: MetadataResponse = check_status(response)?
      .json()
      .map_err(|e| InferenceError::Protocol(e.to_string()))?;

    Ok(
      metadata
        .inputs
        .into_iter()
        .map(|t| TensorSpec {
          name: t.name,
          datatype: t.datatype,
          shape: t.shape,
        })
        .collect(),
    )
  }

  fn infer(
    &self,
    model: &ModelSpec,
    input_name: &str,
    image: &[u8],
  ) -> Result<InferResponse, InferenceError> {
    let url = self.model_url(model, "/infer")?;
    let (body, header_length) = encode_infer_request(input_name, image)?;

    let response = self
      .http
      .post(url)
      .header(CONTENT_TYPE, "application/octet-stream")
      .header(HEADER_LENGTH, header_length)
      .body(body)
      .send()
      .map_err(transport_error)?;
    let response = check_status(response)?;

    let header_length = response
      .headers()
      .get(HEADER_LENGTH)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse::<usize>().ok());
    let body = response.bytes().map_err(transport_error)?;

    decode_infer_response(&body, header_length)
  }
}
