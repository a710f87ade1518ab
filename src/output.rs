// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 推理结果输出
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

use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use serde::Serialize;

pub mod annotate;
pub mod draw;
pub mod live;

#[cfg(feature = "mjpeg_live")]
pub mod mjpeg;

const JPEG_QUALITY: u8 = 90;
const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// 接收最新一帧的实时画面输出，新帧覆盖旧帧
pub trait FrameSink: Send + Sync {
  fn update_jpeg(&self, jpeg: &[u8]);
}

/// 单帧推理结果，等待轮询读取或被新结果丢弃
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
  pub model_name: String,
  pub infer_fps: String,
  /// 标注后的 JPEG
  pub snapshot: Option<Vec<u8>>,
  pub scores: Vec<f32>,
  /// 未标注的原始帧 JPEG，仅在开启快照时存在
  pub original: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct Reading<'a> {
  model_name: &'a str,
  infer_fps: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  snapshot: Option<String>,
  scores: &'a [f32],
  #[serde(skip_serializing_if = "Option::is_none")]
  original: Option<String>,
}

impl InferenceResult {
  /// 读命令返回的 JSON，图像以 data URI 表示
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Reading {
      model_name: &self.model_name,
      infer_fps: &self.infer_fps,
      snapshot: self.snapshot.as_deref().map(jpeg_data_uri),
      scores: &self.scores,
      original: self.original.as_deref().map(jpeg_data_uri),
    })
  }
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
  let mut buffer = Cursor::new(Vec::new());
  let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
  image.write_with_encoder(encoder)?;
  Ok(buffer.into_inner())
}

pub fn jpeg_data_uri(jpeg: &[u8]) -> String {
  let mut uri = String::from(JPEG_DATA_URI_PREFIX);
  STANDARD.encode_string(jpeg, &mut uri);
  uri
}
