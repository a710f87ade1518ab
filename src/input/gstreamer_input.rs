// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 通过 `uridecodebin` 打开任意 GStreamer 支持的 URI：
//! - `rtsp://192.168.1.100:8554/stream` 网络摄像头
//! - `http://camera.local/video.mjpeg` MJPEG 流
//! - `file:///data/video.mp4` 或直接写本地路径 `/data/video.mp4`
//!
//! 解码后统一转换为 RGB，经 `appsink` 拉取，保持源分辨率。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::{path::Path, time::Duration};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::Frame,
  input::{FrameSource, FrameSourceError, FrameSourceOpener},
};

/// 单次拉取等待时间，超时视为空帧
const PULL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  #[error("Unsupported video format: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

/// 基于 `uridecodebin ! appsink` 的输入源
pub struct GStreamerFrameSource {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  next_index: u64,
}

impl Drop for GStreamerFrameSource {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl FromUrl for GStreamerFrameSource {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    gst::init()?;

    let description = format!(
      "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=RGB ! \
       appsink name=sink max-buffers=2 drop=true sync=false",
      url
    );
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(Self {
      pipeline,
      appsink,
      next_index: 0,
    })
  }
}

impl GStreamerFrameSource {
  /// 取出总线上的错误或结束消息
  fn pending_failure(&self) -> Option<FrameSourceError> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;
    match message.view() {
      gst::MessageView::Eos(..) => Some(FrameSourceError::EndOfStream),
      gst::MessageView::Error(err) => Some(FrameSourceError::Read(format!(
        "{} ({})",
        err.error(),
        err.debug().map(|d| d.to_string()).unwrap_or_default()
      ))),
      _ => None,
    }
  }
}

impl FrameSource for GStreamerFrameSource {
  fn read_frame(&mut self) -> Result<Frame, FrameSourceError> {
    let index = self.next_index;
    self.next_index = self.next_index.wrapping_add(1);

    let timeout = gst::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
    match self.appsink.try_pull_sample(timeout) {
      Some(sample) => Ok(Frame::new(index, convert_sample(&sample)?)),
      None if self.appsink.is_eos() => Err(FrameSourceError::EndOfStream),
      None => match self.pending_failure() {
        Some(failure) => Err(failure),
        None => {
          debug!("等待 {:?} 未取到帧", PULL_TIMEOUT);
          Ok(Frame::empty(index))
        }
      },
    }
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0].max(0) as usize;
  let row = width * 3;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  // 最后一行可能不含对齐填充
  let expected = if height == 0 {
    0
  } else {
    stride * (height - 1) + row
  };
  if stride < row || data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row * height);
  for y in 0..height {
    let line = &data[y * stride..y * stride + row];
    match video_info.format() {
      gst_video::VideoFormat::Rgb => pixels.extend_from_slice(line),
      gst_video::VideoFormat::Bgr => {
        for bgr in line.chunks_exact(3) {
          pixels.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
        }
      }
      other => return Err(GStreamerInputError::UnsupportedFormat(other)),
    }
  }

  RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| GStreamerInputError::PipelineError("Frame buffer too small".to_string()))
}

/// 将配置中的 URI 或本地路径转换为 GStreamer URI
fn source_url(uri: &str) -> Result<Url, FrameSourceError> {
  if let Ok(url) = Url::parse(uri)
    && url.scheme().len() > 1
  {
    return Ok(url);
  }

  let open_error = |reason: String| FrameSourceError::Open {
    uri: uri.to_string(),
    reason,
  };
  let path = Path::new(uri)
    .canonicalize()
    .map_err(|e| open_error(e.to_string()))?;
  Url::from_file_path(&path).map_err(|_| open_error("无法转换为 file URI".to_string()))
}

/// 为每次（重新）连接创建新的 GStreamer 管道
#[derive(Debug, Default, Clone, Copy)]
pub struct GStreamerOpener;

impl FrameSourceOpener for GStreamerOpener {
  fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    let url = source_url(uri)?;
    let source = GStreamerFrameSource::from_url(&url)?;
    Ok(Box::new(source))
  }
}
