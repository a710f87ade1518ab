// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 视频输入
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

use thiserror::Error;

use crate::frame::Frame;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerFrameSource, GStreamerInputError, GStreamerOpener};

#[derive(Error, Debug)]
pub enum FrameSourceError {
  #[error("无法打开输入源 {uri}: {reason}")]
  Open { uri: String, reason: String },
  #[error("输入源已结束")]
  EndOfStream,
  #[error("读取帧失败: {0}")]
  Read(String),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamer(#[from] GStreamerInputError),
}

/// 打开后的输入源，关闭即丢弃
///
/// 读取到空帧表示暂时没有数据，调用方应跳过；
/// 返回错误表示输入源已不可用。
pub trait FrameSource: Send {
  fn read_frame(&mut self) -> Result<Frame, FrameSourceError>;
}

/// 按 URI 打开输入源
pub trait FrameSourceOpener: Send + Sync {
  fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, FrameSourceError>;
}
