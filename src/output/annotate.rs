// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/annotate.rs - 检测结果筛选与标注
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
  sync::Arc,
  time::{Duration, Instant},
};

use chrono::Local;
use image::RgbImage;
use tracing::debug;

use crate::{model::coco, output::draw::Draw, tensor::DetectionRecord};

/// 配置的阈值不在 (0, 1] 内时使用的默认阈值
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.6;

const UNKNOWN_CATEGORY: &str = "unknown";

/// 实际使用的置信度阈值
pub fn effective_threshold(score: f32) -> f32 {
  if score > 0.0 && score <= 1.0 {
    score
  } else {
    DEFAULT_SCORE_THRESHOLD
  }
}

/// 保留两位小数
pub fn round_score(score: f32) -> f32 {
  (score * 100.0).round() / 100.0
}

/// 按 `1 / 秒` 计算的瞬时帧率，保留一位小数
pub fn format_fps(elapsed: Duration) -> String {
  let seconds = elapsed.as_secs_f64();
  let fps = if seconds > 0.0 { 1.0 / seconds } else { 0.0 };
  format!("{:.1}", fps)
}

/// 像素坐标边框，`x_max`/`y_max` 不超过图像宽高
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
  pub x_min: u32,
  pub y_min: u32,
  pub x_max: u32,
  pub y_max: u32,
}

impl PixelBox {
  /// 按源帧的实际尺寸换算归一化坐标并裁剪到图像范围内
  pub fn from_normalized(bbox: [f32; 4], width: u32, height: u32) -> Self {
    let to_pixel = |v: f32, size: u32| {
      let scaled = (v * size as f32) as i64;
      scaled.clamp(0, size as i64) as u32
    };
    let (x_a, x_b) = (to_pixel(bbox[0], width), to_pixel(bbox[2], width));
    let (y_a, y_b) = (to_pixel(bbox[1], height), to_pixel(bbox[3], height));

    Self {
      x_min: x_a.min(x_b),
      y_min: y_a.min(y_b),
      x_max: x_a.max(x_b),
      y_max: y_a.max(y_b),
    }
  }
}

/// 超过阈值的检测
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub category: &'static str,
  /// 保留两位小数的置信度
  pub score: f32,
  pub bbox: PixelBox,
}

impl Detection {
  pub fn label(&self) -> String {
    format!("{}:{:.2}", self.category, self.score)
  }
}

/// 标注结果
#[derive(Debug, Clone)]
pub struct Annotation {
  pub image: RgbImage,
  pub detections: Vec<Detection>,
  /// 仅推理耗时对应的帧率
  pub infer_fps: String,
  /// 推理加标注总耗时对应的帧率
  pub total_fps: String,
}

impl Annotation {
  pub fn scores(&self) -> Vec<f32> {
    self.detections.iter().map(|d| d.score).collect()
  }
}

/// 设备级标注器
#[derive(Clone)]
pub struct Annotator {
  threshold: f32,
  draw: Arc<Draw>,
}

impl Annotator {
  pub fn new(score: f32, draw: Arc<Draw>) -> Self {
    Self {
      threshold: effective_threshold(score),
      draw,
    }
  }

  pub fn threshold(&self) -> f32 {
    self.threshold
  }

  /// 筛选超过阈值的记录，保持输入顺序
  pub fn select(&self, records: &[DetectionRecord], width: u32, height: u32) -> Vec<Detection> {
    records
      .iter()
      .filter(|r| r.confidence > self.threshold)
      .map(|r| Detection {
        category: coco::category_name(r.label).unwrap_or(UNKNOWN_CATEGORY),
        score: round_score(r.confidence),
        bbox: PixelBox::from_normalized(r.bbox, width, height),
      })
      .collect()
  }

  /// 在帧的副本上绘制检测框、时间戳与帧率。
  ///
  /// 没有超过阈值的检测时返回 `None`。`started` 为推理请求开始时刻，
  /// `inference` 为推理耗时。
  pub fn annotate(
    &self,
    frame: &RgbImage,
    records: &[DetectionRecord],
    started: Instant,
    inference: Duration,
  ) -> Option<Annotation> {
    let detections = self.select(records, frame.width(), frame.height());
    if detections.is_empty() {
      return None;
    }

    let mut image = frame.clone();
    for detection in detections.iter() {
      let PixelBox {
        x_min,
        y_min,
        x_max,
        y_max,
      } = detection.bbox;
      debug!(
        "检测到 {}: {}x{} @ ({},{})-({},{})",
        detection.label(),
        x_max - x_min,
        y_max - y_min,
        x_min,
        y_min,
        x_max,
        y_max
      );
      self
        .draw
        .draw_box_with_label(&mut image, (x_min, y_min, x_max, y_max), &detection.label());
    }

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    self.draw.draw_overlay(&mut image, 0, &timestamp);

    let infer_fps = format_fps(inference);
    let total_fps = format_fps(started.elapsed());
    self
      .draw
      .draw_overlay(&mut image, 1, &format!("fps: {}", total_fps));
    debug!("推理帧率: {}, 总帧率: {}", infer_fps, total_fps);

    Some(Annotation {
      image,
      detections,
      infer_fps,
      total_fps,
    })
  }
}
