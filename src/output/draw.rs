// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 检测结果绘制
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::debug;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: u32 = 24;
const OVERLAY_FONT_SIZE: f32 = 18.0;
const BOX_THICKNESS: u32 = 2;
const LABEL_COLOR: [u8; 3] = [255, 0, 255]; // 品红

/// 未指定字体文件时依次尝试的系统字体
const FALLBACK_FONTS: [&str; 4] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("读取字体文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 框、标签和叠加文字的绘制工具
///
/// 没有可用字体时只绘制边框，文字跳过。
#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  label_scale: PxScale,
  overlay_scale: PxScale,
  color: Rgb<u8>,
}

impl Default for Draw {
  fn default() -> Self {
    let font = FALLBACK_FONTS
      .iter()
      .find_map(|path| load_font(Path::new(path)).ok());
    Self::with_font(font)
  }
}

fn load_font(path: &Path) -> Result<FontArc, DrawError> {
  let data = std::fs::read(path)?;
  let font = FontArc::try_from_vec(data)?;
  debug!("加载字体: {}", path.display());
  Ok(font)
}

impl Draw {
  pub fn with_font(font: Option<FontArc>) -> Self {
    Self {
      font,
      label_scale: PxScale::from(LABEL_FONT_SIZE),
      overlay_scale: PxScale::from(OVERLAY_FONT_SIZE),
      color: Rgb(LABEL_COLOR),
    }
  }

  pub fn from_font_file(path: &Path) -> Result<Self, DrawError> {
    Ok(Self::with_font(Some(load_font(path)?)))
  }

  pub fn color(&self) -> Rgb<u8> {
    self.color
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 绘制像素坐标边框 [x_min, y_min, x_max)，并在左上角标注文字
  pub fn draw_box_with_label(
    &self,
    image: &mut RgbImage,
    (x_min, y_min, x_max, y_max): (u32, u32, u32, u32),
    label: &str,
  ) {
    let width = x_max.saturating_sub(x_min);
    let height = y_max.saturating_sub(y_min);
    if width == 0 || height == 0 {
      return;
    }

    // 边框加粗，逐层内缩
    for t in 0..BOX_THICKNESS {
      if width <= 2 * t || height <= 2 * t {
        break;
      }
      let rect = Rect::at((x_min + t) as i32, (y_min + t) as i32)
        .of_size(width - 2 * t, height - 2 * t);
      draw_hollow_rect_mut(image, rect, self.color);
    }

    // 标签放在边框上方，空间不足时放在框内
    let label_y = y_min.saturating_sub(LABEL_TEXT_HEIGHT);
    self.draw_text(image, x_min, label_y, self.label_scale, label);
  }

  /// 左上角的时间戳与帧率等叠加文字
  pub fn draw_overlay(&self, image: &mut RgbImage, line: u32, text: &str) {
    let y = 10 + line * (OVERLAY_FONT_SIZE as u32 + 4);
    self.draw_text(image, 10, y, self.overlay_scale, text);
  }

  fn draw_text(&self, image: &mut RgbImage, x: u32, y: u32, scale: PxScale, text: &str) {
    if let Some(font) = &self.font {
      draw_text_mut(image, self.color, x as i32, y as i32, scale, font, text);
    }
  }
}
