// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 服务参数配置
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

use std::path::PathBuf;

use clap::Parser;
use shanan_ovms::output::mjpeg::LIVE_PORT;

/// OpenVINO 模型服务设备推理服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 设备配置文件 (JSON)
  /// 格式: { "<设备名>": { "ovms": { "Host": "...", "Port": "9000", ... } } }
  #[arg(long, value_name = "FILE")]
  pub devices: PathBuf,

  /// 实时画面 HTTP 端口
  #[arg(long, default_value_t = LIVE_PORT, value_name = "PORT")]
  pub live_port: u16,

  /// 标注文字使用的 TTF 字体，缺省时尝试系统字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,

  /// 读取推理结果的轮询间隔（毫秒）
  #[arg(long, default_value_t = 1000, value_name = "MILLIS")]
  pub poll_interval_ms: u64,
}
