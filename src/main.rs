// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 设备推理服务主程序
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

mod args;

use std::{
  sync::{
    Arc,
    mpsc::{self, RecvTimeoutError},
  },
  time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use shanan_ovms::{
  config::Devices, input::GStreamerOpener, model::KServeConnector, output::draw::Draw,
  session::SessionManager,
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("设备配置文件: {}", args.devices.display());
  info!("实时画面端口: {}", args.live_port);

  let content = std::fs::read_to_string(&args.devices)
    .with_context(|| format!("无法读取设备配置文件 {}", args.devices.display()))?;
  let devices: Devices = serde_json::from_str(&content).context("设备配置文件格式错误")?;

  let draw = match args.font.as_deref() {
    Some(path) => Draw::from_font_file(path)?,
    None => Draw::default(),
  };

  let manager = SessionManager::new(
    Arc::new(GStreamerOpener),
    Arc::new(KServeConnector::default()),
  )
  .with_live_port(Some(args.live_port))
  .with_draw(draw);
  manager.initialize(&devices);
  if manager.live_port().is_none() {
    warn!("实时画面服务未运行, 仅输出推理读数");
  }

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let interval = Duration::from_millis(args.poll_interval_ms.max(1));
  while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
    for device in manager.devices() {
      match manager.handle_read_command(&device) {
        Ok(Some(reading)) => println!("{}: {}", device, reading),
        Ok(None) => {}
        Err(e) => warn!("设备 {} 读取失败: {}", device, e),
      }
    }
  }

  warn!("中断信号接收，停止所有设备");
  manager.stop(false);
  info!("服务已退出");
  Ok(())
}
