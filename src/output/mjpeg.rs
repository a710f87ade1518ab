// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/mjpeg.rs - MJPEG 实时画面服务
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

//! 每个设备一个 HTTP 端点：
//! - `GET /{device}.mjpeg` 以 `multipart/x-mixed-replace` 推送最新帧
//! - `GET /{device}.jpg` 返回当前帧，尚无画面时返回 204
//!
//! 服务运行在独立线程上的 actix 运行时中，不占用采集线程。

use std::{sync::Arc, thread, time::Duration};

use actix_web::{
  App, HttpResponse, HttpServer,
  http::header,
  web::{self, Bytes},
};
use async_stream::stream;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::output::live::{LiveFrame, LiveStream, StreamRegistry};

/// 默认实时画面端口
pub const LIVE_PORT: u16 = 18080;

const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(33);
const BOUNDARY: &str = "frame";

#[derive(Error, Debug)]
pub enum MjpegServerError {
  #[error("无法启动实时画面服务线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("实时画面服务无法监听端口 {port}: {reason}")]
  Bind { port: u16, reason: String },
}

/// 实时画面服务句柄
pub struct MjpegServer {
  port: u16,
  shutdown: Option<oneshot::Sender<()>>,
  handle: Option<thread::JoinHandle<()>>,
}

impl MjpegServer {
  pub fn port(&self) -> u16 {
    self.port
  }

  /// 通知服务停止并等待线程退出
  pub fn stop(mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
    info!("实时画面服务已停止");
  }

  /// 启动服务，端口监听成功后返回
  pub fn spawn(registry: Arc<StreamRegistry>, port: u16) -> Result<Self, MjpegServerError> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let handle = thread::Builder::new()
      .name("mjpeg-live".into())
      .spawn(move || {
        let result = actix_web::rt::System::new().block_on(async move {
          let bound = HttpServer::new(move || {
            App::new()
              .app_data(web::Data::from(registry.clone()))
              .route("/{file}", web::get().to(live_handler))
          })
          .workers(1)
          .bind(("0.0.0.0", port));

          let server = match bound {
            Ok(server) => server.run(),
            Err(e) => {
              let _ = ready_tx.send(Err(e.to_string()));
              return Ok(());
            }
          };
          let _ = ready_tx.send(Ok(()));

          let server_handle = server.handle();
          actix_web::rt::spawn(async move {
            let _ = shutdown_rx.await;
            server_handle.stop(true).await;
          });

          server.await
        });

        if let Err(e) = result {
          error!("实时画面服务错误: {}", e);
        }
      })?;

    match ready_rx.recv() {
      Ok(Ok(())) => {
        info!("实时画面服务已启动, 端口 {}", port);
        Ok(Self {
          port,
          shutdown: Some(shutdown_tx),
          handle: Some(handle),
        })
      }
      Ok(Err(reason)) => {
        let _ = handle.join();
        Err(MjpegServerError::Bind { port, reason })
      }
      Err(_) => {
        let _ = handle.join();
        Err(MjpegServerError::Bind {
          port,
          reason: "服务线程提前退出".to_string(),
        })
      }
    }
  }
}

async fn live_handler(path: web::Path<String>, registry: web::Data<StreamRegistry>) -> HttpResponse {
  let file = path.into_inner();
  if let Some(device) = file.strip_suffix(".mjpeg") {
    match registry.get(device) {
      Some(live) => stream_response(registry.into_inner(), device.to_string(), live),
      None => HttpResponse::NotFound().finish(),
    }
  } else if let Some(device) = file.strip_suffix(".jpg") {
    match registry.get(device).and_then(|live| live.latest()) {
      Some(frame) => HttpResponse::Ok()
        .content_type("image/jpeg")
        .body(Bytes::copy_from_slice(&frame.jpeg)),
      None if registry.get(device).is_some() => HttpResponse::NoContent().finish(),
      None => HttpResponse::NotFound().finish(),
    }
  } else {
    HttpResponse::NotFound().finish()
  }
}

fn multipart_chunk(frame: &LiveFrame) -> Bytes {
  let mut payload = Vec::with_capacity(frame.jpeg.len() + 96);
  payload.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
  payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
  payload.extend_from_slice(format!("Content-Length: {}\r\n\r\n", frame.jpeg.len()).as_bytes());
  payload.extend_from_slice(&frame.jpeg);
  payload.extend_from_slice(b"\r\n");
  Bytes::from(payload)
}

fn stream_response(
  registry: Arc<StreamRegistry>,
  device: String,
  live: Arc<LiveStream>,
) -> HttpResponse {
  let body = stream! {
    let mut interval = actix_web::rt::time::interval(FRAME_POLL_INTERVAL);
    let mut last_sequence = 0u64;
    loop {
      interval.tick().await;
      // 设备被移除或重新注册后结束推送
      let current = registry.get(&device);
      if current.is_none_or(|s| !Arc::ptr_eq(&s, &live)) {
        break;
      }
      let frame = match live.latest() {
        Some(frame) if frame.sequence != last_sequence => frame,
        _ => continue,
      };
      last_sequence = frame.sequence;
      yield Ok::<Bytes, actix_web::Error>(multipart_chunk(&frame));
    }
  };

  HttpResponse::Ok()
    .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
    .insert_header((header::CACHE_CONTROL, "no-cache"))
    .content_type(format!("multipart/x-mixed-replace; boundary={}", BOUNDARY))
    .streaming(body)
}
