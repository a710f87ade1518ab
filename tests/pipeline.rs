// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 设备推理流程集成测试
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
  sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use image::RgbImage;

use shanan_ovms::{
  client::DialPolicy,
  config::{Devices, PROTOCOL, Protocols},
  frame::Frame,
  input::{FrameSource, FrameSourceError, FrameSourceOpener},
  model::{
    Connector, Endpoint, InferResponse, InferenceError, InferenceService, ModelSpec, OutputTensor,
    TensorSpec,
  },
  output::draw::Draw,
  session::SessionManager,
  task::RetryPolicy,
};

/// 前 `failures` 次打开失败，之后返回无限帧的输入源
#[derive(Default)]
struct Camera {
  failures: u32,
  opens: AtomicU32,
  closes: Arc<AtomicU32>,
}

struct CameraSource {
  index: u64,
  closes: Arc<AtomicU32>,
}

impl FrameSource for CameraSource {
  fn read_frame(&mut self) -> Result<Frame, FrameSourceError> {
    thread::sleep(Duration::from_millis(5));
    self.index += 1;
    Ok(Frame::new(self.index, RgbImage::new(32, 24)))
  }
}

impl Drop for CameraSource {
  fn drop(&mut self) {
    self.closes.fetch_add(1, Ordering::SeqCst);
  }
}

impl FrameSourceOpener for Camera {
  fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    let open = self.opens.fetch_add(1, Ordering::SeqCst);
    if open < self.failures {
      return Err(FrameSourceError::Open {
        uri: uri.to_string(),
        reason: "offline".to_string(),
      });
    }
    Ok(Box::new(CameraSource {
      index: 0,
      closes: self.closes.clone(),
    }))
  }
}

/// 每次推理返回一条高于阈值、两条低于阈值的检测
struct Detector;

impl InferenceService for Detector {
  fn model_inputs(&self, _: &ModelSpec) -> Result<Vec<TensorSpec>, InferenceError> {
    Ok(vec![TensorSpec {
      name: "image".to_string(),
      datatype: "BYTES".to_string(),
      shape: vec![1, -1, -1, 3],
    }])
  }

  fn infer(
    &self,
    model: &ModelSpec,
    input: &str,
    image: &[u8],
  ) -> Result<InferResponse, InferenceError> {
    assert_eq!(input, "image");
    assert!(!image.is_empty());

    let rows: [[f32; 7]; 3] = [
      [0.0, 1.0, 0.9, 0.1, 0.1, 0.5, 0.5],
      [0.0, 3.0, 0.4, 0.2, 0.2, 0.6, 0.6],
      [0.0, 18.0, 0.1, 0.0, 0.0, 1.0, 1.0],
    ];
    Ok(InferResponse {
      model_name: model.name.clone(),
      outputs: vec![OutputTensor {
        name: "detection_out".to_string(),
        datatype: "FP32".to_string(),
        shape: vec![1, 1, 3, 7],
        raw: rows.iter().flatten().flat_map(|v| v.to_le_bytes()).collect(),
      }],
    })
  }
}

struct Server;

impl Connector for Server {
  fn connect(&self, _: &Endpoint) -> Result<Arc<dyn InferenceService>, InferenceError> {
    Ok(Arc::new(Detector))
  }
}

fn protocols(snapshot: &str) -> Protocols {
  let properties = [
    ("Host", "127.0.0.1"),
    ("Port", "9000"),
    ("Model", "ssd_mobilenet"),
    ("Version", "1"),
    ("Uri", "rtsp://camera/live"),
    ("Score", "0"),
    ("Record", "false"),
    ("Snapshot", snapshot),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_string(), v.to_string()))
  .collect();
  Protocols::from([(PROTOCOL.to_string(), properties)])
}

fn manager(camera: Arc<Camera>) -> SessionManager {
  SessionManager::new(camera, Arc::new(Server))
    .with_draw(Draw::with_font(None))
    .with_dial_policy(DialPolicy {
      attempts: 1,
      interval: Duration::ZERO,
    })
    .with_retry_policy(RetryPolicy {
      attempts: 60,
      interval: Duration::from_millis(1),
    })
}

fn wait_for_reading(manager: &SessionManager, device: &str) -> serde_json::Value {
  let deadline = Instant::now() + Duration::from_secs(10);
  while Instant::now() < deadline {
    if let Some(reading) = manager.handle_read_command(device).unwrap() {
      return serde_json::from_str(&reading).unwrap();
    }
    thread::sleep(Duration::from_millis(10));
  }
  panic!("no reading for {}", device);
}

#[test]
fn reading_contains_only_detections_above_threshold() {
  let camera = Arc::new(Camera::default());
  let manager = manager(camera.clone());
  let devices = Devices::from([("front".to_string(), protocols("true"))]);
  manager.initialize(&devices);

  let reading = wait_for_reading(&manager, "front");
  assert_eq!(reading["model_name"], "ssd_mobilenet");
  let scores: Vec<f64> = reading["scores"]
    .as_array()
    .unwrap()
    .iter()
    .filter_map(|v| v.as_f64())
    .collect();
  assert_eq!(scores.len(), 1);
  assert!((scores[0] - 0.9).abs() < 1e-6);
  assert!(reading["infer_fps"].as_str().unwrap().parse::<f64>().is_ok());
  assert!(
    reading["snapshot"]
      .as_str()
      .unwrap()
      .starts_with("data:image/jpeg;base64,")
  );
  assert!(reading["original"].is_string());

  // 未声明的输入尺寸回退为 640x640
  let input = manager.model_input("front").unwrap();
  assert_eq!((input.width, input.height), (640, 640));

  let live = manager.streams().get("front").unwrap();
  assert!(live.latest().is_some());

  assert!(manager.remove_device("front"));
  assert_eq!(
    camera.closes.load(Ordering::SeqCst),
    camera.opens.load(Ordering::SeqCst)
  );
  assert!(manager.streams().get("front").is_none());
}

#[test]
fn original_frame_is_omitted_without_snapshot() {
  let manager = manager(Arc::new(Camera::default()));
  manager.add_device("side", &protocols("false")).unwrap();

  let reading = wait_for_reading(&manager, "side");
  assert!(reading.get("original").is_none());
  manager.stop(false);
}

#[test]
fn device_recovers_after_source_comes_back() {
  let camera = Arc::new(Camera {
    failures: 5,
    ..Default::default()
  });
  let manager = manager(camera.clone());
  manager.add_device("gate", &protocols("false")).unwrap();

  wait_for_reading(&manager, "gate");
  assert!(manager.is_running("gate"));
  assert_eq!(camera.opens.load(Ordering::SeqCst), 6);

  manager.stop(false);
  assert!(manager.devices().is_empty());
  assert_eq!(camera.closes.load(Ordering::SeqCst), 1);
}
