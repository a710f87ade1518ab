// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 检测结果张量解码
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

//! SSD 风格检测输出的解码。
//!
//! 输出张量形状为 `[1, 1, N, 7]`，每条记录依次为
//! `image_id, label, confidence, x_min, y_min, x_max, y_max`，
//! 以小端 IEEE-754 float32 连续存放。

use thiserror::Error;

/// 每条检测记录的字段数
pub const DETECTION_FIELDS: usize = 7;

const SHAPE_RANK: usize = 4;
const COUNT_AXIS: usize = 2;
const FIELDS_AXIS: usize = 3;
const F32_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
  #[error("张量维度不匹配: 期望 4 维, 实际形状 {0:?}")]
  RankMismatch(Vec<i64>),
  #[error("张量形状非法: {0:?}")]
  InvalidShape(Vec<i64>),
  #[error("每条记录字段数不匹配: 期望 7, 实际 {0}")]
  FieldCountMismatch(usize),
  #[error("张量数据长度不足: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  BufferTooShort { expected: usize, actual: usize },
}

/// 单条检测记录，坐标为归一化坐标 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionRecord {
  pub image_id: f32,
  pub label: f32,
  pub confidence: f32,
  pub bbox: [f32; 4],
}

impl DetectionRecord {
  fn from_fields(fields: &[f32]) -> Self {
    Self {
      image_id: fields[0],
      label: fields[1],
      confidence: fields[2],
      bbox: [fields[3], fields[4], fields[5], fields[6]],
    }
  }
}

/// 按声明的形状解码原始输出，顺序与输入一致。
///
/// 数据不足 `N * 7 * 4` 字节时返回错误而不是截断。
pub fn decode_detections(raw: &[u8], shape: &[i64]) -> Result<Vec<DetectionRecord>, TensorError> {
  if shape.len() != SHAPE_RANK {
    return Err(TensorError::RankMismatch(shape.to_vec()));
  }

  let count =
    usize::try_from(shape[COUNT_AXIS]).map_err(|_| TensorError::InvalidShape(shape.to_vec()))?;
  let fields =
    usize::try_from(shape[FIELDS_AXIS]).map_err(|_| TensorError::InvalidShape(shape.to_vec()))?;
  if fields != DETECTION_FIELDS {
    return Err(TensorError::FieldCountMismatch(fields));
  }

  let expected = count
    .checked_mul(DETECTION_FIELDS * F32_SIZE)
    .ok_or_else(|| TensorError::InvalidShape(shape.to_vec()))?;
  if raw.len() < expected {
    return Err(TensorError::BufferTooShort {
      expected,
      actual: raw.len(),
    });
  }

  let values: Vec<f32> = raw[..expected]
    .chunks_exact(F32_SIZE)
    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    .collect();

  Ok(
    values
      .chunks_exact(DETECTION_FIELDS)
      .map(DetectionRecord::from_fields)
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode(records: &[[f32; DETECTION_FIELDS]]) -> Vec<u8> {
    records
      .iter()
      .flatten()
      .flat_map(|v| v.to_le_bytes())
      .collect()
  }

  #[test]
  fn decodes_records_in_input_order() {
    let raw = encode(&[
      [0.0, 1.0, 0.9, 0.1, 0.2, 0.3, 0.4],
      [0.0, 3.0, 0.2, 0.5, 0.5, 0.9, 0.9],
      [0.0, 18.0, 0.7, 0.0, 0.0, 1.0, 1.0],
    ]);
    let records = decode_detections(&raw, &[1, 1, 3, 7]).unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].label, 1.0);
    assert_eq!(records[1].label, 3.0);
    assert_eq!(records[2].label, 18.0);
    assert_eq!(records[0].bbox, [0.1, 0.2, 0.3, 0.4]);
  }

  #[test]
  fn decoded_values_reencode_to_the_same_bytes() {
    let raw = encode(&[
      [0.0, 44.0, 0.8125, -0.05, 0.25, 1.125, 0.75],
      [0.0, 1.0, 0.333_333_34, 0.1, 0.1, 0.2, 0.2],
    ]);
    let records = decode_detections(&raw, &[1, 1, 2, 7]).unwrap();
    let again: Vec<[f32; DETECTION_FIELDS]> = records
      .iter()
      .map(|r| {
        [
          r.image_id, r.label, r.confidence, r.bbox[0], r.bbox[1], r.bbox[2], r.bbox[3],
        ]
      })
      .collect();

    assert_eq!(encode(&again), raw);
  }

  #[test]
  fn short_buffer_is_an_error() {
    let raw = encode(&[[0.0, 1.0, 0.9, 0.1, 0.2, 0.3, 0.4]]);
    let err = decode_detections(&raw[..raw.len() - 1], &[1, 1, 1, 7]).unwrap_err();
    assert_eq!(
      err,
      TensorError::BufferTooShort {
        expected: 28,
        actual: 27
      }
    );
  }

  #[test]
  fn rejects_unexpected_shapes() {
    assert!(matches!(
      decode_detections(&[], &[1, 3, 7]),
      Err(TensorError::RankMismatch(_))
    ));
    assert!(matches!(
      decode_detections(&[], &[1, 1, -1, 7]),
      Err(TensorError::InvalidShape(_))
    ));
    assert_eq!(
      decode_detections(&[], &[1, 1, 0, 6]),
      Err(TensorError::FieldCountMismatch(6))
    );
  }

  #[test]
  fn empty_tensor_decodes_to_nothing() {
    assert!(decode_detections(&[], &[1, 1, 0, 7]).unwrap().is_empty());
  }
}
