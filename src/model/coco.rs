// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/coco.rs - COCO 类别表
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

/// COCO 91 个类别，下标 0 为背景，与检测输出的 label 字段一一对应
pub const COCO_CATEGORIES: [&str; 92] = [
  "__background__", "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
  "boat", "traffic light", "fire hydrant", "street sign", "stop sign", "parking meter", "bench",
  "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "hat",
  "backpack", "umbrella", "shoe", "eye glasses", "handbag", "tie", "suitcase", "frisbee", "skis",
  "snowboard", "sports ball", "kite", "baseball bat", "baseball glove", "skateboard", "surfboard",
  "tennis racket", "bottle", "plate", "wine glass", "cup", "fork", "knife", "spoon", "bowl",
  "banana", "apple", "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut",
  "cake", "chair", "couch", "potted plant", "bed", "mirror", "dining table", "window", "desk",
  "toilet", "door", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone", "microwave",
  "oven", "toaster", "sink", "refrigerator", "blender", "book", "clock", "vase", "scissors",
  "teddy bear", "hair drier", "toothbrush", "hair brush",
];

/// 类别名称，下标越界或非整数时返回 `None`
pub fn category_name(label: f32) -> Option<&'static str> {
  if !label.is_finite() || label < 0.0 || label.fract() != 0.0 {
    return None;
  }
  COCO_CATEGORIES.get(label as usize).copied()
}
