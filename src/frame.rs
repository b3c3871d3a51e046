// 该文件是 Yeban （叶斑） 项目的一部分。
// src/frame.rs - NCHW 输入张量定义
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

use tract_onnx::prelude::{
  Tensor,
  tract_ndarray::{Array4, ArrayView4},
};

pub const RGB_CHANNELS: usize = 3;

/// 正方形推理输入与原图之间的 letterbox 变换
///
/// 原图按等比缩放后居中放入 `size x size` 画布，
/// `offset_x` / `offset_y` 为左上角的填充像素数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub size: u32,
  pub source_width: u32,
  pub source_height: u32,
  pub gain: f32,
  pub offset_x: u32,
  pub offset_y: u32,
}

impl Letterbox {
  pub fn new(source_width: u32, source_height: u32, size: u32) -> Self {
    let gain = (size as f32 / source_width.max(1) as f32)
      .min(size as f32 / source_height.max(1) as f32);
    let scaled_w = ((source_width as f32 * gain).round() as u32).clamp(1, size);
    let scaled_h = ((source_height as f32 * gain).round() as u32).clamp(1, size);

    Self {
      size,
      source_width,
      source_height,
      gain,
      offset_x: (size - scaled_w) / 2,
      offset_y: (size - scaled_h) / 2,
    }
  }

  /// 缩放后（未填充）图像的尺寸
  pub fn scaled_size(&self) -> (u32, u32) {
    let w = ((self.source_width as f32 * self.gain).round() as u32).clamp(1, self.size);
    let h = ((self.source_height as f32 * self.gain).round() as u32).clamp(1, self.size);
    (w, h)
  }

  /// 将推理分辨率下的坐标映射回原图坐标（未取整、未裁剪）
  pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x - self.offset_x as f32) / self.gain,
      (y - self.offset_y as f32) / self.gain,
    )
  }
}

/// 归一化到 [0, 1] 的 RGB NCHW 浮点张量，batch 维固定为 1
#[derive(Debug, Clone)]
pub struct InputTensor {
  data: Array4<f32>,
  letterbox: Letterbox,
}

impl InputTensor {
  pub fn new(data: Array4<f32>, letterbox: Letterbox) -> Self {
    let size = letterbox.size as usize;
    debug_assert_eq!(data.shape(), &[1, RGB_CHANNELS, size, size]);
    Self { data, letterbox }
  }

  pub fn shape(&self) -> &[usize] {
    self.data.shape()
  }

  pub fn letterbox(&self) -> &Letterbox {
    &self.letterbox
  }

  pub fn view(&self) -> ArrayView4<'_, f32> {
    self.data.view()
  }

  pub fn to_tensor(&self) -> Tensor {
    Tensor::from(self.data.clone())
  }
}
