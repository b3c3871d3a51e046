// 该文件是 Yeban （叶斑） 项目的一部分。
// src/input/read_image_file.rs - 图像文件读取与预处理
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

use std::{io::Cursor, path::Path};

use image::{ImageFormat, ImageReader, Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;
use tract_onnx::prelude::tract_ndarray::Array4;

use crate::frame::{InputTensor, Letterbox, RGB_CHANNELS};

/// letterbox 填充灰度值
const LETTERBOX_FILL: u8 = 114;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("Image has zero width or height")]
  EmptyImage,
}

/// 解码后的原始图像
///
/// 保留原始编码字节，便于在未绘制时原样写出。
#[derive(Debug, Clone)]
pub struct RawImage {
  pixels: RgbImage,
  encoded: Vec<u8>,
  format: Option<ImageFormat>,
}

impl RawImage {
  pub fn width(&self) -> u32 {
    self.pixels.width()
  }

  pub fn height(&self) -> u32 {
    self.pixels.height()
  }

  pub fn pixels(&self) -> &RgbImage {
    &self.pixels
  }

  pub fn pixels_mut(&mut self) -> &mut RgbImage {
    &mut self.pixels
  }

  pub fn format(&self) -> Option<ImageFormat> {
    self.format
  }

  pub fn encoded(&self) -> &[u8] {
    &self.encoded
  }
}

/// 图像预处理器
///
/// 读取并解码输入图像，再生成检测模型需要的 letterbox 张量。
#[derive(Debug, Clone, Copy)]
pub struct ImageFileInput {
  size: u32,
  filter: FilterType,
}

impl ImageFileInput {
  pub fn new(size: u32) -> Self {
    Self {
      size,
      filter: FilterType::Triangle,
    }
  }

  pub fn with_filter(mut self, filter: FilterType) -> Self {
    self.filter = filter;
    self
  }

  pub fn size(&self) -> u32 {
    self.size
  }

  pub fn read(&self, path: impl AsRef<Path>) -> Result<RawImage, ImageFileInputError> {
    let path = path.as_ref();
    let encoded = std::fs::read(path)?;
    debug!("读取图像文件: {} ({} 字节)", path.display(), encoded.len());
    self.decode(encoded)
  }

  pub fn decode(&self, encoded: Vec<u8>) -> Result<RawImage, ImageFileInputError> {
    let reader = ImageReader::new(Cursor::new(&encoded)).with_guessed_format()?;
    let format = reader.format();
    let pixels = reader.decode()?.to_rgb8();

    if pixels.width() == 0 || pixels.height() == 0 {
      return Err(ImageFileInputError::EmptyImage);
    }

    debug!(
      "图像解码完成: {}x{} {:?}",
      pixels.width(),
      pixels.height(),
      format
    );

    Ok(RawImage {
      pixels,
      encoded,
      format,
    })
  }

  /// 生成 `[1, 3, size, size]` 的归一化张量
  pub fn to_tensor(&self, image: &RawImage) -> InputTensor {
    let letterbox = Letterbox::new(image.width(), image.height(), self.size);
    let (scaled_w, scaled_h) = letterbox.scaled_size();

    let resized = image::imageops::resize(image.pixels(), scaled_w, scaled_h, self.filter);
    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([LETTERBOX_FILL; 3]));
    image::imageops::replace(
      &mut canvas,
      &resized,
      letterbox.offset_x as i64,
      letterbox.offset_y as i64,
    );
    drop(resized);

    let size = self.size as usize;
    let data = Array4::from_shape_fn((1, RGB_CHANNELS, size, size), |(_, c, y, x)| {
      canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });

    InputTensor::new(data, letterbox)
  }
}
