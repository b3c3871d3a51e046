// 该文件是 Yeban （叶斑） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像文件
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
  fs::File,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use image::{ImageFormat, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::info;

use crate::{input::RawImage, output::Annotation};

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("无法创建输出目录 {0}: {1}")]
  OutputDir(PathBuf, std::io::Error),
  #[error("无法创建文件 {0}: {1}")]
  Create(PathBuf, std::io::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像编码错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 以 JPEG 写出标注图像
#[derive(Debug, Clone, Copy)]
pub struct SaveImageFileOutput {
  quality: u8,
}

impl Default for SaveImageFileOutput {
  fn default() -> Self {
    Self::new(DEFAULT_JPEG_QUALITY)
  }
}

impl SaveImageFileOutput {
  pub fn new(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }

  /// 始终写出 JPEG
  ///
  /// 图像未被修改且原本就是 JPEG 时，原样写出编码字节。
  /// 其他格式（如 PNG）即使未被修改也会重新编码为 JPEG，输出与输入不再逐字节相同。
  pub fn save(
    &self,
    image: &RawImage,
    annotation: Annotation,
    path: impl AsRef<Path>,
  ) -> Result<(), SaveImageFileError> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;

    let file = File::create(path).map_err(|e| SaveImageFileError::Create(path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);

    if annotation == Annotation::Untouched && image.format() == Some(ImageFormat::Jpeg) {
      writer.write_all(image.encoded())?;
    } else {
      JpegEncoder::new_with_quality(&mut writer, self.quality).encode_image(image.pixels())?;
    }
    writer.flush()?;

    info!("保存图像到文件: {}", path.display());
    Ok(())
  }
}

fn ensure_parent_dir(path: &Path) -> Result<(), SaveImageFileError> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .map_err(|e| SaveImageFileError::OutputDir(parent.to_path_buf(), e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use image::{Rgb, RgbImage};

  use super::*;
  use crate::input::ImageFileInput;

  fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
  }

  #[test]
  fn untouched_jpeg_is_copied_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = encode(&RgbImage::from_pixel(16, 16, Rgb([30, 120, 40])), ImageFormat::Jpeg);
    let raw = ImageFileInput::new(32).decode(bytes.clone()).unwrap();

    let path = dir.path().join("nested").join("leaf.jpg");
    SaveImageFileOutput::default()
      .save(&raw, Annotation::Untouched, &path)
      .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
  }

  #[test]
  fn drawn_image_is_reencoded_as_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = encode(&RgbImage::from_pixel(16, 16, Rgb([30, 120, 40])), ImageFormat::Png);
    let raw = ImageFileInput::new(32).decode(bytes).unwrap();

    let path = dir.path().join("leaf.jpg");
    SaveImageFileOutput::new(90)
      .save(&raw, Annotation::Drawn, &path)
      .unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(image::guess_format(&written).unwrap(), ImageFormat::Jpeg);
  }

  #[test]
  fn untouched_png_is_still_written_as_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = encode(&RgbImage::from_pixel(16, 16, Rgb([30, 120, 40])), ImageFormat::Png);
    let raw = ImageFileInput::new(32).decode(bytes.clone()).unwrap();

    let path = dir.path().join("leaf.jpg");
    SaveImageFileOutput::default()
      .save(&raw, Annotation::Untouched, &path)
      .unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_ne!(written, bytes);
    assert_eq!(image::guess_format(&written).unwrap(), ImageFormat::Jpeg);
  }

  #[test]
  fn output_dir_that_is_a_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("downloads");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let raw = ImageFileInput::new(32)
      .decode(encode(&RgbImage::new(4, 4), ImageFormat::Png))
      .unwrap();
    let err = SaveImageFileOutput::default()
      .save(&raw, Annotation::Drawn, blocker.join("leaf.jpg"))
      .unwrap_err();
    assert!(matches!(err, SaveImageFileError::OutputDir(_, _)));
  }
}
