// 该文件是 Yeban （叶斑） 项目的一部分。
// src/input/upload.rs - 上传文件暂存
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
  io::Write,
  path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

pub const ACCEPTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum UploadError {
  #[error("只接受 .jpg/.jpeg/.png 文件: {0}")]
  UnsupportedExtension(String),
  #[error("无法写入临时目录 {0}: {1}")]
  TempDir(PathBuf, std::io::Error),
}

/// 暂存在临时目录中的上传文件
///
/// 文件随值一起释放，任何退出路径都会删除。
#[derive(Debug)]
pub struct StagedUpload {
  file: NamedTempFile,
}

impl StagedUpload {
  pub fn stage(
    temp_dir: impl AsRef<Path>,
    file_name: &str,
    bytes: &[u8],
  ) -> Result<Self, UploadError> {
    let temp_dir = temp_dir.as_ref();
    let name = sanitize_file_name(file_name);
    check_extension(&name)?;

    let io_err = |e: std::io::Error| UploadError::TempDir(temp_dir.to_path_buf(), e);
    std::fs::create_dir_all(temp_dir).map_err(io_err)?;

    let mut file = tempfile::Builder::new()
      .prefix("upload_")
      .suffix(&format!("_{name}"))
      .tempfile_in(temp_dir)
      .map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.flush().map_err(io_err)?;

    debug!("上传文件已暂存: {}", file.path().display());
    Ok(Self { file })
  }

  pub fn path(&self) -> &Path {
    self.file.path()
  }
}

fn check_extension(name: &str) -> Result<(), UploadError> {
  let ext = Path::new(name)
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| ext.to_ascii_lowercase());

  match ext {
    Some(ext) if ACCEPTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
    _ => Err(UploadError::UnsupportedExtension(name.to_string())),
  }
}

/// 只保留文件名部分，去掉任何目录成分
fn sanitize_file_name(file_name: &str) -> String {
  file_name
    .rsplit(['/', '\\'])
    .next()
    .unwrap_or_default()
    .to_string()
}
