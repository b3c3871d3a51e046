// 该文件是 Yeban （叶斑） 项目的一部分。
// src/output/naming.rs - 产物命名
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
  fmt,
  path::{Path, PathBuf},
};

pub const DEFAULT_ARTIFACT_PREFIX: &str = "appleleaf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
  Image,
  Document,
  Audio,
}

impl ArtifactKind {
  pub fn extension(self) -> &'static str {
    match self {
      ArtifactKind::Image => "jpg",
      ArtifactKind::Document => "pdf",
      ArtifactKind::Audio => "mp3",
    }
  }
}

/// 一次调用所有产物共享的基础标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn file_name(&self, kind: ArtifactKind) -> String {
    format!("{}.{}", self.0, kind.extension())
  }

  pub fn path_in(&self, dir: impl AsRef<Path>, kind: ArtifactKind) -> PathBuf {
    dir.as_ref().join(self.file_name(kind))
  }
}

impl fmt::Display for ArtifactId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// `<prefix>_<label>_<8 位十六进制>`
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
  prefix: String,
}

impl Default for ArtifactNamer {
  fn default() -> Self {
    Self::new(DEFAULT_ARTIFACT_PREFIX)
  }
}

impl ArtifactNamer {
  pub fn new(prefix: impl AsRef<str>) -> Self {
    Self {
      prefix: slug(prefix.as_ref()),
    }
  }

  pub fn next(&self, label: &str) -> ArtifactId {
    self.with_suffix(label, rand::random::<u32>())
  }

  pub fn with_suffix(&self, label: &str, suffix: u32) -> ArtifactId {
    ArtifactId(format!("{}_{}_{:08x}", self.prefix, slug(label), suffix))
  }
}

/// 小写化，空白与路径分隔等字符替换为下划线
pub fn slug(label: &str) -> String {
  let slug: String = label
    .trim()
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '-' || c == '_' {
        c
      } else {
        '_'
      }
    })
    .flat_map(char::to_lowercase)
    .collect();

  if slug.is_empty() {
    "unknown".to_string()
  } else {
    slug
  }
}
