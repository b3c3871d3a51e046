// 该文件是 Yeban （叶斑） 项目的一部分。
// src/model.rs - 模型
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

use std::{path::Path, sync::Arc};

use thiserror::Error;

/// 只读推理模型
///
/// 实现必须在 `&self` 上可重入：并发调用之间不保留任何状态。
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;

  /// 模型要求的正方形输入边长；`None` 表示由调用方决定
  fn input_size(&self) -> Option<u32> {
    None
  }
}

/// 模型输出的一个候选框，坐标位于推理分辨率下
#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取标签文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("标签文件为空")]
  Empty,
}

/// 类别编号到类别名称的映射
#[derive(Debug, Clone)]
pub struct LabelSet {
  names: Arc<[String]>,
}

impl LabelSet {
  pub fn new<I, S>(names: I) -> Result<Self, LabelError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let names: Vec<String> = names.into_iter().map(Into::into).collect();
    if names.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self {
      names: names.into(),
    })
  }

  /// 每行一个类别名称，空行与 `#` 注释行被忽略
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let content = std::fs::read_to_string(path)?;
    Self::new(
      content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#')),
    )
  }

  pub fn name(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

mod yolo;
pub use self::yolo::{OutputLayout, Yolo, YoloBuilder, YoloError};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn label_file_skips_blank_and_comment_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "# apple leaf\nblack rot\n\nrust\n  scab  \n").unwrap();

    let labels = LabelSet::from_file(&path).unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.name(0), Some("black rot"));
    assert_eq!(labels.name(2), Some("scab"));
    assert_eq!(labels.name(3), None);
  }

  #[test]
  fn empty_label_set_is_rejected() {
    assert!(matches!(
      LabelSet::new(Vec::<String>::new()),
      Err(LabelError::Empty)
    ));
  }
}
