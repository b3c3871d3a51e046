// 该文件是 Yeban （叶斑） 项目的一部分。
// src/report/knowledge.rs - 病害防治知识库
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
  collections::HashMap,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum KnowledgeBaseError {
  #[error("无法读取知识库 {0}: {1}")]
  Io(PathBuf, std::io::Error),
  #[error("知识库格式错误: {0}")]
  Parse(#[from] serde_json::Error),
}

/// 单个病害的防治信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentRecord {
  pub title: String,
  pub summary: String,
  pub brief: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fungicides: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub steps: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prevention: Option<String>,
}

/// 标签到防治信息的只读映射，进程启动时加载一次
#[derive(Debug, Clone, Default)]
pub struct TreatmentKnowledgeBase {
  records: HashMap<String, TreatmentRecord>,
}

impl TreatmentKnowledgeBase {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, KnowledgeBaseError> {
    let path = path.as_ref();
    let content =
      std::fs::read_to_string(path).map_err(|e| KnowledgeBaseError::Io(path.to_path_buf(), e))?;
    let knowledge = Self::from_json_str(&content)?;
    info!("加载知识库: {} ({} 条记录)", path.display(), knowledge.len());
    Ok(knowledge)
  }

  /// JSON 对象：键为病害标签，值为 [`TreatmentRecord`]
  pub fn from_json_str(json: &str) -> Result<Self, KnowledgeBaseError> {
    let records = serde_json::from_str(json)?;
    Ok(Self { records })
  }

  pub fn get(&self, label: &str) -> Option<&TreatmentRecord> {
    self.records.get(label)
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

impl FromIterator<(String, TreatmentRecord)> for TreatmentKnowledgeBase {
  fn from_iter<T: IntoIterator<Item = (String, TreatmentRecord)>>(iter: T) -> Self {
    Self {
      records: iter.into_iter().collect(),
    }
  }
}
