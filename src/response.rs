// 该文件是 Yeban （叶斑） 项目的一部分。
// src/response.rs - 调用结果的 JSON 表示
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

use std::path::Path;

use serde::Serialize;

use crate::{
  pipeline::{ArtifactSet, PipelineError, QuickResult},
  report::BriefReport,
  selection::DetectionSummary,
};

pub const DOWNLOAD_ROUTE: &str = "/downloads";

/// 产物文件对应的下载路径
pub fn download_url(path: &Path) -> String {
  let name = path
    .file_name()
    .map(|name| name.to_string_lossy())
    .unwrap_or_default();
  format!("{DOWNLOAD_ROUTE}/{name}")
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
  pub detected_diseases: Vec<DetectionSummary>,
  pub treatment_report: BriefReport,
  pub annotated_image: String,
}

impl From<&QuickResult> for PredictResponse {
  fn from(result: &QuickResult) -> Self {
    Self {
      detected_diseases: result.detections.clone(),
      treatment_report: result.brief_report.clone(),
      annotated_image: download_url(&result.annotated_image),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportResponse {
  pub detected_diseases: Vec<DetectionSummary>,
  pub treatment_report: BriefReport,
  pub annotated_image: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pdf_report: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub voice_report: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub warnings: Vec<String>,
}

impl From<&ArtifactSet> for ReportResponse {
  fn from(set: &ArtifactSet) -> Self {
    Self {
      detected_diseases: set.detections.clone(),
      treatment_report: set.brief_report.clone(),
      annotated_image: download_url(&set.annotated_image),
      pdf_report: set.document.as_deref().map(download_url),
      voice_report: set.audio.as_deref().map(download_url),
      warnings: set.failures.iter().map(ToString::to_string).collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
  pub status: u16,
  pub detail: String,
}

impl ErrorResponse {
  /// 调用方错误返回 400 与具体原因，其余返回 500 与固定说明
  pub fn from_error(error: &PipelineError, server_detail: &str) -> Self {
    if error.is_client_error() {
      Self {
        status: 400,
        detail: error.to_string(),
      }
    } else {
      Self {
        status: 500,
        detail: server_detail.to_string(),
      }
    }
  }

  pub fn for_predict(error: &PipelineError) -> Self {
    Self::from_error(error, "Prediction failed")
  }

  pub fn for_report(error: &PipelineError) -> Self {
    Self::from_error(error, "Report generation failed")
  }
}
