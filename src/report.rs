// 该文件是 Yeban （叶斑） 项目的一部分。
// src/report.rs - 诊断报告
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
  collections::{BTreeMap, BTreeSet},
  path::Path,
};

use tracing::{debug, info};

use crate::selection::HEALTHY_LABEL;

mod document;
pub use self::document::{
  DOCUMENT_TITLE, DocumentError, DocumentRenderer, IMAGE_PLACEHOLDER, NO_SUMMARY,
  RenderedDocument, sanitize,
};

mod knowledge;
pub use self::knowledge::{KnowledgeBaseError, TreatmentKnowledgeBase, TreatmentRecord};

pub mod speech;
pub use self::speech::{SpeechSynthesizer, SynthesisError, UnavailableSynthesizer};

pub const NO_TREATMENT: &str = "No treatment available.";
pub const HEALTHY_BRIEF: &str = "The leaf is healthy. No treatment is needed.";

/// 标签 → 简要防治建议
pub type BriefReport = BTreeMap<String, String>;

/// 单个标签的简要建议；健康标签始终使用固定文本
pub fn brief_for<'a>(label: &str, knowledge: &'a TreatmentKnowledgeBase) -> &'a str {
  if label == HEALTHY_LABEL {
    return HEALTHY_BRIEF;
  }
  knowledge
    .get(label)
    .map_or(NO_TREATMENT, |record| record.brief.as_str())
}

/// 由诊断结果和知识库生成简报、PDF 与语音
pub struct ReportComposer<S> {
  knowledge: TreatmentKnowledgeBase,
  renderer: DocumentRenderer,
  synthesizer: S,
  language: String,
}

impl<S: SpeechSynthesizer> ReportComposer<S> {
  pub fn new(knowledge: TreatmentKnowledgeBase, synthesizer: S, language: impl Into<String>) -> Self {
    Self {
      knowledge,
      renderer: DocumentRenderer::default(),
      synthesizer,
      language: language.into(),
    }
  }

  pub fn knowledge(&self) -> &TreatmentKnowledgeBase {
    &self.knowledge
  }

  pub fn language(&self) -> &str {
    &self.language
  }

  pub fn brief(&self, labels: &BTreeSet<String>) -> BriefReport {
    labels
      .iter()
      .map(|label| (label.clone(), brief_for(label, &self.knowledge).to_string()))
      .collect()
  }

  pub fn narration(&self, labels: &BTreeSet<String>) -> String {
    speech::narration(labels, &self.knowledge)
  }

  /// 返回图像是否嵌入成功；嵌入失败时文档中写入占位文字
  pub fn write_document(
    &self,
    labels: &BTreeSet<String>,
    image_path: &Path,
    path: &Path,
  ) -> Result<bool, DocumentError> {
    self.renderer.save(labels, &self.knowledge, image_path, path)
  }

  pub fn write_audio(&self, labels: &BTreeSet<String>, path: &Path) -> Result<(), SynthesisError> {
    let text = self.narration(labels);
    debug!("播报文本: {}", text);
    let audio = self.synthesizer.synthesize(&text, &self.language)?;
    if audio.is_empty() {
      return Err(SynthesisError::EmptyAudio);
    }
    std::fs::write(path, &audio).map_err(|e| SynthesisError::Write(path.to_path_buf(), e))?;
    info!("保存语音到文件: {} ({} 字节)", path.display(), audio.len());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;

  #[derive(Default)]
  struct Recorder {
    calls: Mutex<Vec<(String, String)>>,
  }

  impl SpeechSynthesizer for Recorder {
    fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
      self
        .calls
        .lock()
        .unwrap()
        .push((text.to_string(), language.to_string()));
      Ok(b"ID3".to_vec())
    }
  }

  fn composer() -> ReportComposer<Recorder> {
    let knowledge = TreatmentKnowledgeBase::from_json_str(
      r#"{
        "rust": {"title": "Rust", "summary": "s", "brief": "Spray myclobutanil."},
        "healthy": {"title": "Healthy", "summary": "s", "brief": "ignored"}
      }"#,
    )
    .unwrap();
    ReportComposer::new(knowledge, Recorder::default(), "hi")
  }

  fn labels(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn brief_report_falls_back_for_unknown_labels() {
    let brief = composer().brief(&labels(&["rust", "black rot"]));
    assert_eq!(brief["rust"], "Spray myclobutanil.");
    assert_eq!(brief["black rot"], NO_TREATMENT);
  }

  #[test]
  fn healthy_brief_is_fixed() {
    let brief = composer().brief(&labels(&["healthy"]));
    assert_eq!(brief.len(), 1);
    assert_eq!(brief["healthy"], HEALTHY_BRIEF);
  }

  #[test]
  fn audio_uses_configured_language() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voice.mp3");
    let composer = composer();
    composer.write_audio(&labels(&["rust"]), &path).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"ID3");
    let calls = composer.synthesizer.calls.lock().unwrap();
    assert_eq!(
      calls.as_slice(),
      &[(
        "rust ke liye upaay hai: Spray myclobutanil.".to_string(),
        "hi".to_string()
      )]
    );
  }
}
