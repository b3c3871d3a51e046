// 该文件是 Yeban （叶斑） 项目的一部分。
// src/report/speech.rs - 语音播报
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

use std::{collections::BTreeSet, path::PathBuf};

use thiserror::Error;

use crate::{
  report::{TreatmentKnowledgeBase, brief_for},
  selection::HEALTHY_LABEL,
};

pub const DEFAULT_LANGUAGE: &str = "hi";
pub const HEALTHY_NARRATION: &str = "Patta swasth hai. Koi upchaar ki zarurat nahi hai.";

/// 在线语音服务单次请求的最大字符数
pub const MAX_CHUNK_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum SynthesisError {
  #[error("没有需要合成的文本")]
  EmptyText,
  #[error("未配置语音合成后端")]
  Unavailable,
  #[error("语音服务地址无效: {0}")]
  Endpoint(#[from] url::ParseError),
  #[cfg(feature = "google_tts")]
  #[error("HTTP 请求失败: {0}")]
  Http(#[from] reqwest::Error),
  #[error("语音服务返回状态码 {0}")]
  Status(u16),
  #[error("语音服务返回了空音频")]
  EmptyAudio,
  #[error("无法写入音频文件 {0}: {1}")]
  Write(PathBuf, std::io::Error),
}

/// 文本 + 语言代码 → 音频字节
pub trait SpeechSynthesizer {
  fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError>;
}

impl<T: SpeechSynthesizer + ?Sized> SpeechSynthesizer for Box<T> {
  fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
    (**self).synthesize(text, language)
  }
}

/// 始终失败的后端，用于未启用在线语音服务的构建
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSynthesizer;

impl SpeechSynthesizer for UnavailableSynthesizer {
  fn synthesize(&self, _text: &str, _language: &str) -> Result<Vec<u8>, SynthesisError> {
    Err(SynthesisError::Unavailable)
  }
}

/// 每个标签一行播报；包含健康标签时只播报固定的安心语句
pub fn narration(labels: &BTreeSet<String>, knowledge: &TreatmentKnowledgeBase) -> String {
  if labels.contains(HEALTHY_LABEL) {
    return HEALTHY_NARRATION.to_string();
  }

  labels
    .iter()
    .map(|label| format!("{label} ke liye upaay hai: {}", brief_for(label, knowledge)))
    .collect::<Vec<_>>()
    .join("\n")
}

/// 按空白切分并贪心合并，每段不超过 `max_chars` 个字符
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
  let max_chars = max_chars.max(1);
  let mut chunks = Vec::new();
  let mut current = String::new();
  let mut current_len = 0;

  for word in text.split_whitespace() {
    let mut word = word;
    let mut word_len = word.chars().count();

    if current_len > 0 && current_len + 1 + word_len > max_chars {
      chunks.push(std::mem::take(&mut current));
      current_len = 0;
    }

    while word_len > max_chars {
      let split_at = word
        .char_indices()
        .nth(max_chars)
        .map_or(word.len(), |(i, _)| i);
      chunks.push(word[..split_at].to_string());
      word = &word[split_at..];
      word_len -= max_chars;
    }

    if word.is_empty() {
      continue;
    }
    if current_len > 0 {
      current.push(' ');
      current_len += 1;
    }
    current.push_str(word);
    current_len += word_len;
  }

  if !current.is_empty() {
    chunks.push(current);
  }
  chunks
}

#[cfg(feature = "google_tts")]
mod google {
  use std::time::Duration;

  use tracing::debug;
  use url::Url;

  use super::{MAX_CHUNK_CHARS, SpeechSynthesizer, SynthesisError, split_text};

  pub const GOOGLE_TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";
  const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
  const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64)";

  /// Google 翻译语音接口，返回拼接后的 MP3 数据
  #[derive(Debug, Clone)]
  pub struct GoogleTranslateTts {
    client: reqwest::blocking::Client,
    endpoint: Url,
  }

  impl GoogleTranslateTts {
    pub fn new() -> Result<Self, SynthesisError> {
      Self::with_endpoint(Url::parse(GOOGLE_TTS_ENDPOINT)?)
    }

    pub fn with_endpoint(endpoint: Url) -> Result<Self, SynthesisError> {
      let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
      Ok(Self { client, endpoint })
    }

    fn chunk_url(&self, chunk: &str, language: &str, index: usize, total: usize) -> Url {
      let mut url = self.endpoint.clone();
      url
        .query_pairs_mut()
        .append_pair("ie", "UTF-8")
        .append_pair("q", chunk)
        .append_pair("tl", language)
        .append_pair("total", &total.to_string())
        .append_pair("idx", &index.to_string())
        .append_pair("textlen", &chunk.chars().count().to_string())
        .append_pair("client", "tw-ob");
      url
    }
  }

  impl SpeechSynthesizer for GoogleTranslateTts {
    fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
      let chunks = split_text(text, MAX_CHUNK_CHARS);
      if chunks.is_empty() {
        return Err(SynthesisError::EmptyText);
      }

      let mut audio = Vec::new();
      for (index, chunk) in chunks.iter().enumerate() {
        let url = self.chunk_url(chunk, language, index, chunks.len());
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
          return Err(SynthesisError::Status(response.status().as_u16()));
        }
        let bytes = response.bytes()?;
        debug!("语音片段 {}/{}: {} 字节", index + 1, chunks.len(), bytes.len());
        audio.extend_from_slice(&bytes);
      }

      if audio.is_empty() {
        return Err(SynthesisError::EmptyAudio);
      }
      Ok(audio)
    }
  }

}

#[cfg(feature = "google_tts")]
pub use self::google::{GOOGLE_TTS_ENDPOINT, GoogleTranslateTts};
