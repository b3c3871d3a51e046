// 该文件是 Yeban （叶斑） 项目的一部分。
// src/pipeline.rs - 单图诊断流水线
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
  str::FromStr,
  time::Instant,
};

use ab_glyph::FontArc;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::{
  frame::InputTensor,
  input::{ImageFileInput, ImageFileInputError, RawImage, StagedUpload, UploadError},
  model::{DetectResult, LabelSet, Model},
  output::{
    Annotator, ArtifactId, ArtifactKind, ArtifactNamer, DEFAULT_ARTIFACT_PREFIX,
    DEFAULT_JPEG_QUALITY, SaveImageFileError, SaveImageFileOutput,
  },
  report::{
    BriefReport, DocumentError, ReportComposer, SpeechSynthesizer, SynthesisError,
    TreatmentKnowledgeBase, speech::DEFAULT_LANGUAGE,
  },
  selection::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_DETECTIONS,
    DetectionSelector, DetectionSummary, Selection,
  },
};

/// PDF 或语音生成失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactPolicy {
  /// 整次调用失败，并删除已写出的产物
  #[default]
  Strict,
  /// 记录失败并返回其余产物
  BestEffort,
}

impl FromStr for ArtifactPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "strict" => Ok(ArtifactPolicy::Strict),
      "best-effort" | "best_effort" => Ok(ArtifactPolicy::BestEffort),
      other => Err(format!("未知的产物策略: {other}")),
    }
  }
}

impl fmt::Display for ArtifactPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ArtifactPolicy::Strict => f.write_str("strict"),
      ArtifactPolicy::BestEffort => f.write_str("best-effort"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub output_dir: PathBuf,
  pub temp_dir: PathBuf,
  pub artifact_prefix: String,
  /// 正方形输入分辨率，仅在模型未给出时使用
  pub input_size: u32,
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub max_detections: usize,
  pub language: String,
  pub policy: ArtifactPolicy,
  /// 同时进行的前向推理数量上限
  pub inference_slots: usize,
  pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      output_dir: PathBuf::from("downloads"),
      temp_dir: PathBuf::from("temp"),
      artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
      input_size: 640,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      max_detections: DEFAULT_MAX_DETECTIONS,
      language: DEFAULT_LANGUAGE.to_string(),
      policy: ArtifactPolicy::Strict,
      inference_slots: 1,
      jpeg_quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("{0}")]
  Image(#[from] ImageFileInputError),
  #[error("{0}")]
  Upload(UploadError),
}

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("标注图像: {0}")]
  Image(SaveImageFileError),
  #[error("PDF 报告: {0}")]
  Document(DocumentError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("图像解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("模型推理失败: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("渲染失败: {0}")]
  Render(#[from] RenderError),
  #[error("语音合成失败: {0}")]
  Synthesis(#[source] SynthesisError),
  #[error("存储失败 {0}: {1}")]
  Storage(PathBuf, #[source] std::io::Error),
}

impl PipelineError {
  /// 失败所在的阶段
  pub fn stage(&self) -> &'static str {
    match self {
      PipelineError::Decode(_) => "decode",
      PipelineError::Inference(_) => "inference",
      PipelineError::Render(_) => "render",
      PipelineError::Synthesis(_) => "synthesis",
      PipelineError::Storage(_, _) => "storage",
    }
  }

  /// 只有输入图像本身的问题算作调用方错误
  pub fn is_client_error(&self) -> bool {
    matches!(self, PipelineError::Decode(_))
  }
}

impl From<ImageFileInputError> for PipelineError {
  fn from(e: ImageFileInputError) -> Self {
    PipelineError::Decode(DecodeError::Image(e))
  }
}

impl From<UploadError> for PipelineError {
  fn from(e: UploadError) -> Self {
    match e {
      UploadError::TempDir(path, e) => PipelineError::Storage(path, e),
      e => PipelineError::Decode(DecodeError::Upload(e)),
    }
  }
}

impl From<SaveImageFileError> for PipelineError {
  fn from(e: SaveImageFileError) -> Self {
    match e {
      SaveImageFileError::OutputDir(path, e) | SaveImageFileError::Create(path, e) => {
        PipelineError::Storage(path, e)
      }
      e => PipelineError::Render(RenderError::Image(e)),
    }
  }
}

impl From<DocumentError> for PipelineError {
  fn from(e: DocumentError) -> Self {
    match e {
      DocumentError::Create(path, e) => PipelineError::Storage(path, e),
      e => PipelineError::Render(RenderError::Document(e)),
    }
  }
}

impl From<SynthesisError> for PipelineError {
  fn from(e: SynthesisError) -> Self {
    match e {
      SynthesisError::Write(path, e) => PipelineError::Storage(path, e),
      e => PipelineError::Synthesis(e),
    }
  }
}

/// 完整调用的产物，所有文件共享同一个基础标识
#[derive(Debug)]
pub struct ArtifactSet {
  pub id: ArtifactId,
  pub selection: Selection,
  pub detections: Vec<DetectionSummary>,
  pub brief_report: BriefReport,
  pub annotated_image: PathBuf,
  pub document: Option<PathBuf>,
  pub audio: Option<PathBuf>,
  /// 文档中是否嵌入了标注图像
  pub image_embedded: bool,
  /// `BestEffort` 策略下被容忍的失败
  pub failures: Vec<PipelineError>,
}

/// 快速调用只生成标注图像
#[derive(Debug, Clone)]
pub struct QuickResult {
  pub id: ArtifactId,
  pub selection: Selection,
  pub detections: Vec<DetectionSummary>,
  pub brief_report: BriefReport,
  pub annotated_image: PathBuf,
}

/// 限制并发前向推理数量的闸门
struct InferenceGate {
  free: Mutex<usize>,
  released: Condvar,
}

struct InferencePermit<'a> {
  gate: &'a InferenceGate,
}

impl InferenceGate {
  fn new(slots: usize) -> Self {
    Self {
      free: Mutex::new(slots.max(1)),
      released: Condvar::new(),
    }
  }

  fn acquire(&self) -> InferencePermit<'_> {
    let mut free = self.free.lock();
    while *free == 0 {
      self.released.wait(&mut free);
    }
    *free -= 1;
    InferencePermit { gate: self }
  }
}

impl Drop for InferencePermit<'_> {
  fn drop(&mut self) {
    *self.gate.free.lock() += 1;
    self.gate.released.notify_one();
  }
}

/// 调用失败时删除本次已写出的产物
#[derive(Default)]
struct ArtifactGuard {
  paths: Vec<PathBuf>,
  disarmed: bool,
}

impl ArtifactGuard {
  fn track(&mut self, path: &Path) {
    self.paths.push(path.to_path_buf());
  }

  fn disarm(mut self) {
    self.disarmed = true;
  }
}

impl Drop for ArtifactGuard {
  fn drop(&mut self) {
    if self.disarmed {
      return;
    }
    for path in &self.paths {
      remove_artifact(path);
    }
  }
}

fn remove_artifact(path: &Path) {
  match std::fs::remove_file(path) {
    Ok(()) => debug!("已删除未完成的产物: {}", path.display()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => warn!("无法删除产物 {}: {}", path.display(), e),
  }
}

fn invocation_id() -> String {
  format!("{:08x}", rand::random::<u32>())
}

fn log_outcome<T>(result: Result<T, PipelineError>) -> Result<T, PipelineError> {
  if let Err(e) = &result {
    error!(stage = e.stage(), client = e.is_client_error(), "调用失败: {}", e);
  }
  result
}

/// 单图诊断流水线
///
/// 模型与知识库在构造时加载一次，此后只读；`&self` 可在多个线程间共享。
pub struct Pipeline<M, S> {
  model: M,
  preprocessor: ImageFileInput,
  selector: DetectionSelector,
  annotator: Annotator,
  writer: SaveImageFileOutput,
  namer: ArtifactNamer,
  composer: ReportComposer<S>,
  gate: InferenceGate,
  config: PipelineConfig,
}

impl<M, S> Pipeline<M, S>
where
  M: Model<Input = InputTensor, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  S: SpeechSynthesizer,
{
  pub fn new(
    model: M,
    labels: LabelSet,
    knowledge: TreatmentKnowledgeBase,
    synthesizer: S,
    mut config: PipelineConfig,
  ) -> Self {
    if let Some(size) = model.input_size()
      && size != config.input_size
    {
      debug!("使用模型的输入尺寸 {} 代替配置值 {}", size, config.input_size);
      config.input_size = size;
    }

    let selector = DetectionSelector::new(labels)
      .with_thresholds(config.confidence_threshold, config.iou_threshold)
      .with_max_detections(config.max_detections);

    Self {
      model,
      preprocessor: ImageFileInput::new(config.input_size),
      selector,
      annotator: Annotator::default(),
      writer: SaveImageFileOutput::new(config.jpeg_quality),
      namer: ArtifactNamer::new(&config.artifact_prefix),
      composer: ReportComposer::new(knowledge, synthesizer, config.language.clone()),
      gate: InferenceGate::new(config.inference_slots),
      config,
    }
  }

  /// 替换内置的标签字体
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.annotator = Annotator::new(Some(font));
    self
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn composer(&self) -> &ReportComposer<S> {
    &self.composer
  }

  /// 完整流程：标注图像、简报、PDF 与语音
  pub fn process(&self, path: impl AsRef<Path>) -> Result<ArtifactSet, PipelineError> {
    let span = info_span!("process", invocation = %invocation_id());
    let _enter = span.enter();
    log_outcome(self.run_full(path.as_ref()))
  }

  /// 快速流程：只生成标注图像与检测结果
  pub fn process_quick(&self, path: impl AsRef<Path>) -> Result<QuickResult, PipelineError> {
    let span = info_span!("process_quick", invocation = %invocation_id());
    let _enter = span.enter();
    log_outcome(self.run_quick(path.as_ref()))
  }

  /// 暂存上传文件后执行完整流程，暂存文件在返回前删除
  pub fn process_upload(
    &self,
    file_name: &str,
    bytes: &[u8],
  ) -> Result<ArtifactSet, PipelineError> {
    let span = info_span!("process_upload", invocation = %invocation_id(), file = file_name);
    let _enter = span.enter();
    let result = StagedUpload::stage(&self.config.temp_dir, file_name, bytes)
      .map_err(PipelineError::from)
      .and_then(|staged| self.run_full(staged.path()));
    log_outcome(result)
  }

  pub fn process_quick_upload(
    &self,
    file_name: &str,
    bytes: &[u8],
  ) -> Result<QuickResult, PipelineError> {
    let span = info_span!("process_quick_upload", invocation = %invocation_id(), file = file_name);
    let _enter = span.enter();
    let result = StagedUpload::stage(&self.config.temp_dir, file_name, bytes)
      .map_err(PipelineError::from)
      .and_then(|staged| self.run_quick(staged.path()));
    log_outcome(result)
  }

  /// 预处理 → 推理 → 筛选；中间张量在返回前释放
  fn analyze(&self, path: &Path) -> Result<(RawImage, Selection), PipelineError> {
    let now = Instant::now();
    let image = self.preprocessor.read(path)?;
    let tensor = self.preprocessor.to_tensor(&image);
    let letterbox = *tensor.letterbox();
    debug!("预处理完成，耗时: {:.2?}", now.elapsed());

    let now = Instant::now();
    let result = {
      let _permit = self.gate.acquire();
      self
        .model
        .infer(&tensor)
        .map_err(|e| PipelineError::Inference(Box::new(e)))?
    };
    drop(tensor);
    info!("推理完成，耗时: {:.2?}，候选框 {} 个", now.elapsed(), result.len());

    let selection = self.selector.select(&result, &letterbox);
    drop(result);
    info!(
      "诊断结果: {} ({:.2})",
      selection.label(),
      selection.confidence()
    );

    Ok((image, selection))
  }

  fn write_image(
    &self,
    mut image: RawImage,
    selection: &Selection,
    guard: &mut ArtifactGuard,
  ) -> Result<(ArtifactId, PathBuf), PipelineError> {
    let output_dir = &self.config.output_dir;
    std::fs::create_dir_all(output_dir)
      .map_err(|e| PipelineError::Storage(output_dir.clone(), e))?;

    let id = self.namer.next(selection.label());
    let path = id.path_in(output_dir, ArtifactKind::Image);
    guard.track(&path);

    let annotation = self.annotator.annotate(image.pixels_mut(), selection);
    self.writer.save(&image, annotation, &path)?;
    Ok((id, path))
  }

  fn run_quick(&self, path: &Path) -> Result<QuickResult, PipelineError> {
    let (image, selection) = self.analyze(path)?;
    let mut guard = ArtifactGuard::default();
    let (id, annotated_image) = self.write_image(image, &selection, &mut guard)?;

    let brief_report = self.composer.brief(&selection.labels());
    guard.disarm();
    info!("产物生成完成: {}", id);

    Ok(QuickResult {
      id,
      detections: selection.summaries(),
      selection,
      brief_report,
      annotated_image,
    })
  }

  fn run_full(&self, path: &Path) -> Result<ArtifactSet, PipelineError> {
    let (image, selection) = self.analyze(path)?;
    let mut guard = ArtifactGuard::default();
    let (id, annotated_image) = self.write_image(image, &selection, &mut guard)?;

    let labels = selection.labels();
    let brief_report = self.composer.brief(&labels);
    let mut failures = Vec::new();

    let now = Instant::now();
    let document_path = id.path_in(&self.config.output_dir, ArtifactKind::Document);
    guard.track(&document_path);
    let (document, image_embedded) =
      match self
        .composer
        .write_document(&labels, &annotated_image, &document_path)
      {
        Ok(embedded) => (Some(document_path), embedded),
        Err(e) => (self.tolerate(e.into(), &document_path, &mut failures)?, false),
      };
    if document.is_some() && !image_embedded {
      warn!("PDF 中未能嵌入标注图像，已使用占位文字");
    }
    debug!("PDF 阶段耗时: {:.2?}", now.elapsed());

    let now = Instant::now();
    let audio_path = id.path_in(&self.config.output_dir, ArtifactKind::Audio);
    guard.track(&audio_path);
    let audio = match self.composer.write_audio(&labels, &audio_path) {
      Ok(()) => Some(audio_path),
      Err(e) => self.tolerate(e.into(), &audio_path, &mut failures)?,
    };
    debug!("语音阶段耗时: {:.2?}", now.elapsed());

    guard.disarm();
    info!("产物生成完成: {}", id);

    Ok(ArtifactSet {
      id,
      detections: selection.summaries(),
      selection,
      brief_report,
      annotated_image,
      document,
      audio,
      image_embedded,
      failures,
    })
  }

  /// 按策略处理 PDF 或语音的失败
  fn tolerate(
    &self,
    error: PipelineError,
    path: &Path,
    failures: &mut Vec<PipelineError>,
  ) -> Result<Option<PathBuf>, PipelineError> {
    match self.config.policy {
      ArtifactPolicy::Strict => Err(error),
      ArtifactPolicy::BestEffort => {
        warn!(stage = error.stage(), "产物生成失败，继续返回其余产物: {}", error);
        remove_artifact(path);
        failures.push(error);
        Ok(None)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
  };

  use super::*;

  #[test]
  fn policy_parses_from_flags() {
    assert_eq!("strict".parse::<ArtifactPolicy>(), Ok(ArtifactPolicy::Strict));
    assert_eq!(
      "Best-Effort".parse::<ArtifactPolicy>(),
      Ok(ArtifactPolicy::BestEffort)
    );
    assert!("lenient".parse::<ArtifactPolicy>().is_err());
    assert_eq!(ArtifactPolicy::BestEffort.to_string(), "best-effort");
  }

  #[test]
  fn errors_map_to_their_stage() {
    let upload: PipelineError = UploadError::UnsupportedExtension("leaf.gif".into()).into();
    assert_eq!(upload.stage(), "decode");
    assert!(upload.is_client_error());

    let temp: PipelineError = UploadError::TempDir(
      PathBuf::from("temp"),
      std::io::Error::from(std::io::ErrorKind::PermissionDenied),
    )
    .into();
    assert_eq!(temp.stage(), "storage");
    assert!(!temp.is_client_error());

    let synthesis: PipelineError = SynthesisError::Unavailable.into();
    assert_eq!(synthesis.stage(), "synthesis");

    let create: PipelineError = DocumentError::Create(
      PathBuf::from("downloads/x.pdf"),
      std::io::Error::from(std::io::ErrorKind::PermissionDenied),
    )
    .into();
    assert_eq!(create.stage(), "storage");
  }

  #[test]
  fn gate_bounds_concurrent_holders() {
    let gate = Arc::new(InferenceGate::new(2));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
      .map(|_| {
        let (gate, active, peak) = (gate.clone(), active.clone(), peak.clone());
        thread::spawn(move || {
          let _permit = gate.acquire();
          let now = active.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          thread::sleep(Duration::from_millis(20));
          active.fetch_sub(1, Ordering::SeqCst);
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(*gate.free.lock(), 2);
  }

  #[test]
  fn guard_removes_tracked_files_unless_disarmed() {
    let dir = tempfile::tempdir().unwrap();
    let kept = dir.path().join("kept.jpg");
    let removed = dir.path().join("removed.jpg");
    std::fs::write(&kept, b"x").unwrap();
    std::fs::write(&removed, b"x").unwrap();

    let mut guard = ArtifactGuard::default();
    guard.track(&removed);
    guard.track(&dir.path().join("never-written.pdf"));
    drop(guard);
    assert!(!removed.exists());

    let mut guard = ArtifactGuard::default();
    guard.track(&kept);
    guard.disarm();
    assert!(kept.exists());
  }
}
