// 该文件是 Yeban （叶斑） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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
  collections::BTreeSet,
  io::Cursor,
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  time::Duration,
};

use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;
use yeban::{
  ArtifactPolicy, Pipeline, PipelineConfig, PipelineError,
  frame::InputTensor,
  model::{DetectItem, DetectResult, LabelSet, Model},
  output::ArtifactKind,
  report::{
    HEALTHY_BRIEF, IMAGE_PLACEHOLDER, ReportComposer, SpeechSynthesizer, SynthesisError,
    TreatmentKnowledgeBase, speech::HEALTHY_NARRATION,
  },
  selection::{DetectionSummary, Selection},
};

const INPUT_SIZE: u32 = 64;
const RUST_BRIEF: &str = "Spray myclobutanil every 7-10 days.";
const RUST_SUMMARY: &str = "Bright orange spots on the upper leaf surface.";

#[derive(Debug, thiserror::Error)]
#[error("scripted inference failure")]
struct ScriptedFailure;

/// 返回固定候选框的模型，同时统计调用与并发情况
#[derive(Default)]
struct ScriptedModel {
  items: Vec<DetectItem>,
  fail: bool,
  delay: Duration,
  size: Option<u32>,
  calls: AtomicUsize,
  active: AtomicUsize,
  peak: AtomicUsize,
}

impl ScriptedModel {
  fn returning(items: Vec<DetectItem>) -> Self {
    Self {
      items,
      ..Default::default()
    }
  }
}

impl Model for ScriptedModel {
  type Input = InputTensor;
  type Output = DetectResult;
  type Error = ScriptedFailure;

  fn infer(&self, input: &InputTensor) -> Result<DetectResult, ScriptedFailure> {
    let size = self.size.unwrap_or(INPUT_SIZE) as usize;
    assert_eq!(input.shape(), &[1, 3, size, size]);
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    thread::sleep(self.delay);
    self.active.fetch_sub(1, Ordering::SeqCst);

    if self.fail {
      return Err(ScriptedFailure);
    }
    Ok(DetectResult::from(self.items.clone()))
  }

  fn input_size(&self) -> Option<u32> {
    self.size
  }
}

#[derive(Clone, Default)]
struct RecordingSynthesizer {
  calls: Arc<Mutex<Vec<(String, String)>>>,
  fail: bool,
}

impl SpeechSynthesizer for RecordingSynthesizer {
  fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
    self
      .calls
      .lock()
      .unwrap()
      .push((text.to_string(), language.to_string()));
    if self.fail {
      return Err(SynthesisError::Status(503));
    }
    Ok(b"ID3\x03\x00fake-mp3".to_vec())
  }
}

fn rust_at_091() -> Vec<DetectItem> {
  vec![
    DetectItem {
      class_id: 0,
      score: 0.4,
      bbox: [0.0, 16.0, 8.0, 24.0],
    },
    DetectItem {
      class_id: 1,
      score: 0.91,
      bbox: [10.0, 20.0, 40.0, 40.0],
    },
    DetectItem {
      class_id: 1,
      score: 0.6,
      bbox: [11.0, 21.0, 40.0, 40.0],
    },
  ]
}

fn below_threshold() -> Vec<DetectItem> {
  vec![DetectItem {
    class_id: 1,
    score: 0.2,
    bbox: [10.0, 20.0, 40.0, 40.0],
  }]
}

fn knowledge() -> TreatmentKnowledgeBase {
  TreatmentKnowledgeBase::from_json_str(&format!(
    r#"{{"rust": {{
      "title": "Cedar Apple Rust",
      "summary": "{RUST_SUMMARY}",
      "brief": "{RUST_BRIEF}",
      "fungicides": ["Myclobutanil"],
      "steps": ["Remove nearby junipers"]
    }}}}"#
  ))
  .unwrap()
}

fn config(dir: &TempDir) -> PipelineConfig {
  PipelineConfig {
    output_dir: dir.path().join("downloads"),
    temp_dir: dir.path().join("temp"),
    input_size: INPUT_SIZE,
    ..PipelineConfig::default()
  }
}

fn pipeline(
  model: ScriptedModel,
  synthesizer: RecordingSynthesizer,
  config: PipelineConfig,
) -> Pipeline<ScriptedModel, RecordingSynthesizer> {
  let labels = LabelSet::new(["scab", "rust"]).unwrap();
  Pipeline::new(model, labels, knowledge(), synthesizer, config)
}

fn leaf_jpeg() -> Vec<u8> {
  let image = RgbImage::from_fn(128, 64, |x, y| Rgb([(x * 2) as u8, (y * 4) as u8, 80]));
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Jpeg).unwrap();
  buffer.into_inner()
}

fn write_leaf(dir: &TempDir) -> (PathBuf, Vec<u8>) {
  let bytes = leaf_jpeg();
  let path = dir.path().join("leaf.jpg");
  std::fs::write(&path, &bytes).unwrap();
  (path, bytes)
}

fn entries(dir: &Path) -> Vec<String> {
  match std::fs::read_dir(dir) {
    Ok(read) => {
      let mut names: Vec<String> = read
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
      names.sort();
      names
    }
    Err(_) => Vec::new(),
  }
}

fn contains(haystack: &[u8], needle: &str) -> bool {
  haystack
    .windows(needle.len())
    .any(|window| window == needle.as_bytes())
}

#[test]
fn strong_rust_detection_produces_all_artifacts() {
  let dir = tempfile::tempdir().unwrap();
  let (path, input) = write_leaf(&dir);
  let synthesizer = RecordingSynthesizer::default();
  let pipeline = pipeline(
    ScriptedModel::returning(rust_at_091()),
    synthesizer.clone(),
    config(&dir),
  );

  let set = pipeline.process(&path).unwrap();

  assert_eq!(
    set.detections,
    vec![DetectionSummary {
      name: "rust".to_string(),
      confidence: 0.91
    }]
  );
  assert_eq!(set.brief_report.len(), 1);
  assert_eq!(set.brief_report["rust"], RUST_BRIEF);
  assert!(set.failures.is_empty());
  assert!(set.image_embedded);

  // 所有产物共享同一个基础标识
  let id = set.id.as_str();
  assert!(id.starts_with("appleleaf_rust_"));
  let document = set.document.clone().unwrap();
  let audio = set.audio.clone().unwrap();
  for (path, kind) in [
    (&set.annotated_image, ArtifactKind::Image),
    (&document, ArtifactKind::Document),
    (&audio, ArtifactKind::Audio),
  ] {
    assert_eq!(path.file_name().unwrap().to_str().unwrap(), set.id.file_name(kind));
    assert!(path.exists());
  }
  assert_eq!(entries(&dir.path().join("downloads")).len(), 3);

  // 标注后的图像与原图不同，尺寸不变
  let annotated = std::fs::read(&set.annotated_image).unwrap();
  assert_ne!(annotated, input);
  let decoded = image::load_from_memory(&annotated).unwrap().to_rgb8();
  assert_eq!((decoded.width(), decoded.height()), (128, 64));
  // 原图蓝色通道恒为 80，接近白色的像素只能来自标签文字
  assert!(
    decoded
      .pixels()
      .any(|p| p.0.iter().all(|&c| c >= 200))
  );

  let pdf = std::fs::read(&document).unwrap();
  assert!(contains(&pdf, "Disease Detected: Cedar Apple Rust"));
  assert!(contains(&pdf, RUST_SUMMARY));

  let calls = synthesizer.calls.lock().unwrap();
  assert_eq!(calls.len(), 1);
  assert!(calls[0].0.contains(RUST_BRIEF));
  assert!(calls[0].0.starts_with("rust ke liye upaay hai"));
  assert_eq!(calls[0].1, "hi");
}

#[test]
fn selected_box_is_rescaled_into_the_source_image() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let model = ScriptedModel::returning(vec![DetectItem {
    class_id: 1,
    score: 0.8,
    bbox: [-10.0, 10.0, 70.0, 60.0],
  }]);
  let pipeline = pipeline(model, RecordingSynthesizer::default(), config(&dir));

  let result = pipeline.process_quick(&path).unwrap();
  let Selection::Detected(detection) = &result.selection else {
    panic!("expected a detection");
  };
  // 128x64 → 64x64：gain 0.5，上下各填充 16
  assert_eq!(
    (
      detection.bbox.x1,
      detection.bbox.y1,
      detection.bbox.x2,
      detection.bbox.y2
    ),
    (0, 0, 127, 63)
  );
}

#[test]
fn healthy_leaf_is_left_byte_identical() {
  let dir = tempfile::tempdir().unwrap();
  let (path, input) = write_leaf(&dir);
  let synthesizer = RecordingSynthesizer::default();
  let pipeline = pipeline(
    ScriptedModel::returning(below_threshold()),
    synthesizer.clone(),
    config(&dir),
  );

  let set = pipeline.process(&path).unwrap();

  assert_eq!(set.selection, Selection::Healthy);
  assert_eq!(
    set.detections,
    vec![DetectionSummary {
      name: "healthy".to_string(),
      confidence: 1.0
    }]
  );
  assert_eq!(set.brief_report["healthy"], HEALTHY_BRIEF);
  assert_eq!(std::fs::read(&set.annotated_image).unwrap(), input);
  assert!(set.id.as_str().starts_with("appleleaf_healthy_"));

  let calls = synthesizer.calls.lock().unwrap();
  assert_eq!(calls[0].0, HEALTHY_NARRATION);
}

#[test]
fn corrupt_upload_fails_to_decode_and_leaves_nothing_behind() {
  let dir = tempfile::tempdir().unwrap();
  let cfg = config(&dir);
  let (temp_dir, output_dir) = (cfg.temp_dir.clone(), cfg.output_dir.clone());
  let pipeline = pipeline(
    ScriptedModel::returning(rust_at_091()),
    RecordingSynthesizer::default(),
    cfg,
  );

  let err = pipeline
    .process_upload("leaf.jpg", b"this is not a jpeg")
    .unwrap_err();

  assert!(matches!(err, PipelineError::Decode(_)));
  assert!(err.is_client_error());
  assert_eq!(err.stage(), "decode");
  assert!(entries(&temp_dir).is_empty());
  assert!(entries(&output_dir).is_empty());
}

#[test]
fn unsupported_extension_is_rejected_before_staging() {
  let dir = tempfile::tempdir().unwrap();
  let cfg = config(&dir);
  let temp_dir = cfg.temp_dir.clone();
  let pipeline = pipeline(
    ScriptedModel::returning(rust_at_091()),
    RecordingSynthesizer::default(),
    cfg,
  );

  let err = pipeline
    .process_quick_upload("leaf.gif", &leaf_jpeg())
    .unwrap_err();
  assert!(err.is_client_error());
  assert!(!temp_dir.exists());
}

#[test]
fn staged_upload_is_removed_after_success() {
  let dir = tempfile::tempdir().unwrap();
  let cfg = config(&dir);
  let temp_dir = cfg.temp_dir.clone();
  let pipeline = pipeline(
    ScriptedModel::returning(rust_at_091()),
    RecordingSynthesizer::default(),
    cfg,
  );

  let result = pipeline.process_quick_upload("Leaf.JPG", &leaf_jpeg()).unwrap();
  assert!(result.annotated_image.exists());
  assert!(temp_dir.exists());
  assert!(entries(&temp_dir).is_empty());
}

#[test]
fn inference_failure_is_a_server_error_without_artifacts() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let cfg = config(&dir);
  let output_dir = cfg.output_dir.clone();
  let model = ScriptedModel {
    fail: true,
    ..Default::default()
  };
  let pipeline = pipeline(model, RecordingSynthesizer::default(), cfg);

  let err = pipeline.process(&path).unwrap_err();
  assert!(matches!(err, PipelineError::Inference(_)));
  assert!(!err.is_client_error());
  assert!(entries(&output_dir).is_empty());
}

#[test]
fn strict_policy_removes_partial_artifacts_when_synthesis_fails() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let cfg = config(&dir);
  let output_dir = cfg.output_dir.clone();
  let synthesizer = RecordingSynthesizer {
    fail: true,
    ..Default::default()
  };
  let pipeline = pipeline(ScriptedModel::returning(rust_at_091()), synthesizer, cfg);

  let err = pipeline.process(&path).unwrap_err();
  assert!(matches!(err, PipelineError::Synthesis(SynthesisError::Status(503))));
  assert_eq!(err.stage(), "synthesis");
  assert!(entries(&output_dir).is_empty());
}

#[test]
fn best_effort_policy_keeps_image_and_document() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let cfg = PipelineConfig {
    policy: ArtifactPolicy::BestEffort,
    ..config(&dir)
  };
  let output_dir = cfg.output_dir.clone();
  let synthesizer = RecordingSynthesizer {
    fail: true,
    ..Default::default()
  };
  let pipeline = pipeline(ScriptedModel::returning(rust_at_091()), synthesizer, cfg);

  let set = pipeline.process(&path).unwrap();
  assert!(set.audio.is_none());
  assert!(set.document.is_some());
  assert_eq!(set.failures.len(), 1);
  assert_eq!(set.failures[0].stage(), "synthesis");

  let names = entries(&output_dir);
  assert_eq!(
    names,
    vec![
      set.id.file_name(ArtifactKind::Image),
      set.id.file_name(ArtifactKind::Document),
    ]
  );
}

#[test]
fn repeated_runs_agree_but_get_fresh_identifiers() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let pipeline = pipeline(
    ScriptedModel::returning(rust_at_091()),
    RecordingSynthesizer::default(),
    config(&dir),
  );

  let first = pipeline.process_quick(&path).unwrap();
  let second = pipeline.process_quick(&path).unwrap();

  assert_eq!(first.selection, second.selection);
  assert_eq!(first.detections, second.detections);
  assert_ne!(first.id, second.id);
  assert!(first.annotated_image.exists());
  assert!(second.annotated_image.exists());
}

#[test]
fn concurrent_calls_are_serialised_through_one_inference_slot() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let model = ScriptedModel {
    items: rust_at_091(),
    delay: Duration::from_millis(30),
    ..Default::default()
  };
  let pipeline = pipeline(model, RecordingSynthesizer::default(), config(&dir));

  let ids: BTreeSet<String> = thread::scope(|scope| {
    let handles: Vec<_> = (0..4)
      .map(|_| scope.spawn(|| pipeline.process_quick(&path).unwrap()))
      .collect();
    handles
      .into_iter()
      .map(|h| h.join().unwrap().id.to_string())
      .collect()
  });

  assert_eq!(ids.len(), 4);
  assert_eq!(entries(&dir.path().join("downloads")).len(), 4);
}

#[test]
fn inference_slots_bound_parallel_forward_passes() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let model = Arc::new(ScriptedModel {
    items: rust_at_091(),
    delay: Duration::from_millis(30),
    ..Default::default()
  });

  struct Shared(Arc<ScriptedModel>);
  impl Model for Shared {
    type Input = InputTensor;
    type Output = DetectResult;
    type Error = ScriptedFailure;
    fn infer(&self, input: &InputTensor) -> Result<DetectResult, ScriptedFailure> {
      self.0.infer(input)
    }
  }

  let labels = LabelSet::new(["scab", "rust"]).unwrap();
  let pipeline = Pipeline::new(
    Shared(model.clone()),
    labels,
    knowledge(),
    RecordingSynthesizer::default(),
    PipelineConfig {
      inference_slots: 2,
      ..config(&dir)
    },
  );

  thread::scope(|scope| {
    for _ in 0..6 {
      scope.spawn(|| pipeline.process_quick(&path).unwrap());
    }
  });

  assert_eq!(model.calls.load(Ordering::SeqCst), 6);
  assert!(model.peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn document_falls_back_to_placeholder_when_image_is_missing() {
  let dir = tempfile::tempdir().unwrap();
  let composer = ReportComposer::new(knowledge(), RecordingSynthesizer::default(), "hi");
  let labels: BTreeSet<String> = ["rust".to_string()].into();
  let out = dir.path().join("report.pdf");

  let embedded = composer
    .write_document(&labels, &dir.path().join("missing.jpg"), &out)
    .unwrap();

  assert!(!embedded);
  let pdf = std::fs::read(&out).unwrap();
  assert!(contains(&pdf, IMAGE_PLACEHOLDER));
  assert!(contains(&pdf, RUST_SUMMARY));
}

#[test]
fn model_input_size_takes_precedence_over_config() {
  let dir = tempfile::tempdir().unwrap();
  let (path, _) = write_leaf(&dir);
  let model = ScriptedModel {
    items: vec![DetectItem {
      class_id: 1,
      score: 0.9,
      bbox: [4.0, 10.0, 20.0, 20.0],
    }],
    size: Some(32),
    ..Default::default()
  };
  let cfg = PipelineConfig {
    input_size: 640,
    ..config(&dir)
  };
  let pipeline = pipeline(model, RecordingSynthesizer::default(), cfg);
  assert_eq!(pipeline.config().input_size, 32);

  let result = pipeline.process_quick(&path).unwrap();
  let Selection::Detected(detection) = &result.selection else {
    panic!("expected a detection");
  };
  // 128x64 → 32x32：gain 0.25，上下各填充 8
  assert_eq!(
    (
      detection.bbox.x1,
      detection.bbox.y1,
      detection.bbox.x2,
      detection.bbox.y2
    ),
    (16, 8, 80, 48)
  );
}
