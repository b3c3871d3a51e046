// 该文件是 Yeban （叶斑） 项目的一部分。
// src/bin/yeban.rs - 命令行入口
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

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use url::Url;

use yeban::{
  ArtifactPolicy, FromUrl, Pipeline, PipelineConfig,
  model::YoloBuilder,
  output::Annotator,
  report::{SpeechSynthesizer, TreatmentKnowledgeBase},
  response::{ErrorResponse, PredictResponse, ReportResponse},
};

/// Yeban 苹果叶片病害诊断
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型地址，例如 yolo:///models/leaf.onnx?labels=/models/labels.txt&size=640
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 防治知识库 JSON 文件
  #[arg(long, value_name = "FILE", default_value = "assets/treatments.json")]
  pub treatments: PathBuf,
  /// 标签字体文件（TTF/OTF），不指定时使用内置字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 产物输出目录
  #[arg(long, value_name = "DIR", default_value = "downloads")]
  pub output_dir: PathBuf,
  /// 上传文件暂存目录
  #[arg(long, value_name = "DIR", default_value = "temp")]
  pub temp_dir: PathBuf,
  /// 语音播报语言
  #[arg(long, default_value = "hi")]
  pub language: String,
  /// PDF 或语音失败时的处理方式：strict 或 best-effort
  #[arg(long, default_value = "strict")]
  pub policy: ArtifactPolicy,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
  pub confidence: f32,
  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  pub nms_threshold: f32,
  /// 同时进行的推理数量上限
  #[arg(long, default_value_t = 1)]
  pub inference_slots: usize,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 生成标注图像、简报、PDF 与语音
  Report {
    /// 叶片图像（.jpg/.jpeg/.png）
    image: PathBuf,
  },
  /// 只生成标注图像与检测结果
  Quick {
    /// 叶片图像（.jpg/.jpeg/.png）
    image: PathBuf,
  },
}

#[cfg(feature = "google_tts")]
fn synthesizer() -> Result<Box<dyn SpeechSynthesizer + Send + Sync>> {
  Ok(Box::new(yeban::report::speech::GoogleTranslateTts::new()?))
}

#[cfg(not(feature = "google_tts"))]
fn synthesizer() -> Result<Box<dyn SpeechSynthesizer + Send + Sync>> {
  tracing::warn!("未启用在线语音合成，语音产物将无法生成");
  Ok(Box::new(yeban::report::UnavailableSynthesizer))
}

fn read_upload(path: &Path) -> Result<(String, Vec<u8>)> {
  let name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .with_context(|| format!("无效的图像路径: {}", path.display()))?;
  let bytes = std::fs::read(path).with_context(|| format!("无法读取图像: {}", path.display()))?;
  Ok((name, bytes))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("知识库: {}", args.treatments.display());
  info!("输出目录: {}", args.output_dir.display());
  info!("产物策略: {}", args.policy);

  let model = YoloBuilder::from_url(&args.model)?.build()?;
  let labels = model.labels().clone();
  let knowledge = TreatmentKnowledgeBase::load(&args.treatments)?;

  let config = PipelineConfig {
    output_dir: args.output_dir,
    temp_dir: args.temp_dir,
    confidence_threshold: args.confidence,
    iou_threshold: args.nms_threshold,
    language: args.language,
    policy: args.policy,
    inference_slots: args.inference_slots,
    ..PipelineConfig::default()
  };

  let mut pipeline = Pipeline::new(model, labels, knowledge, synthesizer()?, config);
  if let Some(font) = &args.font {
    pipeline = pipeline.with_font(Annotator::load_font(font)?);
  }

  match &args.command {
    Command::Report { image } => {
      let (name, bytes) = read_upload(image)?;
      match pipeline.process_upload(&name, &bytes) {
        Ok(set) => println!("{}", serde_json::to_string_pretty(&ReportResponse::from(&set))?),
        Err(e) => {
          println!("{}", serde_json::to_string_pretty(&ErrorResponse::for_report(&e))?);
          return Err(e.into());
        }
      }
    }
    Command::Quick { image } => {
      let (name, bytes) = read_upload(image)?;
      match pipeline.process_quick_upload(&name, &bytes) {
        Ok(result) => println!(
          "{}",
          serde_json::to_string_pretty(&PredictResponse::from(&result))?
        ),
        Err(e) => {
          println!("{}", serde_json::to_string_pretty(&ErrorResponse::for_predict(&e))?);
          return Err(e.into());
        }
      }
    }
  }

  Ok(())
}
