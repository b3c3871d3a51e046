// 该文件是 Yeban （叶斑） 项目的一部分。
// src/model/yolo.rs - YOLO 病斑检测模型
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

use std::{collections::HashMap, path::PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};
use tract_onnx::prelude::{
  DatumExt, Framework, Graph, InferenceModelExt, SimplePlan, TractError, TypedFact, TypedOp, tvec,
};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{InputTensor, RGB_CHANNELS},
  model::{DetectItem, DetectResult, LabelError, LabelSet, Model},
};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("标签错误: {0}")]
  LabelError(#[from] LabelError),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, TractError),
  #[error("推理失败: {0}")]
  InferenceFailed(TractError),
  #[error("输入形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  InputShapeMismatch {
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("输出形状 {shape:?} 与 {classes} 个类别不匹配")]
  OutputShapeMismatch { shape: Vec<usize>, classes: usize },
}

impl YoloError {
  fn invalid(msg: &str, e: TractError) -> Self {
    YoloError::ModelInvalid(msg.to_string(), e)
  }
}

/// 检测头输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
  /// `[1, N, 5 + C]`：cx, cy, w, h, objectness, 各类别分数
  Anchored,
  /// `[1, 4 + C, N]`：cx, cy, w, h, 各类别分数（无 objectness）
  AnchorFree,
  /// `[1, N, 4 + C]`：转置后的无 objectness 布局
  AnchorFreeRows,
}

impl OutputLayout {
  pub fn detect(shape: &[usize], classes: usize) -> Option<(Self, usize)> {
    match *shape {
      [1, n, cols] if cols == 5 + classes => Some((OutputLayout::Anchored, n)),
      [1, rows, n] if rows == 4 + classes => Some((OutputLayout::AnchorFree, n)),
      [1, n, cols] if cols == 4 + classes => Some((OutputLayout::AnchorFreeRows, n)),
      _ => None,
    }
  }
}

pub struct YoloBuilder {
  model_path: PathBuf,
  labels_path: PathBuf,
  input_size: u32,
}

impl FromUrlWithScheme for YoloBuilder {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloBuilder {
  type Error = YoloError;

  /// `yolo:///models/apple_leaf.onnx?labels=/models/labels.txt&size=640`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let model_path = urlencoding::decode(url.path())
      .map_err(|e| YoloError::ModelPathError(format!("模型路径编码错误: {e}")))?
      .into_owned();

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let labels_path = query
      .get("labels")
      .ok_or_else(|| YoloError::ModelPathError("缺少 labels 参数".to_string()))?;

    let input_size = match query.get("size") {
      Some(size) => size
        .parse()
        .map_err(|_| YoloError::ModelPathError(format!("无效的输入尺寸: {size}")))?,
      None => YOLO_DEFAULT_INPUT_SIZE,
    };

    Ok(YoloBuilder {
      model_path: PathBuf::from(model_path),
      labels_path: PathBuf::from(labels_path),
      input_size,
    })
  }
}

impl YoloBuilder {
  pub fn new(model_path: impl Into<PathBuf>, labels_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: labels_path.into(),
      input_size: YOLO_DEFAULT_INPUT_SIZE,
    }
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn build(self) -> Result<Yolo, YoloError> {
    if !self.model_path.is_file() {
      return Err(YoloError::ModelPathError(format!(
        "模型文件不存在: {}",
        self.model_path.display()
      )));
    }
    if self.input_size == 0 {
      return Err(YoloError::ModelPathError("输入尺寸必须大于 0".to_string()));
    }

    let labels = LabelSet::from_file(&self.labels_path)?;
    debug!("加载 {} 个类别标签", labels.len());

    info!("加载模型文件: {}", self.model_path.display());
    let size = self.input_size as usize;
    let runnable = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .map_err(|e| YoloError::invalid("无法解析 ONNX 模型", e))?
      .with_input_fact(0, f32::fact([1, RGB_CHANNELS, size, size]).into())
      .map_err(|e| YoloError::invalid("无法设置输入形状", e))?
      .into_optimized()
      .map_err(|e| YoloError::invalid("无法优化模型", e))?
      .into_runnable()
      .map_err(|e| YoloError::invalid("无法生成可执行模型", e))?;
    info!("模型加载完成 ({}x{})", size, size);

    Ok(Yolo {
      runnable,
      labels,
      input_size: self.input_size,
    })
  }
}

/// 已加载的 YOLO 检测模型，推理只读且可并发调用
pub struct Yolo {
  runnable: RunnableModel,
  labels: LabelSet,
  input_size: u32,
}

impl Yolo {
  pub fn labels(&self) -> &LabelSet {
    &self.labels
  }
}

impl Model for Yolo {
  type Input = InputTensor;
  type Output = DetectResult;
  type Error = YoloError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let size = self.input_size as usize;
    let expected = [1, RGB_CHANNELS, size, size];
    if input.shape() != expected {
      return Err(YoloError::InputShapeMismatch {
        expected: expected.to_vec(),
        actual: input.shape().to_vec(),
      });
    }

    debug!("执行模型推理");
    let outputs = self
      .runnable
      .run(tvec![input.to_tensor().into()])
      .map_err(YoloError::InferenceFailed)?;

    let output = outputs.first().ok_or_else(|| YoloError::OutputShapeMismatch {
      shape: Vec::new(),
      classes: self.labels.len(),
    })?;
    let data = output
      .as_slice::<f32>()
      .map_err(YoloError::InferenceFailed)?;

    let items = decode_output(output.shape(), data, self.labels.len())?;
    debug!("解码得到 {} 个候选框", items.len());

    Ok(items.into())
  }

  fn input_size(&self) -> Option<u32> {
    Some(self.input_size)
  }
}

/// 将检测头输出解码为推理分辨率下的 xyxy 候选框
pub fn decode_output(
  shape: &[usize],
  data: &[f32],
  classes: usize,
) -> Result<Vec<DetectItem>, YoloError> {
  let mismatch = || YoloError::OutputShapeMismatch {
    shape: shape.to_vec(),
    classes,
  };

  let Some((layout, n)) = OutputLayout::detect(shape, classes) else {
    error!("无法识别的输出形状 {:?} (类别数 {})", shape, classes);
    return Err(mismatch());
  };
  if data.len() != shape.iter().product::<usize>() {
    return Err(mismatch());
  }

  let stride = match layout {
    OutputLayout::Anchored => 5 + classes,
    OutputLayout::AnchorFree => 1,
    OutputLayout::AnchorFreeRows => 4 + classes,
  };
  // 第 i 个候选的第 k 个字段
  let at = |i: usize, k: usize| match layout {
    OutputLayout::AnchorFree => data[k * n + i],
    _ => data[i * stride + k],
  };
  let class_offset = match layout {
    OutputLayout::Anchored => 5,
    _ => 4,
  };

  let mut items = Vec::with_capacity(n);
  for i in 0..n {
    let (mut best, mut class_id) = (f32::MIN, 0u32);
    for c in 0..classes {
      let score = at(i, class_offset + c);
      if score > best {
        best = score;
        class_id = c as u32;
      }
    }

    let score = match layout {
      OutputLayout::Anchored => at(i, 4) * best,
      _ => best,
    };
    let score = if score.is_finite() {
      score.clamp(0.0, 1.0)
    } else {
      0.0
    };

    let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
    items.push(DetectItem {
      class_id,
      score,
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
    });
  }

  Ok(items)
}
