// 该文件是 Yeban （叶斑） 项目的一部分。
// src/report/document.rs - PDF 诊断报告
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
  path::{Path, PathBuf},
};

use image::{ColorType, ImageFormat, codecs::jpeg::JpegEncoder};
use lopdf::{
  Dictionary, Document, Object, Stream,
  content::{Content, Operation},
  dictionary,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::report::knowledge::{TreatmentKnowledgeBase, TreatmentRecord};

pub const DOCUMENT_TITLE: &str = "Apple Leaf Disease Diagnosis Report";
pub const NO_SUMMARY: &str = "No summary available.";
pub const IMAGE_PLACEHOLDER: &str = "Image could not be added.";

// A4，单位为 pt
const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MM: f32 = 72.0 / 25.4;
const MARGIN: f32 = 10.0 * MM;
const CELL: f32 = 8.0 * MM;
const TALL_CELL: f32 = 10.0 * MM;
const IMAGE_X: f32 = 30.0 * MM;
const IMAGE_WIDTH: f32 = 140.0 * MM;
const EMBED_JPEG_QUALITY: u8 = 95;

// Helvetica 字宽（1/1000 em），ASCII 32..=126
const HELVETICA_WIDTHS: [u16; 95] = [
  278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, 556, 556, 556,
  556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, 1015, 667, 667, 722, 722, 667,
  611, 778, 722, 278, 500, 667, 556, 833, 722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667,
  667, 611, 278, 278, 278, 469, 556, 333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500,
  222, 833, 556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,
];
const DEFAULT_GLYPH_WIDTH: u16 = 556;
const BOLD_WIDTH_FACTOR: f32 = 1.06;

#[derive(Error, Debug)]
pub enum DocumentError {
  #[error("PDF 生成失败: {0}")]
  Pdf(#[from] lopdf::Error),
  #[error("无法创建文件 {0}: {1}")]
  Create(PathBuf, std::io::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 生成结果，`image_embedded` 为假时文档中是占位文字
#[derive(Debug, Clone)]
pub struct RenderedDocument {
  pub bytes: Vec<u8>,
  pub image_embedded: bool,
}

#[derive(Debug, Clone, Copy)]
enum Font {
  Regular,
  Bold,
}

impl Font {
  fn resource(self) -> &'static str {
    match self {
      Font::Regular => "F1",
      Font::Bold => "F2",
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum Align {
  Left,
  Center,
}

/// 渲染器只支持单字节 WinAnsi 编码，无法表示的字符替换为 `?`
pub fn sanitize(text: &str) -> Vec<u8> {
  text
    .chars()
    .map(|c| match c as u32 {
      0x0A => b'\n',
      0x00..=0x1F => b' ',
      0x20..=0x7E | 0xA0..=0xFF => c as u8,
      _ => b'?',
    })
    .collect()
}

fn text_width(font: Font, size: f32, text: &[u8]) -> f32 {
  let units: u32 = text
    .iter()
    .map(|&b| {
      u32::from(match b {
        0x20..=0x7E => HELVETICA_WIDTHS[(b - 0x20) as usize],
        _ => DEFAULT_GLYPH_WIDTH,
      })
    })
    .sum();
  let factor = match font {
    Font::Regular => 1.0,
    Font::Bold => BOLD_WIDTH_FACTOR,
  };
  units as f32 * size / 1000.0 * factor
}

/// 按单词折行，超长单词按字符截断
fn wrap(font: Font, size: f32, text: &[u8], max_width: f32) -> Vec<Vec<u8>> {
  let space = text_width(font, size, b" ");
  let mut lines = Vec::new();

  for paragraph in text.split(|b| *b == b'\n') {
    let mut line: Vec<u8> = Vec::new();
    for mut word in paragraph.split(|b| *b == b' ').filter(|w| !w.is_empty()) {
      if !line.is_empty()
        && text_width(font, size, &line) + space + text_width(font, size, word) > max_width
      {
        lines.push(std::mem::take(&mut line));
      }
      while line.is_empty() && word.len() > 1 && text_width(font, size, word) > max_width {
        let mut fit = 1;
        while fit < word.len() && text_width(font, size, &word[..fit + 1]) <= max_width {
          fit += 1;
        }
        lines.push(word[..fit].to_vec());
        word = &word[fit..];
      }
      if !line.is_empty() {
        line.push(b' ');
      }
      line.extend_from_slice(word);
    }
    lines.push(line);
  }

  lines
}

/// 单词首字母大写，其余字母小写
fn title_case(label: &str) -> String {
  let mut previous_is_alpha = false;
  label
    .chars()
    .map(|c| {
      let mapped: String = if previous_is_alpha {
        c.to_lowercase().collect()
      } else {
        c.to_uppercase().collect()
      };
      previous_is_alpha = c.is_alphabetic();
      mapped
    })
    .collect()
}

struct EmbeddedImage {
  data: Vec<u8>,
  width: u32,
  height: u32,
  color_space: &'static str,
}

/// RGB 或灰度 JPEG 直接嵌入，其余格式重新编码为 RGB JPEG
fn load_image(path: &Path) -> Result<EmbeddedImage, image::ImageError> {
  let data = std::fs::read(path)?;
  let format = image::guess_format(&data)?;
  let decoded = image::load_from_memory_with_format(&data, format)?;
  let (width, height) = (decoded.width(), decoded.height());

  match (format, decoded.color()) {
    (ImageFormat::Jpeg, ColorType::Rgb8) => Ok(EmbeddedImage {
      data,
      width,
      height,
      color_space: "DeviceRGB",
    }),
    (ImageFormat::Jpeg, ColorType::L8) => Ok(EmbeddedImage {
      data,
      width,
      height,
      color_space: "DeviceGray",
    }),
    _ => {
      let mut encoded = Vec::new();
      JpegEncoder::new_with_quality(&mut encoded, EMBED_JPEG_QUALITY)
        .encode_image(&decoded.to_rgb8())?;
      Ok(EmbeddedImage {
        data: encoded,
        width,
        height,
        color_space: "DeviceRGB",
      })
    }
  }
}

/// 自上而下排版，内容超出页面时自动换页
struct Layout {
  finished: Vec<Vec<Operation>>,
  current: Vec<Operation>,
  y: f32,
}

impl Layout {
  fn new() -> Self {
    Self {
      finished: Vec::new(),
      current: Vec::new(),
      y: MARGIN,
    }
  }

  fn reserve(&mut self, height: f32) {
    if self.y + height > PAGE_HEIGHT - MARGIN && self.y > MARGIN {
      self.finished.push(std::mem::take(&mut self.current));
      self.y = MARGIN;
    }
  }

  fn gap(&mut self, height: f32) {
    self.y += height;
  }

  fn line(&mut self, font: Font, size: f32, text: &[u8], align: Align, height: f32) {
    self.reserve(height);
    let x = match align {
      Align::Left => MARGIN,
      Align::Center => ((PAGE_WIDTH - text_width(font, size, text)) / 2.0).max(MARGIN),
    };
    let baseline = PAGE_HEIGHT - self.y - (height + size * 0.7) / 2.0;

    self.current.extend([
      Operation::new("BT", vec![]),
      Operation::new("Tf", vec![font.resource().into(), size.into()]),
      Operation::new("Td", vec![x.into(), baseline.into()]),
      Operation::new("Tj", vec![Object::string_literal(text.to_vec())]),
      Operation::new("ET", vec![]),
    ]);
    self.y += height;
  }

  fn paragraph(&mut self, font: Font, size: f32, text: &str, height: f32) {
    for line in wrap(font, size, &sanitize(text), PAGE_WIDTH - 2.0 * MARGIN) {
      self.line(font, size, &line, Align::Left, height);
    }
  }

  /// 在距页面顶部 `y` 处画一条横线
  fn rule(&mut self, y: f32) {
    let y = PAGE_HEIGHT - y;
    self.current.extend([
      Operation::new("w", vec![0.5_f32.into()]),
      Operation::new("m", vec![MARGIN.into(), y.into()]),
      Operation::new("l", vec![(PAGE_WIDTH - MARGIN).into(), y.into()]),
      Operation::new("S", vec![]),
    ]);
  }

  fn image(&mut self, name: &str, width: u32, height: u32) {
    let mut w = IMAGE_WIDTH;
    let mut h = w * height as f32 / width.max(1) as f32;
    let max_h = PAGE_HEIGHT - 2.0 * MARGIN;
    if h > max_h {
      w *= max_h / h;
      h = max_h;
    }
    self.reserve(h);

    let bottom = PAGE_HEIGHT - self.y - h;
    self.current.extend([
      Operation::new("q", vec![]),
      Operation::new(
        "cm",
        vec![
          w.into(),
          0_i64.into(),
          0_i64.into(),
          h.into(),
          IMAGE_X.into(),
          bottom.into(),
        ],
      ),
      Operation::new("Do", vec![name.into()]),
      Operation::new("Q", vec![]),
    ]);
    self.y += h;
  }

  fn finish(mut self) -> Vec<Vec<Operation>> {
    self.finished.push(self.current);
    self.finished
  }
}

/// 诊断报告渲染器
#[derive(Debug, Clone)]
pub struct DocumentRenderer {
  title: String,
}

impl Default for DocumentRenderer {
  fn default() -> Self {
    Self {
      title: DOCUMENT_TITLE.to_string(),
    }
  }
}

impl DocumentRenderer {
  pub fn render(
    &self,
    labels: &BTreeSet<String>,
    knowledge: &TreatmentKnowledgeBase,
    image_path: &Path,
  ) -> Result<RenderedDocument, DocumentError> {
    let mut layout = Layout::new();

    layout.line(Font::Bold, 16.0, &sanitize(&self.title), Align::Center, TALL_CELL);
    layout.rule(25.0 * MM);
    layout.gap(TALL_CELL);

    for label in labels {
      write_section(&mut layout, label, knowledge.get(label));
    }

    layout.line(Font::Bold, 12.0, b"Annotated Image:", Align::Left, CELL);
    let image = match load_image(image_path) {
      Ok(image) => {
        layout.image("Im1", image.width, image.height);
        Some(image)
      }
      Err(e) => {
        warn!("无法嵌入图像 {}: {}", image_path.display(), e);
        layout.line(
          Font::Regular,
          12.0,
          IMAGE_PLACEHOLDER.as_bytes(),
          Align::Left,
          TALL_CELL,
        );
        None
      }
    };
    let image_embedded = image.is_some();

    let bytes = self.assemble(layout.finish(), image)?;
    debug!("PDF 生成完成: {} 字节", bytes.len());
    Ok(RenderedDocument {
      bytes,
      image_embedded,
    })
  }

  /// 生成并写入文件，返回图像是否成功嵌入
  pub fn save(
    &self,
    labels: &BTreeSet<String>,
    knowledge: &TreatmentKnowledgeBase,
    image_path: &Path,
    path: &Path,
  ) -> Result<bool, DocumentError> {
    let document = self.render(labels, knowledge, image_path)?;
    std::fs::write(path, &document.bytes)
      .map_err(|e| DocumentError::Create(path.to_path_buf(), e))?;
    info!("保存报告到文件: {}", path.display());
    Ok(document.image_embedded)
  }

  fn assemble(
    &self,
    pages: Vec<Vec<Operation>>,
    image: Option<EmbeddedImage>,
  ) -> Result<Vec<u8>, DocumentError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let regular = doc.add_object(dictionary! {
      "Type" => "Font",
      "Subtype" => "Type1",
      "BaseFont" => "Helvetica",
      "Encoding" => "WinAnsiEncoding",
    });
    let bold = doc.add_object(dictionary! {
      "Type" => "Font",
      "Subtype" => "Type1",
      "BaseFont" => "Helvetica-Bold",
      "Encoding" => "WinAnsiEncoding",
    });

    let mut xobjects = Dictionary::new();
    if let Some(image) = image {
      let stream = Stream::new(
        dictionary! {
          "Type" => "XObject",
          "Subtype" => "Image",
          "Width" => image.width as i64,
          "Height" => image.height as i64,
          "ColorSpace" => image.color_space,
          "BitsPerComponent" => 8_i64,
          "Filter" => "DCTDecode",
        },
        image.data,
      )
      .with_compression(false);
      xobjects.set("Im1", doc.add_object(stream));
    }

    let resources = doc.add_object(dictionary! {
      "Font" => dictionary! {
        Font::Regular.resource() => regular,
        Font::Bold.resource() => bold,
      },
      "XObject" => xobjects,
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for operations in pages {
      let content = Content { operations }.encode()?;
      let content_id = doc.add_object(Stream::new(dictionary! {}, content));
      let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
      });
      kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
      pages_id,
      Object::Dictionary(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => count,
        "Resources" => resources,
        "MediaBox" => vec![0_i64.into(), 0_i64.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
      }),
    );

    let catalog = doc.add_object(dictionary! {
      "Type" => "Catalog",
      "Pages" => pages_id,
    });
    let info = doc.add_object(dictionary! {
      "Title" => Object::string_literal(sanitize(&self.title)),
      "Producer" => Object::string_literal("yeban"),
      "CreationDate" => Object::string_literal(
        chrono::Utc::now().format("D:%Y%m%d%H%M%SZ").to_string()
      ),
    });
    doc.trailer.set("Root", catalog);
    doc.trailer.set("Info", info);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)?;
    Ok(bytes)
  }
}

fn write_section(layout: &mut Layout, label: &str, record: Option<&TreatmentRecord>) {
  let title = record.map_or_else(|| title_case(label), |r| r.title.clone());
  layout.line(
    Font::Bold,
    14.0,
    &sanitize(&format!("Disease Detected: {title}")),
    Align::Left,
    TALL_CELL,
  );

  let summary = record.map_or(NO_SUMMARY, |r| r.summary.as_str());
  layout.paragraph(Font::Regular, 12.0, summary, CELL);
  layout.gap(2.0 * MM);

  let Some(record) = record else {
    return;
  };

  if let Some(fungicides) = record.fungicides.as_ref().filter(|f| !f.is_empty()) {
    layout.line(Font::Bold, 12.0, b"Recommended Fungicides:", Align::Left, CELL);
    for item in fungicides {
      layout.paragraph(Font::Regular, 12.0, &format!("- {item}"), CELL);
    }
    layout.gap(2.0 * MM);
  }

  if let Some(steps) = record.steps.as_ref().filter(|s| !s.is_empty()) {
    layout.line(Font::Bold, 12.0, b"Treatment Steps:", Align::Left, CELL);
    for step in steps {
      layout.paragraph(Font::Regular, 12.0, &format!("-> {step}"), CELL);
    }
    layout.gap(2.0 * MM);
  }

  if let Some(prevention) = &record.prevention {
    layout.line(Font::Bold, 12.0, b"Prevention Tips:", Align::Left, CELL);
    layout.paragraph(Font::Regular, 12.0, prevention, CELL);
    layout.gap(4.0 * MM);
  }
}
