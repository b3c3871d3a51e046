// 该文件是 Yeban （叶斑） 项目的一部分。
// src/output/draw.rs - 诊断结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::selection::{PixelBox, SelectedDetection, Selection};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: u32 = 16;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_PADDING: u32 = 8;
const LABEL_GAP: i32 = 12;
const BOX_THICKNESS: u32 = 3;
const ACCENT_COLOR: [u8; 3] = [100, 255, 0]; // 黄绿色
const TEXT_FILL: [u8; 3] = [255, 255, 255];
const TEXT_OUTLINE: [u8; 3] = [0, 0, 0];

// 内置标签字体 DejaVu Sans Bold，许可见 assets/font.LICENSE
const DEFAULT_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

#[derive(Error, Debug)]
pub enum FontError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  Invalid(#[from] ab_glyph::InvalidFont),
}

/// 绘制是否真正修改了图像
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Annotation {
  Drawn,
  Untouched,
}

/// 标签背景矩形与文字位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelGeometry {
  pub x: i32,
  pub y: i32,
  pub width: u32,
  pub height: u32,
  pub text_x: i32,
  pub text_y: i32,
}

/// 标签放在框上方；放不下时贴住图像顶部，宽高裁剪到图像内
pub fn label_geometry(
  bbox: &PixelBox,
  text_width: u32,
  text_height: u32,
  image_width: u32,
  image_height: u32,
) -> LabelGeometry {
  let x = bbox.x1 as i32;
  let y = (bbox.y1 as i32 - text_height as i32 - LABEL_GAP).max(0);

  let width = (text_width + LABEL_PADDING).min(image_width.saturating_sub(x as u32));
  let height = (text_height + LABEL_PADDING).min(image_height.saturating_sub(y as u32));

  LabelGeometry {
    x,
    y,
    width,
    height,
    text_x: x + (LABEL_PADDING / 2) as i32,
    text_y: y + (LABEL_PADDING / 2) as i32,
  }
}

pub struct Annotator {
  font: Option<FontArc>,
  font_size: f32,
  label_char_width: f32,
  label_text_height: u32,
  color: [u8; 3],
}

/// 加载内置字体
pub fn default_font() -> Result<FontArc, FontError> {
  Ok(FontArc::try_from_slice(DEFAULT_FONT)?)
}

impl Default for Annotator {
  fn default() -> Self {
    match default_font() {
      Ok(font) => Self::new(Some(font)),
      Err(e) => {
        warn!("无法加载内置字体，标签将不含文字: {}", e);
        Self::new(None)
      }
    }
  }
}

impl Annotator {
  /// 没有字体时仍绘制边框与标签背景，但不绘制文字
  pub fn new(font: Option<FontArc>) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_height: LABEL_TEXT_HEIGHT,
      color: ACCENT_COLOR,
    }
  }

  pub fn load_font(path: impl AsRef<Path>) -> Result<FontArc, FontError> {
    let data = std::fs::read(path)?;
    Ok(FontArc::try_from_vec(data)?)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 在原图上绘制诊断结果，健康时不做任何修改
  pub fn annotate(&self, image: &mut RgbImage, selection: &Selection) -> Annotation {
    match selection {
      Selection::Healthy => Annotation::Untouched,
      Selection::Detected(detection) => {
        self.draw_detection(image, detection);
        Annotation::Drawn
      }
    }
  }

  fn text_size(&self, text: &str) -> (u32, u32) {
    match &self.font {
      Some(font) => text_size(PxScale::from(self.font_size), font, text),
      None => (
        (text.chars().count() as f32 * self.label_char_width) as u32,
        self.label_text_height,
      ),
    }
  }

  fn draw_detection(&self, image: &mut RgbImage, detection: &SelectedDetection) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
      return;
    }
    let bbox = &detection.bbox;
    let color = Rgb(self.color);

    // 边框向内加粗
    let box_w = bbox.x2.saturating_sub(bbox.x1) + 1;
    let box_h = bbox.y2.saturating_sub(bbox.y1) + 1;
    for t in 0..BOX_THICKNESS {
      if box_w <= 2 * t || box_h <= 2 * t {
        break;
      }
      let rect = Rect::at((bbox.x1 + t) as i32, (bbox.y1 + t) as i32)
        .of_size(box_w - 2 * t, box_h - 2 * t);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{} {:.2}", detection.label, detection.confidence);
    let (text_w, text_h) = self.text_size(&label);
    let geometry = label_geometry(bbox, text_w, text_h, w, h);
    debug!("标签区域: {:?}", geometry);

    if geometry.width == 0 || geometry.height == 0 {
      warn!("标签没有可绘制的空间");
      return;
    }
    let rect = Rect::at(geometry.x, geometry.y).of_size(geometry.width, geometry.height);
    draw_filled_rect_mut(image, rect, color);

    let Some(font) = &self.font else {
      return;
    };
    let scale = PxScale::from(self.font_size);
    // 先绘制深色描边，再覆盖浅色文字
    for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1), (-1, -1), (1, 1), (-1, 1), (1, -1)] {
      draw_text_mut(
        image,
        Rgb(TEXT_OUTLINE),
        geometry.text_x + dx,
        geometry.text_y + dy,
        scale,
        font,
        &label,
      );
    }
    draw_text_mut(
      image,
      Rgb(TEXT_FILL),
      geometry.text_x,
      geometry.text_y,
      scale,
      font,
      &label,
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(bbox: PixelBox) -> Selection {
    Selection::Detected(SelectedDetection {
      class_id: 1,
      label: "rust".to_string(),
      confidence: 0.91,
      bbox,
    })
  }

  #[test]
  fn label_sits_above_box_when_there_is_room() {
    let bbox = PixelBox {
      x1: 10,
      y1: 100,
      x2: 50,
      y2: 150,
    };
    let geometry = label_geometry(&bbox, 40, 16, 200, 200);
    assert_eq!(geometry.x, 10);
    assert_eq!(geometry.y, 100 - 16 - 12);
    assert_eq!((geometry.width, geometry.height), (48, 24));
    assert_eq!((geometry.text_x, geometry.text_y), (14, 76));
  }

  #[test]
  fn label_is_clamped_to_the_top_and_right_edges() {
    let bbox = PixelBox {
      x1: 180,
      y1: 5,
      x2: 199,
      y2: 40,
    };
    let geometry = label_geometry(&bbox, 100, 16, 200, 200);
    assert_eq!(geometry.y, 0);
    assert_eq!(geometry.width, 20);
  }

  #[test]
  fn healthy_leaves_the_image_untouched() {
    let mut image = RgbImage::from_pixel(32, 32, Rgb([1, 2, 3]));
    let before = image.clone();
    assert_eq!(
      Annotator::default().annotate(&mut image, &Selection::Healthy),
      Annotation::Untouched
    );
    assert_eq!(image, before);
  }

  #[test]
  fn detection_draws_box_and_label_background() {
    let mut image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
    let selection = detection(PixelBox {
      x1: 20,
      y1: 60,
      x2: 80,
      y2: 99,
    });
    let annotator = Annotator::new(None);
    assert!(!annotator.has_font());
    assert_eq!(annotator.annotate(&mut image, &selection), Annotation::Drawn);

    let accent = Rgb(ACCENT_COLOR);
    // 边框三像素宽
    assert_eq!(*image.get_pixel(20, 80), accent);
    assert_eq!(*image.get_pixel(22, 80), accent);
    assert_eq!(*image.get_pixel(23, 80), Rgb([0, 0, 0]));
    assert_eq!(*image.get_pixel(80, 99), accent);
    // 标签背景位于框上方
    assert_eq!(*image.get_pixel(21, 40), accent);
    assert_eq!(*image.get_pixel(50, 70), Rgb([0, 0, 0]));
  }

  #[test]
  fn box_on_the_image_border_stays_in_bounds() {
    let mut image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
    let selection = detection(PixelBox {
      x1: 0,
      y1: 0,
      x2: 7,
      y2: 7,
    });
    assert_eq!(
      Annotator::default().annotate(&mut image, &selection),
      Annotation::Drawn
    );
    assert_eq!(*image.get_pixel(0, 0), Rgb(ACCENT_COLOR));
  }

  #[test]
  fn default_annotator_embeds_a_font() {
    assert!(default_font().is_ok());
    assert!(Annotator::default().has_font());
  }

  fn is_outline(p: &Rgb<u8>) -> bool {
    p.0.iter().all(|&c| c <= 64)
  }

  fn is_fill(p: &Rgb<u8>) -> bool {
    p.0.iter().all(|&c| c >= 200)
  }

  #[test]
  fn label_text_is_outlined_inside_the_label_rectangle() {
    let background = Rgb([128, 128, 128]);
    let annotator = Annotator::default();

    // 第一个框离顶部太近，标签贴住 y = 0；第二个框上方有空间
    for y1 in [5, 100] {
      let mut image = RgbImage::from_pixel(200, 160, background);
      let bbox = PixelBox {
        x1: 20,
        y1,
        x2: 150,
        y2: 155,
      };
      annotator.annotate(&mut image, &detection(bbox));

      let (text_w, text_h) = annotator.text_size("rust 0.91");
      let geometry = label_geometry(&bbox, text_w, text_h, 200, 160);
      if y1 == 5 {
        assert_eq!(geometry.y, 0);
      } else {
        assert!(geometry.y > 0);
      }

      let inside = |x: u32, y: u32| {
        (x as i32) >= geometry.x
          && (x as i32) < geometry.x + geometry.width as i32
          && (y as i32) >= geometry.y
          && (y as i32) < geometry.y + geometry.height as i32
      };

      let (mut outline, mut fill) = (0, 0);
      for (x, y, p) in image.enumerate_pixels() {
        if *p == background {
          continue;
        }
        if is_outline(p) || is_fill(p) {
          // 文字只出现在标签矩形内
          assert!(inside(x, y), "文字像素 ({x}, {y}) 超出标签区域 {geometry:?}");
        }
        if is_outline(p) {
          outline += 1;
        }
        if is_fill(p) {
          fill += 1;
        }
      }

      assert!(outline > 0, "标签中没有描边像素");
      assert!(fill > 0, "标签中没有文字像素");
      assert!(image.enumerate_pixels().any(|(_, _, p)| *p == Rgb(TEXT_FILL)));
    }
  }
}
