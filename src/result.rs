// 该文件是 Shanan （山南西风） 项目的一部分。
// src/result.rs - 统一检测结果
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

use image::{GrayImage, imageops::FilterType};
use imageproc::contours::{BorderType, find_contours};
use serde_json::{Value, json};

/// 角度缺失时的哨兵值
pub const ANGLE_ABSENT: f32 = -100.0;

/// 像素坐标下的边界框 (x, y, width, height)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
  pub x: f64,
  pub y: f64,
  pub width: f64,
  pub height: f64,
}

impl BBox {
  pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由左上、右下角点构造
  pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
    Self::new(x1, y1, x2 - x1, y2 - y1)
  }

  /// 由中心点构造（旋转框）
  pub fn from_center(cx: f64, cy: f64, width: f64, height: f64) -> Self {
    Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
  }

  pub fn x2(&self) -> f64 {
    self.x + self.width
  }

  pub fn y2(&self) -> f64 {
    self.y + self.height
  }

  pub fn center(&self) -> (f64, f64) {
    (self.x + self.width / 2.0, self.y + self.height / 2.0)
  }

  pub fn area(&self) -> f64 {
    self.width * self.height
  }

  pub fn to_array(&self) -> [f64; 4] {
    [self.x, self.y, self.width, self.height]
  }
}

/// 单通道掩码，与边界框处于同一坐标空间。
///
/// 掩码总是自有内存，与任何后端进程的指针或共享内存段无关。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl Mask {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
    if data.len() != width as usize * height as usize {
      return None;
    }
    Some(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  pub fn zeros(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      data: vec![0u8; width as usize * height as usize].into_boxed_slice(),
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn get(&self, x: u32, y: u32) -> u8 {
    self.data[y as usize * self.width as usize + x as usize]
  }

  pub fn count_nonzero(&self) -> usize {
    self.data.iter().filter(|&&v| v != 0).count()
  }

  /// 非零像素的外接矩形 (x, y, w, h)，全零时返回 None
  pub fn nonzero_bounds(&self) -> Option<BBox> {
    let width = self.width as usize;
    let mut min_x = usize::MAX;
    let mut min_y = usize::MAX;
    let mut max_x = 0usize;
    let mut max_y = 0usize;
    let mut found = false;

    for (idx, &value) in self.data.iter().enumerate() {
      if value == 0 {
        continue;
      }
      let (x, y) = (idx % width, idx / width);
      min_x = min_x.min(x);
      min_y = min_y.min(y);
      max_x = max_x.max(x);
      max_y = max_y.max(y);
      found = true;
    }

    found.then(|| {
      BBox::new(
        min_x as f64,
        min_y as f64,
        (max_x - min_x + 1) as f64,
        (max_y - min_y + 1) as f64,
      )
    })
  }

  pub fn to_gray_image(&self) -> GrayImage {
    GrayImage::from_raw(self.width, self.height, self.data.to_vec())
      .unwrap_or_else(|| GrayImage::new(self.width, self.height))
  }

  /// 掩码外轮廓，坐标平移到 `origin` 所在的图像坐标系。
  ///
  /// 若给出目标尺寸且与掩码尺寸不同，先最近邻缩放到该尺寸。
  pub fn outer_contour(&self, origin: (f64, f64), target: Option<(u32, u32)>) -> Vec<(i32, i32)> {
    let mut image = self.to_gray_image();
    if let Some((tw, th)) = target {
      if tw > 0 && th > 0 && (tw, th) != (self.width, self.height) {
        image = image::imageops::resize(&image, tw, th, FilterType::Nearest);
      }
    }

    find_contours::<i32>(&image)
      .into_iter()
      .find(|contour| contour.border_type == BorderType::Outer)
      .map(|contour| {
        contour
          .points
          .iter()
          .map(|p| (p.x + origin.0 as i32, p.y + origin.1 as i32))
          .collect()
      })
      .unwrap_or_default()
  }
}

impl From<GrayImage> for Mask {
  fn from(image: GrayImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

/// 与后端无关的单个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub category_id: i64,
  pub category_name: String,
  pub score: f32,
  pub area: f64,
  pub bbox: Option<BBox>,
  pub mask: Option<Mask>,
  /// 旋转角度，缺失时为 [`ANGLE_ABSENT`]
  pub angle: f32,
  pub with_bbox: bool,
  pub with_mask: bool,
  pub with_angle: bool,
}

impl Default for Detection {
  fn default() -> Self {
    Self {
      category_id: 0,
      category_name: String::new(),
      score: 0.0,
      area: 0.0,
      bbox: None,
      mask: None,
      angle: ANGLE_ABSENT,
      with_bbox: false,
      with_mask: false,
      with_angle: false,
    }
  }
}

impl Detection {
  pub fn angle(&self) -> Option<f32> {
    self.with_angle.then_some(self.angle)
  }

  /// 扁平化的标准 JSON 视图，掩码以外轮廓点列表表示
  pub fn to_standard_json(&self) -> Value {
    let bbox = self.bbox.map(|b| b.to_array().to_vec()).unwrap_or_default();
    let with_bbox = !bbox.is_empty();

    let contour = match (&self.mask, self.bbox) {
      (Some(mask), Some(b)) => mask.outer_contour(
        (b.x, b.y),
        Some((b.width.max(0.0) as u32, b.height.max(0.0) as u32)),
      ),
      (Some(mask), None) => mask.outer_contour((0.0, 0.0), None),
      _ => Vec::new(),
    };

    let (mask, with_mask) = if contour.is_empty() {
      (json!({ "height": -1, "mask_ptr": 0, "width": -1 }), false)
    } else {
      let points: Vec<Value> = contour
        .into_iter()
        .map(|(x, y)| json!({ "x": x, "y": y }))
        .collect();
      (Value::Array(points), true)
    };

    json!({
      "category_id": self.category_id,
      "category_name": self.category_name,
      "score": self.score,
      "area": self.area,
      "bbox": bbox,
      "with_bbox": with_bbox,
      "angle": self.angle,
      "with_angle": self.with_angle,
      "mask": mask,
      "with_mask": with_mask,
    })
  }
}

/// 单张输入图像的检测结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleResult {
  pub detections: Vec<Detection>,
}

impl SampleResult {
  pub fn new(detections: Vec<Detection>) -> Self {
    Self { detections }
  }

  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }

  pub fn len(&self) -> usize {
    self.detections.len()
  }

  pub fn to_standard_json(&self) -> Value {
    Value::Array(
      self
        .detections
        .iter()
        .map(Detection::to_standard_json)
        .collect(),
    )
  }
}

/// 一批输入图像的结果，顺序与输入一致
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
  pub samples: Vec<SampleResult>,
}

impl BatchResult {
  pub fn new(samples: Vec<SampleResult>) -> Self {
    Self { samples }
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  pub fn total_detections(&self) -> usize {
    self.samples.iter().map(SampleResult::len).sum()
  }
}
