// 该文件是 Shanan （山南西风） 项目的一部分。
// src/normalize.rs - 各后端检测结果归一化
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

use image::{GrayImage, Luma};
use imageproc::{
  drawing::{draw_line_segment_mut, draw_polygon_mut},
  point::Point,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::result::{ANGLE_ABSENT, BBox, BatchResult, Detection, Mask, SampleResult};

/// 后端线上使用的边界框约定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxConvention {
  /// [x1, y1, x2, y2]
  Corners,
  /// [x, y, w, h]
  TopLeftSize,
}

/// 把后端特有的 `mask` 字段物化为自有掩码。
///
/// 实现必须在返回前完成拷贝，不得把原始指针或共享内存句柄带出函数。
pub trait MaskMaterializer {
  fn materialize(&self, mask: &Value) -> Option<Mask>;
}

/// 不支持 `mask` 对象的后端（掩码只以多边形形式出现）
pub struct PolygonOnly;

impl MaskMaterializer for PolygonOnly {
  fn materialize(&self, _mask: &Value) -> Option<Mask> {
    None
  }
}

pub struct Normalizer<'a> {
  convention: BoxConvention,
  masks: &'a dyn MaskMaterializer,
}

impl<'a> Normalizer<'a> {
  pub fn new(convention: BoxConvention, masks: &'a dyn MaskMaterializer) -> Self {
    Self { convention, masks }
  }

  /// 解析 `{"sample_results": [{"results": [...]}, ...]}` 形式的响应
  pub fn batch(&self, response: &Value) -> Option<BatchResult> {
    let samples = response.get("sample_results")?.as_array()?;
    Some(BatchResult::new(
      samples
        .iter()
        .map(|sample| self.sample(sample.get("results").unwrap_or(&Value::Null)))
        .collect(),
    ))
  }

  pub fn sample(&self, records: &Value) -> SampleResult {
    let Some(records) = records.as_array() else {
      return SampleResult::default();
    };
    SampleResult::new(records.iter().map(|r| self.detection(r)).collect())
  }

  pub fn detection(&self, record: &Value) -> Detection {
    let raw_box = number_list(record.get("bbox"));
    let polygon = polygon_points(record);

    // 1. 边界框约定；5 元素框为 [cx, cy, w, h, angle]
    let mut box_angle = None;
    let mut bbox = match raw_box.as_slice() {
      [cx, cy, w, h, angle] => {
        box_angle = Some(*angle as f32);
        Some(BBox::from_center(*cx, *cy, *w, *h))
      }
      [x1, y1, x2, y2] if self.convention == BoxConvention::Corners => {
        Some(BBox::from_corners(*x1, *y1, *x2, *y2))
      }
      [x, y, w, h] => Some(BBox::new(*x, *y, *w, *h)),
      _ => None,
    };

    // 2. 由多边形补出边界框
    if bbox.is_none() {
      bbox = polygon.as_deref().and_then(polygon_bounds);
    }

    // 3. 物化掩码
    let wants_mask = record
      .get("with_mask")
      .and_then(Value::as_bool)
      .unwrap_or(true);
    let mask = if wants_mask {
      match (&polygon, bbox) {
        (Some(points), Some(b)) => rasterize_polygon(points, &b),
        _ => record
          .get("mask")
          .filter(|m| m.is_object())
          .and_then(|m| self.masks.materialize(m)),
      }
    } else {
      None
    };

    // 4. 由掩码补出边界框
    if bbox.is_none() {
      bbox = mask.as_ref().and_then(Mask::nonzero_bounds);
    }

    // 5. 角度
    let flagged = record.get("with_angle").and_then(Value::as_bool);
    let explicit = record
      .get("angle")
      .and_then(Value::as_f64)
      .map(|a| a as f32);
    let angle = match (flagged, explicit) {
      (Some(true), Some(a)) => Some(a),
      (None, Some(a)) if a > -99.0 => Some(a),
      _ => box_angle,
    };

    // 6. 边界框标志
    let with_bbox = bbox.is_some()
      && record
        .get("with_bbox")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let area = record
      .get("area")
      .and_then(Value::as_f64)
      .unwrap_or_else(|| bbox.map(|b| b.area()).unwrap_or(0.0));

    Detection {
      category_id: record
        .get("category_id")
        .and_then(Value::as_i64)
        .unwrap_or(0),
      category_name: record
        .get("category_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
      score: record.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
      area,
      bbox,
      with_bbox,
      with_mask: mask.is_some(),
      mask,
      angle: angle.unwrap_or(ANGLE_ABSENT),
      with_angle: angle.is_some(),
    }
  }
}

fn number_list(value: Option<&Value>) -> Vec<f64> {
  value
    .and_then(Value::as_array)
    .map(|items| items.iter().filter_map(Value::as_f64).collect())
    .unwrap_or_default()
}

fn point_of(value: &Value) -> Option<(f64, f64)> {
  match value {
    Value::Array(xy) if xy.len() >= 2 => Some((xy[0].as_f64()?, xy[1].as_f64()?)),
    Value::Object(_) => Some((value.get("x")?.as_f64()?, value.get("y")?.as_f64()?)),
    _ => None,
  }
}

/// 多边形可能出现在三处：
/// `polygon: [[x, y], ...]`、`poly: [[[x, y], ...], ...]`（取第一个轮廓）、
/// `mask: [{"x": .., "y": ..}, ...]`
fn polygon_points(record: &Value) -> Option<Vec<(f64, f64)>> {
  let candidate = record
    .get("polygon")
    .and_then(Value::as_array)
    .or_else(|| {
      record
        .get("poly")
        .and_then(Value::as_array)
        .and_then(|contours| contours.first())
        .and_then(Value::as_array)
    })
    .or_else(|| record.get("mask").and_then(Value::as_array))?;

  let points: Vec<(f64, f64)> = candidate.iter().filter_map(point_of).collect();
  (!points.is_empty()).then_some(points)
}

/// 多边形顶点的轴对齐外接矩形
pub fn polygon_bounds(points: &[(f64, f64)]) -> Option<BBox> {
  let (first, rest) = points.split_first()?;
  let (mut min_x, mut min_y) = *first;
  let (mut max_x, mut max_y) = *first;
  for &(x, y) in rest {
    min_x = min_x.min(x);
    min_y = min_y.min(y);
    max_x = max_x.max(x);
    max_y = max_y.max(y);
  }
  Some(BBox::new(min_x, min_y, max_x - min_x, max_y - min_y))
}

/// 由多边形生成的掩码单边最大像素数
pub const MAX_MASK_SIDE: u32 = 16_384;

/// 在边界框大小的画布上填充多边形，点坐标转换到框内并截断到边界
pub fn rasterize_polygon(points: &[(f64, f64)], bbox: &BBox) -> Option<Mask> {
  let extent = [bbox.x, bbox.y, bbox.width, bbox.height];
  if extent.iter().any(|v| !v.is_finite()) {
    warn!("边界框含非有限值，跳过掩码生成: {:?}", extent);
    return None;
  }
  if bbox.width > MAX_MASK_SIDE as f64 || bbox.height > MAX_MASK_SIDE as f64 {
    warn!(
      "边界框 {}x{} 超过掩码上限 {}，跳过掩码生成",
      bbox.width, bbox.height, MAX_MASK_SIDE
    );
    return None;
  }

  let (x0, y0) = (bbox.x as i64, bbox.y as i64);
  let (width, height) = (bbox.width as i64, bbox.height as i64);
  if width <= 0 || height <= 0 || points.is_empty() {
    debug!("多边形或边界框为空，跳过掩码生成");
    return None;
  }

  let mut local: Vec<Point<i32>> = Vec::with_capacity(points.len());
  for &(px, py) in points {
    // 宽高不超过上限，截断后的坐标落在 i32 范围内
    let p = Point::new(
      (px as i64).saturating_sub(x0).clamp(0, width - 1) as i32,
      (py as i64).saturating_sub(y0).clamp(0, height - 1) as i32,
    );
    if local.last() != Some(&p) {
      local.push(p);
    }
  }
  while local.len() > 1 && local.first() == local.last() {
    local.pop();
  }

  let mut canvas = GrayImage::new(width as u32, height as u32);
  let white = Luma([255u8]);
  match local.as_slice() {
    [] => return None,
    [p] => canvas.put_pixel(p.x as u32, p.y as u32, white),
    [a, b] => draw_line_segment_mut(
      &mut canvas,
      (a.x as f32, a.y as f32),
      (b.x as f32, b.y as f32),
      white,
    ),
    poly => draw_polygon_mut(&mut canvas, poly, white),
  }

  let mask = Mask::from(canvas);
  if mask.count_nonzero() == 0 {
    warn!("多边形填充结果为空");
  }
  Some(mask)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  struct FixedMask(Mask);

  impl MaskMaterializer for FixedMask {
    fn materialize(&self, _mask: &Value) -> Option<Mask> {
      Some(self.0.clone())
    }
  }

  fn corners() -> Normalizer<'static> {
    Normalizer::new(BoxConvention::Corners, &PolygonOnly)
  }

  #[test]
  fn corner_boxes_become_top_left_size() {
    let det = corners().detection(&json!({
      "category_id": 2, "category_name": "dent", "score": 0.75,
      "bbox": [10.0, 20.0, 40.0, 60.0]
    }));
    let b = det.bbox.unwrap();
    assert_eq!(b.to_array(), [10.0, 20.0, 30.0, 40.0]);
    assert_eq!((b.x2(), b.y2()), (40.0, 60.0));
    assert!(det.with_bbox);
    assert_eq!(det.category_name, "dent");
    assert_eq!(det.area, 1200.0);
  }

  #[test]
  fn top_left_boxes_pass_through() {
    let normalizer = Normalizer::new(BoxConvention::TopLeftSize, &PolygonOnly);
    let det = normalizer.detection(&json!({ "bbox": [1, 2, 3, 4], "area": 7.0 }));
    assert_eq!(det.bbox.unwrap().to_array(), [1.0, 2.0, 3.0, 4.0]);
    assert_eq!(det.area, 7.0);
  }

  #[test]
  fn polygon_supplies_missing_bbox() {
    let det = corners().detection(&json!({
      "polygon": [[0, 0], [4, 0], [4, 4], [0, 4]]
    }));
    assert_eq!(det.bbox.unwrap().to_array(), [0.0, 0.0, 4.0, 4.0]);
    assert!(det.with_bbox);

    let mask = det.mask.expect("polygon should rasterize");
    assert_eq!((mask.width(), mask.height()), (4, 4));
    assert_eq!(mask.get(0, 0), 255);
    assert_eq!(mask.get(3, 3), 255);
    assert!(det.with_mask);
  }

  #[test]
  fn short_bbox_falls_back_to_polygon() {
    let det = corners().detection(&json!({
      "bbox": [5.0],
      "polygon": [[2, 3], [8, 3], [8, 9]]
    }));
    assert_eq!(det.bbox.unwrap().to_array(), [2.0, 3.0, 6.0, 6.0]);
  }

  #[test]
  fn contour_list_polygon_uses_first_contour() {
    let det = corners().detection(&json!({
      "poly": [[[10, 10], [20, 10], [20, 30]], [[0, 0], [1, 1]]]
    }));
    assert_eq!(det.bbox.unwrap().to_array(), [10.0, 10.0, 10.0, 20.0]);
  }

  #[test]
  fn mask_supplies_missing_bbox() {
    let mut data = vec![0u8; 8 * 8];
    for y in 2..=5 {
      for x in 1..=3 {
        data[y * 8 + x] = 1;
      }
    }
    let masks = FixedMask(Mask::new(8, 8, data).unwrap());
    let normalizer = Normalizer::new(BoxConvention::TopLeftSize, &masks);
    let det = normalizer.detection(&json!({
      "with_mask": true,
      "mask": { "mmf_token": "abc", "width": 8, "height": 8 }
    }));
    assert_eq!(det.bbox.unwrap().to_array(), [1.0, 2.0, 3.0, 4.0]);
    assert!(det.with_bbox);
    assert!(det.with_mask);
  }

  #[test]
  fn five_element_box_carries_angle() {
    let det = corners().detection(&json!({ "bbox": [10, 10, 20, 20, 45.0] }));
    assert!(det.with_angle);
    assert_eq!(det.angle, 45.0);
    assert_eq!(det.angle(), Some(45.0));
    assert_eq!(det.bbox.unwrap().center(), (10.0, 10.0));
  }

  #[test]
  fn flagged_angle_takes_precedence() {
    let det = corners().detection(&json!({
      "bbox": [10, 10, 20, 20, 45.0],
      "with_angle": true,
      "angle": 30.0
    }));
    assert_eq!(det.angle, 30.0);
  }

  #[test]
  fn sentinel_angle_is_absent() {
    let det = corners().detection(&json!({ "bbox": [0, 0, 1, 1], "angle": -100.0 }));
    assert!(!det.with_angle);
    assert_eq!(det.angle, ANGLE_ABSENT);
    assert_eq!(det.angle(), None);
  }

  #[test]
  fn explicit_with_bbox_false_wins() {
    let det = corners().detection(&json!({ "bbox": [0, 0, 1, 1], "with_bbox": false }));
    assert!(det.bbox.is_some());
    assert!(!det.with_bbox);
  }

  #[test]
  fn with_mask_false_skips_materialization() {
    let masks = FixedMask(Mask::zeros(2, 2));
    let normalizer = Normalizer::new(BoxConvention::TopLeftSize, &masks);
    let det = normalizer.detection(&json!({
      "bbox": [0, 0, 2, 2],
      "with_mask": false,
      "mask": { "mask_ptr": 0, "width": -1, "height": -1 }
    }));
    assert!(det.mask.is_none());
    assert!(!det.with_mask);
  }

  #[test]
  fn batch_preserves_sample_order() {
    let batch = corners()
      .batch(&json!({
        "sample_results": [
          { "results": [{ "category_name": "a" }] },
          { "results": [] },
          { "results": [{ "category_name": "c" }, { "category_name": "d" }] }
        ]
      }))
      .unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.samples[0].detections[0].category_name, "a");
    assert!(batch.samples[1].is_empty());
    assert_eq!(batch.samples[2].len(), 2);
  }

  #[test]
  fn batch_requires_sample_results() {
    assert!(corners().batch(&json!({ "results": [] })).is_none());
  }

  #[test]
  fn degenerate_polygon_still_rasterizes() {
    let mask = rasterize_polygon(&[(1.0, 1.0), (3.0, 1.0)], &BBox::new(0.0, 0.0, 4.0, 4.0)).unwrap();
    assert_eq!(mask.get(2, 1), 255);
  }

  #[test]
  fn empty_bbox_yields_no_mask() {
    assert!(rasterize_polygon(&[(0.0, 0.0), (1.0, 1.0), (0.0, 1.0)], &BBox::new(0.0, 0.0, 0.0, 3.0)).is_none());
  }

  #[test]
  fn oversized_polygon_keeps_box_without_mask() {
    let det = corners().detection(&json!({
      "bbox": [0, 0, 1.0e6, 1.0e6],
      "polygon": [[0, 0], [1.0e6, 0], [1.0e6, 1.0e6]]
    }));
    assert_eq!(det.bbox.unwrap().to_array(), [0.0, 0.0, 1.0e6, 1.0e6]);
    assert!(det.with_bbox);
    assert!(det.mask.is_none());
    assert!(!det.with_mask);

    let side = MAX_MASK_SIDE as f64 + 1.0;
    let tall = BBox::new(0.0, 0.0, 4.0, side);
    assert!(rasterize_polygon(&[(0.0, 0.0), (3.0, 0.0), (3.0, 3.0)], &tall).is_none());
    let far = BBox::new(f64::NAN, 0.0, 4.0, 4.0);
    assert!(rasterize_polygon(&[(0.0, 0.0), (3.0, 0.0), (3.0, 3.0)], &far).is_none());
  }
}
