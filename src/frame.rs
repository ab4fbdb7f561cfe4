// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 像素缓冲定义
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

use image::{DynamicImage, ExtendedColorType, GrayImage, ImageEncoder, RgbImage, codecs::png::PngEncoder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("行跨度 {stride} 小于行长度 {row}")]
  StrideTooSmall { stride: usize, row: usize },
  #[error("不支持的通道数: {0}")]
  UnsupportedChannels(u8),
  #[error("图像编码错误: {0}")]
  Image(#[from] image::ImageError),
}

/// 行主序、连续存储的 HWC 像素缓冲。
///
/// 跨进程传递前必须是连续的；非连续的数据需先通过 [`PixelBuffer::from_strided`] 拷贝。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
  width: u32,
  height: u32,
  channels: u8,
  data: Box<[u8]>,
}

impl PixelBuffer {
  pub fn from_raw(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = width as usize * height as usize * channels as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      channels,
      data: data.into_boxed_slice(),
    })
  }

  /// 从带行跨度（行尾可能有填充）的数据拷贝出连续缓冲
  pub fn from_strided(
    width: u32,
    height: u32,
    channels: u8,
    stride: usize,
    data: &[u8],
  ) -> Result<Self, FrameError> {
    let row = width as usize * channels as usize;
    if stride < row {
      return Err(FrameError::StrideTooSmall { stride, row });
    }

    let needed = if height == 0 {
      0
    } else {
      stride * (height as usize - 1) + row
    };
    if data.len() < needed {
      return Err(FrameError::LengthMismatch {
        expected: needed,
        actual: data.len(),
      });
    }

    let mut packed = Vec::with_capacity(row * height as usize);
    for h in 0..height as usize {
      let start = h * stride;
      packed.extend_from_slice(&data[start..start + row]);
    }

    Self::from_raw(width, height, channels, packed)
  }

  pub fn empty() -> Self {
    Self {
      width: 0,
      height: 0,
      channels: 0,
      data: Box::default(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> u8 {
    self.channels
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 无损编码为 PNG
  pub fn encode_png(&self) -> Result<Vec<u8>, FrameError> {
    let color = match self.channels {
      1 => ExtendedColorType::L8,
      2 => ExtendedColorType::La8,
      3 => ExtendedColorType::Rgb8,
      4 => ExtendedColorType::Rgba8,
      other => return Err(FrameError::UnsupportedChannels(other)),
    };

    let mut encoded = Vec::new();
    PngEncoder::new(&mut encoded).write_image(&self.data, self.width, self.height, color)?;
    Ok(encoded)
  }
}

impl From<RgbImage> for PixelBuffer {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      channels: 3,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

impl From<GrayImage> for PixelBuffer {
  fn from(image: GrayImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      channels: 1,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

impl From<DynamicImage> for PixelBuffer {
  fn from(image: DynamicImage) -> Self {
    match image {
      DynamicImage::ImageLuma8(gray) => gray.into(),
      DynamicImage::ImageRgba8(rgba) => {
        let (width, height) = rgba.dimensions();
        Self {
          width,
          height,
          channels: 4,
          data: rgba.into_raw().into_boxed_slice(),
        }
      }
      other => other.into_rgb8().into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_raw_rejects_wrong_length() {
    let err = PixelBuffer::from_raw(2, 2, 3, vec![0; 11]).unwrap_err();
    assert!(matches!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    ));
  }

  #[test]
  fn from_strided_drops_row_padding() {
    // 2x2 单通道，每行填充 2 字节
    let data = [1, 2, 0xEE, 0xEE, 3, 4, 0xEE, 0xEE];
    let buffer = PixelBuffer::from_strided(2, 2, 1, 4, &data).unwrap();
    assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4]);
  }

  #[test]
  fn png_encoding_is_lossless() {
    let pixels: Vec<u8> = (0..(4 * 3 * 3)).map(|v| v as u8).collect();
    let buffer = PixelBuffer::from_raw(4, 3, 3, pixels.clone()).unwrap();
    let png = buffer.encode_png().unwrap();

    let decoded = image::load_from_memory(&png).unwrap().into_rgb8();
    assert_eq!(decoded.dimensions(), (4, 3));
    assert_eq!(decoded.into_raw(), pixels);
  }

  #[test]
  fn png_rejects_odd_channel_counts() {
    let buffer = PixelBuffer::from_raw(1, 1, 5, vec![0; 5]).unwrap();
    assert!(matches!(
      buffer.encode_png(),
      Err(FrameError::UnsupportedChannels(5))
    ));
  }
}
