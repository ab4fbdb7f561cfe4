// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 推理客户端入口
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

mod args;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use image::ImageReader;
use tracing::info;

use shanan_bridge::ModelLoader;
use shanan_bridge::config::BridgeConfig;
use shanan_bridge::frame::PixelBuffer;

fn read_image(path: &Path) -> Result<PixelBuffer> {
  let image = ImageReader::open(path)
    .with_context(|| format!("无法打开图片 {}", path.display()))?
    .decode()
    .with_context(|| format!("无法解码图片 {}", path.display()))?;
  Ok(PixelBuffer::from(image.to_rgb8()))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  let config = match &args.config {
    Some(path) => BridgeConfig::from_json_file(path)
      .with_context(|| format!("无法读取配置 {}", path.display()))?,
    None => BridgeConfig::default(),
  };

  info!("模型文件路径: {}", args.model.display());
  info!("输入图片: {} 张", args.input.len());

  let loader = ModelLoader::new(config);
  let model = loader.load(&args.model, args.load_options())?;
  info!("模型已加载，后端: {}", model.kind());

  if args.info {
    let model_info = model.model_info()?;
    println!("{}", serde_json::to_string_pretty(&model_info.raw)?);
  }

  if args.input.is_empty() {
    return Ok(());
  }

  let images = args
    .input
    .iter()
    .map(|path| read_image(path))
    .collect::<Result<Vec<_>>>()?;

  info!("开始推理...");
  let now = std::time::Instant::now();
  let batch = model.infer_batch(&images, &args.infer_params())?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  for (path, sample) in args.input.iter().zip(&batch.samples) {
    if args.json {
      println!("{}", serde_json::to_string(&sample.to_standard_json())?);
      continue;
    }

    println!("{}: 检测到 {} 个对象", path.display(), sample.len());
    for det in &sample.detections {
      match det.bbox {
        Some(bbox) => println!(
          "  - {} ({}): {:.2}% at ({:.0}, {:.0}, {:.0}x{:.0})",
          det.category_name,
          det.category_id,
          det.score * 100.0,
          bbox.x,
          bbox.y,
          bbox.width,
          bbox.height
        ),
        None => println!(
          "  - {} ({}): {:.2}%",
          det.category_name,
          det.category_id,
          det.score * 100.0
        ),
      }
    }
  }

  Ok(())
}
