// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Parser;
use shanan_bridge::LoadOptions;
use shanan_bridge::transport::{InferParams, TransportMode};

/// Shanan 推理客户端
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件路径，后端由后缀决定
  /// - dvp: 本地 HTTP 推理服务
  /// - dvst / dvso / dvsp: 内嵌引擎
  /// - dvt / dvo: 原生库，或配合 --out-of-process 使用 RPC 工作进程
  #[arg(long, value_name = "MODEL")]
  pub model: PathBuf,

  /// 输入图片，可多次指定组成一批
  #[arg(long, value_name = "IMAGE")]
  pub input: Vec<PathBuf>,

  /// 推理设备编号
  #[arg(long, default_value = "0", value_name = "ID")]
  pub device: i32,

  /// 原生模型改由独立工作进程承载
  #[arg(long)]
  pub out_of_process: bool,

  /// 启用模型缓存
  #[arg(long)]
  pub cache: bool,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub threshold: Option<f32>,

  /// 请求后端返回掩码
  #[arg(long)]
  pub with_mask: bool,

  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 输出模型信息
  #[arg(long)]
  pub info: bool,

  /// 以标准 JSON 输出检测结果
  #[arg(long)]
  pub json: bool,
}

impl Args {
  pub fn load_options(&self) -> LoadOptions {
    let mode = if self.out_of_process {
      TransportMode::OutOfProcess
    } else {
      TransportMode::InProcess
    };
    LoadOptions::default()
      .device(self.device)
      .mode(mode)
      .cache(self.cache)
  }

  pub fn infer_params(&self) -> InferParams {
    let mut params = InferParams::new();
    if let Some(threshold) = self.threshold {
      params = params.threshold(threshold);
    }
    if self.with_mask {
      params = params.with_mask(true);
    }
    params
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn options_follow_flags() {
    let args = Args::parse_from([
      "shanan-bridge",
      "--model",
      "m.dvt",
      "--input",
      "a.png",
      "--input",
      "b.jpg",
      "--device",
      "2",
      "--out-of-process",
      "--threshold",
      "0.25",
    ]);
    assert_eq!(args.input.len(), 2);

    let options = args.load_options();
    assert_eq!(options.device_id, 2);
    assert_eq!(options.mode, TransportMode::OutOfProcess);
    assert_eq!(options.use_cache, Some(false));

    let params = args.infer_params();
    assert!(params.get("threshold").is_some());
    assert!(params.get("with_mask").is_none());
  }
}
