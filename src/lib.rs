// 该文件是 Shanan （山南西风） 项目的一部分。
// src/lib.rs - 库主文件
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

//! 统一的视觉模型推理客户端。
//!
//! 模型可能由四种互不兼容的后端承载：进程内原生库、本地 HTTP 服务、
//! 命名管道 RPC + 共享内存工作进程，以及内嵌的备用引擎。
//! 调用方只需给出模型路径，后端由文件后缀决定，结果统一为 [`result::Detection`]。

pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod model;
pub mod normalize;
pub mod result;
pub mod shm;
pub mod supervisor;
pub mod transport;

use std::path::Path;

pub use self::error::{BridgeError, BridgeResult};
pub use self::model::{LoadOptions, Model, ModelLoader};

/// 按模型文件后缀识别后端。
///
/// 后缀不区分大小写，且不含前导的 `.`。
pub trait WithExtensions {
  const EXTENSIONS: &'static [&'static str];

  fn accepts(path: &Path) -> bool {
    path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| {
        Self::EXTENSIONS
          .iter()
          .any(|known| known.eq_ignore_ascii_case(ext))
      })
      .unwrap_or(false)
  }
}
