// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 错误类型
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

use std::time::Duration;

use thiserror::Error;

use crate::supervisor::SupervisorError;
use crate::transport::BackendKind;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
  /// 后端不可达、拒绝模型或模型文件不存在
  #[error("[{backend}] 模型加载失败: {message}")]
  Load {
    backend: BackendKind,
    message: String,
  },
  /// 后端进程未能在限定时间内就绪
  #[error("[{backend}] 等待后端启动超时 ({waited:.1?})")]
  StartupTimeout {
    backend: BackendKind,
    waited: Duration,
  },
  /// 后端报告推理失败或共享内存段不可读
  #[error("[{backend}] 推理失败: {message}")]
  Infer {
    backend: BackendKind,
    message: String,
  },
  /// 响应无法解析或缺少必需字段
  #[error("[{backend}] 协议错误: {message}")]
  Protocol {
    backend: BackendKind,
    message: String,
  },
  #[error("输入无效: {0}")]
  InvalidInput(String),
}

impl BridgeError {
  pub fn load(backend: BackendKind, message: impl Into<String>) -> Self {
    BridgeError::Load {
      backend,
      message: message.into(),
    }
  }

  pub fn infer(backend: BackendKind, message: impl Into<String>) -> Self {
    BridgeError::Infer {
      backend,
      message: message.into(),
    }
  }

  pub fn protocol(backend: BackendKind, message: impl Into<String>) -> Self {
    BridgeError::Protocol {
      backend,
      message: message.into(),
    }
  }

  /// 将启动阶段的错误归类：超时保持为超时，其余视为加载失败。
  pub fn from_supervisor(backend: BackendKind, err: SupervisorError) -> Self {
    match err {
      SupervisorError::StartupTimeout(waited) => BridgeError::StartupTimeout { backend, waited },
      other => BridgeError::load(backend, other.to_string()),
    }
  }

  pub fn backend(&self) -> Option<BackendKind> {
    match self {
      BridgeError::Load { backend, .. }
      | BridgeError::StartupTimeout { backend, .. }
      | BridgeError::Infer { backend, .. }
      | BridgeError::Protocol { backend, .. } => Some(*backend),
      BridgeError::InvalidInput(_) => None,
    }
  }
}
