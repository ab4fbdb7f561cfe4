// 该文件是 Shanan （山南西风） 项目的一部分。
// src/transport.rs - 推理后端抽象
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

pub mod alternate;
pub mod http;
pub mod native;
pub mod rpc;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::WithExtensions;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::PixelBuffer;
use crate::result::{BatchResult, SampleResult};

pub use self::alternate::{AlternateEngineClient, EmbeddedEngine, EngineFactory};
pub use self::http::HttpServiceClient;
pub use self::native::InProcessLibraryClient;
pub use self::rpc::PipeRpcClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
  Native,
  HttpService,
  PipeRpc,
  Alternate,
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      BackendKind::Native => "native",
      BackendKind::HttpService => "http",
      BackendKind::PipeRpc => "rpc",
      BackendKind::Alternate => "alternate",
    };
    f.write_str(name)
  }
}

/// 原生模型文件（进程内或经 RPC 在独立进程中运行）
pub struct NativeModelFile;

impl WithExtensions for NativeModelFile {
  const EXTENSIONS: &'static [&'static str] = &["dvt", "dvo"];
}

impl BackendKind {
  /// 按模型文件后缀选择后端，后缀无法识别时返回 None
  pub fn select(path: &Path, mode: TransportMode) -> Option<BackendKind> {
    if HttpServiceClient::accepts(path) {
      Some(BackendKind::HttpService)
    } else if AlternateEngineClient::accepts(path) {
      Some(BackendKind::Alternate)
    } else if NativeModelFile::accepts(path) {
      Some(match mode {
        TransportMode::InProcess => BackendKind::Native,
        TransportMode::OutOfProcess => BackendKind::PipeRpc,
      })
    } else {
      None
    }
  }

  /// 是否依赖外部服务进程
  pub fn is_service_backed(self) -> bool {
    matches!(self, BackendKind::HttpService | BackendKind::PipeRpc)
  }
}

/// 原生模型的运行位置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
  #[default]
  InProcess,
  OutOfProcess,
}

/// 后端签发的模型句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelHandle {
  /// 后端分配的模型索引
  Index(i64),
  /// 后端不分配索引，以模型路径区分；同一路径的每次加载各有一个 `load_id`
  Loaded { path: PathBuf, load_id: u64 },
}

impl ModelHandle {
  /// 线上协议中的 `model_index`
  pub fn wire_index(&self) -> i64 {
    match self {
      ModelHandle::Index(index) => *index,
      ModelHandle::Loaded { .. } => 1,
    }
  }
}

/// 推理参数，原样合并进请求；后端忽略不认识的键
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferParams(Map<String, Value>);

impl InferParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn threshold(self, threshold: f32) -> Self {
    self.set("threshold", threshold)
  }

  pub fn with_mask(self, with_mask: bool) -> Self {
    self.set("with_mask", with_mask)
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  pub fn as_map(&self) -> &Map<String, Value> {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// 合并进请求体，同名键以参数为准
  pub fn merge_into(&self, request: &mut Map<String, Value>) {
    for (key, value) in &self.0 {
      request.insert(key.clone(), value.clone());
    }
  }
}

impl From<Map<String, Value>> for InferParams {
  fn from(map: Map<String, Value>) -> Self {
    Self(map)
  }
}

const OCR_STRIPPED_FIELDS: [&str; 3] = ["character", "dict", "classes"];

/// 后端返回的模型信息
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
  pub backend: BackendKind,
  pub raw: Value,
}

impl ModelInfo {
  /// OCR 模型的字符表、字典与类别列表体积大且下游不需要，构造时即移除
  pub fn new(backend: BackendKind, mut raw: Value) -> Self {
    if let Some(info) = raw.get_mut("model_info").and_then(Value::as_object_mut) {
      if info.get("task_type").and_then(Value::as_str) == Some("OCR") {
        for field in OCR_STRIPPED_FIELDS {
          info.remove(field);
        }
      }
    }
    Self { backend, raw }
  }

  pub fn task_type(&self) -> Option<&str> {
    self.raw.get("model_info")?.get("task_type")?.as_str()
  }
}

/// 四种后端共同遵守的能力契约。
///
/// `infer` 对每张输入图像都产出一个结果槽位，顺序与输入一致；
/// `free` 是幂等的，重复释放或释放无效句柄都不是错误。
pub trait TransportClient: Send + Sync {
  fn kind(&self) -> BackendKind;

  fn load(&self, path: &Path, device_id: i32) -> BridgeResult<ModelHandle>;

  fn infer(
    &self,
    handle: &ModelHandle,
    images: &[PixelBuffer],
    params: &InferParams,
  ) -> BridgeResult<BatchResult>;

  fn model_info(&self, handle: &ModelHandle) -> BridgeResult<ModelInfo>;

  fn free(&self, handle: &ModelHandle);
}

/// 释放句柄的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
  /// 句柄无效或已释放
  Unknown,
  /// 同一模型还有其他有效句柄，后端不应卸载
  StillShared,
  /// 最后一个句柄，需要通知后端卸载
  Last,
}

/// 客户端持有的有效句柄集合
#[derive(Debug, Default)]
pub(crate) struct LiveHandles {
  handles: Mutex<HashSet<ModelHandle>>,
  next_load_id: AtomicU64,
}

impl LiveHandles {
  /// 为按路径区分的后端签发新句柄并登记
  pub(crate) fn issue_loaded(&self, path: &Path) -> ModelHandle {
    let handle = ModelHandle::Loaded {
      path: path.to_path_buf(),
      load_id: self.next_load_id.fetch_add(1, Ordering::Relaxed),
    };
    self.insert(handle.clone());
    handle
  }

  pub(crate) fn insert(&self, handle: ModelHandle) {
    self
      .handles
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(handle);
  }

  pub(crate) fn release(&self, handle: &ModelHandle) -> Release {
    let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
    if !handles.remove(handle) {
      return Release::Unknown;
    }
    let shared = match handle {
      ModelHandle::Index(_) => false,
      ModelHandle::Loaded { path, .. } => handles
        .iter()
        .any(|other| matches!(other, ModelHandle::Loaded { path: p, .. } if p == path)),
    };
    if shared {
      Release::StillShared
    } else {
      Release::Last
    }
  }

  pub(crate) fn check(&self, backend: BackendKind, handle: &ModelHandle) -> BridgeResult<()> {
    let live = self
      .handles
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(handle);
    if live {
      Ok(())
    } else {
      Err(BridgeError::InvalidInput(format!(
        "[{backend}] 模型句柄无效或已释放: {handle:?}"
      )))
    }
  }
}

/// 把后端只对非空图像给出的结果放回原始位置，空图像与缺失的位置补空结果
pub(crate) fn scatter_samples(
  backend: BackendKind,
  total: usize,
  positions: &[usize],
  mut produced: Vec<SampleResult>,
) -> BatchResult {
  if produced.len() != positions.len() {
    warn!(
      "[{}] 后端返回 {} 组结果, 期望 {} 组",
      backend,
      produced.len(),
      positions.len()
    );
    produced.resize_with(positions.len(), SampleResult::default);
  }

  let mut samples = vec![SampleResult::default(); total];
  for (&position, sample) in positions.iter().zip(produced) {
    samples[position] = sample;
  }
  BatchResult::new(samples)
}

/// 非空图像的下标；空图像记录告警
pub(crate) fn non_empty_positions(backend: BackendKind, images: &[PixelBuffer]) -> Vec<usize> {
  images
    .iter()
    .enumerate()
    .filter_map(|(idx, image)| {
      if image.is_empty() {
        warn!("[{}] 第 {} 张图像为空，返回空结果", backend, idx);
        None
      } else {
        Some(idx)
      }
    })
    .collect()
}
