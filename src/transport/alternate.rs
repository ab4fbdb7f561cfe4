// 该文件是 Shanan （山南西风） 项目的一部分。
// src/transport/alternate.rs - 内嵌备用引擎后端
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

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, error, info};

use super::{
  BackendKind, InferParams, ModelHandle, ModelInfo, TransportClient, non_empty_positions,
  scatter_samples,
};
use crate::WithExtensions;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::PixelBuffer;
use crate::normalize::{BoxConvention, Normalizer, PolygonOnly};
use crate::result::BatchResult;

const KIND: BackendKind = BackendKind::Alternate;

/// 进程内的备用推理引擎，每个实例承载一个模型。
///
/// 检测记录的边界框为 `[x1, y1, x2, y2]`，掩码以 `poly` 轮廓列表给出。
pub trait EmbeddedEngine: Send {
  fn load(&mut self, path: &Path, device_id: i32) -> anyhow::Result<()>;

  /// 每张图像返回一个检测记录数组
  fn infer(
    &mut self,
    images: &[&PixelBuffer],
    params: &Map<String, Value>,
  ) -> anyhow::Result<Vec<Value>>;

  fn model_info(&self) -> anyhow::Result<Value>;
}

/// 为每次加载创建一个新的引擎实例
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn EmbeddedEngine> + Send + Sync>;

// 每个引擎单独加锁，表锁只在查找与增删时持有
type SharedEngine = Arc<Mutex<Box<dyn EmbeddedEngine>>>;

pub struct AlternateEngineClient {
  factory: EngineFactory,
  engines: Mutex<HashMap<ModelHandle, SharedEngine>>,
  next_index: AtomicI64,
}

impl WithExtensions for AlternateEngineClient {
  const EXTENSIONS: &'static [&'static str] = &["dvst", "dvso", "dvsp"];
}

impl AlternateEngineClient {
  pub fn new(factory: EngineFactory) -> Self {
    Self {
      factory,
      engines: Mutex::new(HashMap::new()),
      next_index: AtomicI64::new(1),
    }
  }

  fn with_engine<T>(
    &self,
    handle: &ModelHandle,
    f: impl FnOnce(&mut dyn EmbeddedEngine) -> BridgeResult<T>,
  ) -> BridgeResult<T> {
    let engine = self
      .engines
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(handle)
      .cloned()
      .ok_or_else(|| {
        BridgeError::InvalidInput(format!("[{KIND}] 模型句柄无效或已释放: {handle:?}"))
      })?;
    let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
    f(engine.as_mut())
  }
}

impl TransportClient for AlternateEngineClient {
  fn kind(&self) -> BackendKind {
    KIND
  }

  fn load(&self, path: &Path, device_id: i32) -> BridgeResult<ModelHandle> {
    let mut engine = (self.factory)();
    engine.load(path, device_id).map_err(|e| {
      error!("内嵌引擎加载模型失败: {:#}", e);
      BridgeError::load(KIND, format!("{e:#}"))
    })?;

    let handle = ModelHandle::Index(self.next_index.fetch_add(1, Ordering::Relaxed));
    self
      .engines
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(handle.clone(), Arc::new(Mutex::new(engine)));
    info!("内嵌引擎已加载模型: {}", path.display());
    Ok(handle)
  }

  fn infer(
    &self,
    handle: &ModelHandle,
    images: &[PixelBuffer],
    params: &InferParams,
  ) -> BridgeResult<BatchResult> {
    let positions = non_empty_positions(KIND, images);
    let inputs: Vec<&PixelBuffer> = positions.iter().map(|&idx| &images[idx]).collect();

    let records = self.with_engine(handle, |engine| {
      if inputs.is_empty() {
        return Ok(Vec::new());
      }
      engine
        .infer(&inputs, params.as_map())
        .map_err(|e| BridgeError::infer(KIND, format!("{e:#}")))
    })?;

    let normalizer = Normalizer::new(BoxConvention::Corners, &PolygonOnly);
    let samples = records.iter().map(|r| normalizer.sample(r)).collect();
    Ok(scatter_samples(KIND, images.len(), &positions, samples))
  }

  fn model_info(&self, handle: &ModelHandle) -> BridgeResult<ModelInfo> {
    let raw = self.with_engine(handle, |engine| {
      engine
        .model_info()
        .map_err(|e| BridgeError::protocol(KIND, format!("{e:#}")))
    })?;
    Ok(ModelInfo::new(KIND, raw))
  }

  fn free(&self, handle: &ModelHandle) {
    let removed = self
      .engines
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(handle);
    match removed {
      // 正在推理的调用结束后引擎才真正析构
      Some(engine) => {
        drop(engine);
        info!("内嵌引擎已释放模型 {:?}", handle);
      }
      None => debug!("句柄 {:?} 已释放，忽略", handle),
    }
  }
}
