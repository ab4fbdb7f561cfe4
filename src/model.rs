// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型加载与推理入口
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
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{ModelCache, ModelKey};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::PixelBuffer;
use crate::result::{BatchResult, SampleResult};
use crate::supervisor::ProcessSupervisor;
use crate::transport::{
  AlternateEngineClient, BackendKind, EngineFactory, HttpServiceClient, InProcessLibraryClient,
  InferParams, ModelHandle, ModelInfo, PipeRpcClient, TransportClient, TransportMode,
};

/// 单次加载的选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
  pub device_id: i32,
  pub mode: TransportMode,
  /// 未指定时使用加载器的默认设置
  pub use_cache: Option<bool>,
}

impl LoadOptions {
  pub fn device(mut self, device_id: i32) -> Self {
    self.device_id = device_id;
    self
  }

  pub fn mode(mut self, mode: TransportMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn out_of_process(self) -> Self {
    self.mode(TransportMode::OutOfProcess)
  }

  pub fn cache(mut self, use_cache: bool) -> Self {
    self.use_cache = Some(use_cache);
    self
  }
}

struct LoadedModel {
  path: PathBuf,
  client: Arc<dyn TransportClient>,
  handle: ModelHandle,
}

impl Drop for LoadedModel {
  fn drop(&mut self) {
    debug!("模型最后一个引用已释放: {}", self.path.display());
    self.client.free(&self.handle);
  }
}

/// 已加载的模型。
///
/// 克隆共享同一个后端句柄；最后一个引用析构时释放句柄。
/// 后端在加载时确定，之后不再改变。
#[derive(Clone)]
pub struct Model {
  inner: Arc<LoadedModel>,
}

impl fmt::Debug for Model {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Model")
      .field("kind", &self.kind())
      .field("path", &self.inner.path)
      .field("handle", &self.inner.handle)
      .finish()
  }
}

impl Model {
  fn new(path: &Path, client: Arc<dyn TransportClient>, handle: ModelHandle) -> Self {
    Self {
      inner: Arc::new(LoadedModel {
        path: path.to_path_buf(),
        client,
        handle,
      }),
    }
  }

  pub fn kind(&self) -> BackendKind {
    self.inner.client.kind()
  }

  pub fn path(&self) -> &Path {
    &self.inner.path
  }

  pub fn handle(&self) -> &ModelHandle {
    &self.inner.handle
  }

  /// 是否由外部服务进程承载（HTTP 服务或 RPC 工作进程）
  pub fn is_service_backed(&self) -> bool {
    self.kind().is_service_backed()
  }

  /// 两个引用是否指向同一次加载
  pub fn same_instance(&self, other: &Model) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  pub fn infer_batch(
    &self,
    images: &[PixelBuffer],
    params: &InferParams,
  ) -> BridgeResult<BatchResult> {
    let batch = self
      .inner
      .client
      .infer(&self.inner.handle, images, params)?;
    debug!(
      "推理完成: {} 张图像, {} 个检测",
      batch.len(),
      batch.total_detections()
    );
    Ok(batch)
  }

  pub fn infer(&self, image: &PixelBuffer, params: &InferParams) -> BridgeResult<SampleResult> {
    let batch = self.infer_batch(std::slice::from_ref(image), params)?;
    Ok(batch.samples.into_iter().next().unwrap_or_default())
  }

  /// 单张图像的标准 JSON 结果
  pub fn infer_one_json(&self, image: &PixelBuffer, params: &InferParams) -> BridgeResult<Value> {
    Ok(self.infer(image, params)?.to_standard_json())
  }

  pub fn model_info(&self) -> BridgeResult<ModelInfo> {
    self.inner.client.model_info(&self.inner.handle)
  }

  /// 立即释放后端句柄；之后的推理调用返回错误
  pub fn free(&self) {
    self.inner.client.free(&self.inner.handle);
  }
}

/// 模型加载器，持有缓存与各后端客户端，整个进程通常只构造一个。
pub struct ModelLoader {
  config: BridgeConfig,
  cache: ModelCache<Model>,
  clients: Mutex<HashMap<BackendKind, Arc<dyn TransportClient>>>,
  engine_factory: Option<EngineFactory>,
}

impl Default for ModelLoader {
  fn default() -> Self {
    Self::new(BridgeConfig::default())
  }
}

impl ModelLoader {
  pub fn new(config: BridgeConfig) -> Self {
    Self {
      cache: ModelCache::new(config.cache.poll_interval),
      config,
      clients: Mutex::new(HashMap::new()),
      engine_factory: None,
    }
  }

  /// 设置内嵌引擎的构造方式，未设置时无法加载内嵌引擎模型
  pub fn with_engine_factory(mut self, factory: EngineFactory) -> Self {
    self.engine_factory = Some(factory);
    self
  }

  /// 使用给定的客户端承载对应类别的后端
  pub fn with_client(self, client: Arc<dyn TransportClient>) -> Self {
    self
      .clients
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(client.kind(), client);
    self
  }

  pub fn config(&self) -> &BridgeConfig {
    &self.config
  }

  fn client_for(&self, kind: BackendKind) -> BridgeResult<Arc<dyn TransportClient>> {
    let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(client) = clients.get(&kind) {
      return Ok(Arc::clone(client));
    }

    let client: Arc<dyn TransportClient> = match kind {
      BackendKind::Native => Arc::new(InProcessLibraryClient::open(&self.config.native)?),
      BackendKind::HttpService => Arc::new(HttpServiceClient::new(
        self.config.http.clone(),
        Arc::new(ProcessSupervisor::new()),
      )?),
      BackendKind::PipeRpc => Arc::new(PipeRpcClient::new(
        self.config.rpc.clone(),
        Arc::new(ProcessSupervisor::new()),
      )),
      BackendKind::Alternate => {
        let factory = self
          .engine_factory
          .clone()
          .ok_or_else(|| BridgeError::load(kind, "未配置内嵌引擎"))?;
        Arc::new(AlternateEngineClient::new(factory))
      }
    };
    clients.insert(kind, Arc::clone(&client));
    Ok(client)
  }

  pub fn load(&self, path: impl AsRef<Path>, options: LoadOptions) -> BridgeResult<Model> {
    let path = path.as_ref();
    let kind = BackendKind::select(path, options.mode).ok_or_else(|| {
      BridgeError::InvalidInput(format!("不支持的模型文件后缀: {}", path.display()))
    })?;

    if options.use_cache.unwrap_or(self.config.cache.enabled) {
      let key = ModelKey::new(path, options.device_id, options.mode);
      self
        .cache
        .acquire(&key, || self.load_uncached(kind, path, options.device_id))
    } else {
      self.load_uncached(kind, path, options.device_id)
    }
  }

  fn load_uncached(&self, kind: BackendKind, path: &Path, device_id: i32) -> BridgeResult<Model> {
    if !path.is_file() {
      return Err(BridgeError::load(
        kind,
        format!("模型文件不存在: {}", path.display()),
      ));
    }

    info!("加载模型 {} (后端 {}, 设备 {})", path.display(), kind, device_id);
    let client = self.client_for(kind)?;
    let handle = client.load(path, device_id)?;
    Ok(Model::new(path, client, handle))
  }

  /// 清空模型缓存；没有其他引用的模型随之释放
  pub fn clear_cache(&self) {
    info!("清空模型缓存 ({} 个)", self.cache.len());
    self.cache.clear();
  }

  pub fn cached_models(&self) -> usize {
    self.cache.len()
  }
}
