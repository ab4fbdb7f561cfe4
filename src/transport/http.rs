// 该文件是 Shanan （山南西风） 项目的一部分。
// src/transport/http.rs - 本地 HTTP 服务后端
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

//! 按需启动的本地推理服务。
//!
//! 业务是否成功看响应体中的 `code` 字段（`"00000"` 为成功），与 HTTP 状态码无关。

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
  BackendKind, InferParams, LiveHandles, ModelHandle, ModelInfo, Release, TransportClient,
  non_empty_positions, scatter_samples,
};
use crate::WithExtensions;
use crate::config::HttpConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::PixelBuffer;
use crate::normalize::{BoxConvention, Normalizer, PolygonOnly};
use crate::result::{BatchResult, SampleResult};
use crate::supervisor::{ProcessSupervisor, SupervisorError, find_executable, spawn_hidden};

const KIND: BackendKind = BackendKind::HttpService;
const SUCCESS_CODE: &str = "00000";

/// 一次 HTTP 调用的失败原因
enum CallError {
  /// 连接失败、超时或非 2xx 状态
  Transport(String),
  /// 响应体不是 JSON
  Parse(String),
}

impl CallError {
  fn into_bridge(self, hard: fn(BackendKind, String) -> BridgeError) -> BridgeError {
    match self {
      CallError::Transport(message) => hard(KIND, message),
      CallError::Parse(message) => BridgeError::protocol(KIND, message),
    }
  }
}

impl From<ureq::Error> for CallError {
  fn from(err: ureq::Error) -> Self {
    match err {
      ureq::Error::Status(code, response) => {
        let body = response.into_string().unwrap_or_default();
        CallError::Transport(format!("HTTP {code}: {body}"))
      }
      ureq::Error::Transport(transport) => CallError::Transport(transport.to_string()),
    }
  }
}

pub struct HttpServiceClient {
  agent: ureq::Agent,
  base_url: Url,
  config: HttpConfig,
  supervisor: Arc<ProcessSupervisor>,
  live: LiveHandles,
}

impl WithExtensions for HttpServiceClient {
  const EXTENSIONS: &'static [&'static str] = &["dvp"];
}

impl HttpServiceClient {
  pub fn new(config: HttpConfig, supervisor: Arc<ProcessSupervisor>) -> BridgeResult<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| BridgeError::load(KIND, format!("服务地址无效 {}: {e}", config.base_url)))?;
    let agent = ureq::AgentBuilder::new()
      .timeout(config.request_timeout)
      .build();

    Ok(Self {
      agent,
      base_url,
      config,
      supervisor,
      live: LiveHandles::default(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, CallError> {
    self
      .base_url
      .join(path)
      .map_err(|e| CallError::Transport(format!("无法拼接地址 {path}: {e}")))
  }

  /// `GET /docs` 返回 2xx 即视为在线
  pub fn is_alive(&self) -> bool {
    let Ok(url) = self.endpoint("/docs") else {
      return false;
    };
    match self
      .agent
      .get(url.as_str())
      .timeout(self.config.docs_timeout)
      .call()
    {
      Ok(_) => true,
      Err(e) => {
        debug!("服务探活失败: {}", e);
        false
      }
    }
  }

  /// 服务不在线时启动服务进程并等待就绪
  pub fn ensure_service(&self) -> BridgeResult<()> {
    self
      .supervisor
      .ensure_running(
        || self.is_alive(),
        || {
          let exe = find_executable(std::slice::from_ref(&self.config.service_executable))?;
          info!("启动推理服务: {}", exe.display());
          spawn_hidden(&exe).map(|_| ())
        },
        self.config.poll_interval,
        self.config.startup_timeout,
      )
      .map_err(|e: SupervisorError| BridgeError::from_supervisor(KIND, e))
  }

  fn post(&self, path: &str, body: &Value) -> Result<Value, CallError> {
    let url = self.endpoint(path)?;
    let response = self.agent.post(url.as_str()).send_json(body)?;
    response
      .into_json::<Value>()
      .map_err(|e| CallError::Parse(format!("{path} 响应无法解析: {e}")))
  }

  /// 诊断用途，失败只记录日志
  fn log_version(&self) {
    let result = self.endpoint("/version").and_then(|url| {
      let response = self.agent.get(url.as_str()).call()?;
      response
        .into_string()
        .map_err(|e| CallError::Transport(e.to_string()))
    });
    match result {
      Ok(version) => info!("推理服务版本: {}", version.trim()),
      Err(CallError::Transport(e) | CallError::Parse(e)) => warn!("获取服务版本失败: {}", e),
    }
  }

  fn model_path(handle: &ModelHandle) -> BridgeResult<&Path> {
    match handle {
      ModelHandle::Loaded { path, .. } => Ok(path.as_path()),
      ModelHandle::Index(_) => Err(BridgeError::InvalidInput(format!(
        "[{KIND}] 句柄类型不匹配: {handle:?}"
      ))),
    }
  }

  fn infer_one(
    &self,
    path: &Path,
    image: &PixelBuffer,
    params: &InferParams,
  ) -> BridgeResult<SampleResult> {
    let png = image
      .encode_png()
      .map_err(|e| BridgeError::InvalidInput(format!("图像编码失败: {e}")))?;

    let mut request = Map::new();
    request.insert("img".into(), json!(BASE64.encode(&png)));
    request.insert("model_path".into(), json!(path.to_string_lossy()));
    request.insert("return_polygon".into(), json!(true));
    params.merge_into(&mut request);
    debug!("推理请求: 图像 {} 字节 (PNG)", png.len());

    let response = self
      .post("/api/inference", &Value::Object(request))
      .map_err(|e| e.into_bridge(BridgeError::infer))?;

    match response.get("results") {
      Some(records @ Value::Array(_)) => {
        Ok(Normalizer::new(BoxConvention::Corners, &PolygonOnly).sample(records))
      }
      _ => {
        warn!("推理服务未返回 results: {}", response);
        Ok(SampleResult::default())
      }
    }
  }
}

impl TransportClient for HttpServiceClient {
  fn kind(&self) -> BackendKind {
    KIND
  }

  fn load(&self, path: &Path, _device_id: i32) -> BridgeResult<ModelHandle> {
    self.ensure_service()?;

    let response = self
      .post("/load_model", &json!({ "model_path": path.to_string_lossy() }))
      .map_err(|e| e.into_bridge(BridgeError::load))?;

    let code = response.get("code").and_then(Value::as_str);
    if code != Some(SUCCESS_CODE) {
      error!("服务拒绝加载模型: {}", response);
      return Err(BridgeError::load(
        KIND,
        format!("错误码 {}: {}", code.unwrap_or("未知"), response),
      ));
    }

    info!("模型已加载到推理服务: {}", path.display());
    self.log_version();

    Ok(self.live.issue_loaded(path))
  }

  fn infer(
    &self,
    handle: &ModelHandle,
    images: &[PixelBuffer],
    params: &InferParams,
  ) -> BridgeResult<BatchResult> {
    self.live.check(KIND, handle)?;
    let path = Self::model_path(handle)?;

    // 服务一次只接受一张图像
    let positions = non_empty_positions(KIND, images);
    let samples = positions
      .iter()
      .map(|&idx| self.infer_one(path, &images[idx], params))
      .collect::<BridgeResult<Vec<_>>>()?;

    Ok(scatter_samples(KIND, images.len(), &positions, samples))
  }

  fn model_info(&self, handle: &ModelHandle) -> BridgeResult<ModelInfo> {
    self.live.check(KIND, handle)?;
    let path = Self::model_path(handle)?;
    let response = self
      .post(
        "/get_model_info",
        &json!({ "model_path": path.to_string_lossy() }),
      )
      .map_err(|e| e.into_bridge(BridgeError::protocol))?;
    Ok(ModelInfo::new(KIND, response))
  }

  fn free(&self, handle: &ModelHandle) {
    match self.live.release(handle) {
      Release::Unknown => {
        debug!("句柄 {:?} 已释放，忽略", handle);
        return;
      }
      Release::StillShared => {
        debug!("模型仍有其他句柄在用，暂不卸载: {:?}", handle);
        return;
      }
      Release::Last => {}
    }

    match self.post("/free_model", &json!({ "model_index": handle.wire_index() })) {
      Ok(response) => info!("推理服务已释放模型: {}", response),
      Err(CallError::Transport(e) | CallError::Parse(e)) => warn!("释放模型失败: {}", e),
    }
  }
}
