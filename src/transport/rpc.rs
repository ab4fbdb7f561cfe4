// 该文件是 Shanan （山南西风） 项目的一部分。
// src/transport/rpc.rs - 命名管道 RPC 与共享内存后端
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

//! 独立工作进程中的原生模型。
//!
//! 每次调用新建一条连接，发送一行 JSON 请求并读取一行 JSON 响应后关闭。
//! 像素与掩码不经过管道，而是通过一次性的共享内存段传递。

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::{GenericFilePath, GenericNamespaced, Name, Stream, prelude::*};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::{
  BackendKind, InferParams, LiveHandles, ModelHandle, ModelInfo, Release, TransportClient,
  non_empty_positions, scatter_samples,
};
use crate::config::RpcConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::PixelBuffer;
use crate::normalize::{BoxConvention, MaskMaterializer, Normalizer};
use crate::result::{BatchResult, Mask, SampleResult};
use crate::shm::ShmChannel;
use crate::supervisor::{ProcessSupervisor, find_executable, spawn_hidden};

const KIND: BackendKind = BackendKind::PipeRpc;

/// 一次 RPC 调用的失败原因
enum RpcFailure {
  /// 连接、读写或超时
  Io(io::Error),
  /// 响应为空或不是 JSON
  Malformed(String),
}

impl From<io::Error> for RpcFailure {
  fn from(err: io::Error) -> Self {
    RpcFailure::Io(err)
  }
}

impl RpcFailure {
  fn into_bridge(self, hard: fn(BackendKind, String) -> BridgeError) -> BridgeError {
    match self {
      RpcFailure::Io(e) => hard(KIND, format!("管道通信失败: {e}")),
      RpcFailure::Malformed(message) => BridgeError::protocol(KIND, message),
    }
  }
}

/// 管道名映射为本地套接字名：支持命名空间的平台直接使用（Windows 命名管道、Linux 抽象套接字），
/// 其余平台退回到临时目录下的套接字文件。
pub fn socket_name(pipe_name: &str) -> io::Result<Name<'_>> {
  if GenericNamespaced::is_supported() {
    pipe_name
      .to_ns_name::<GenericNamespaced>()
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
  } else {
    std::env::temp_dir()
      .join(format!("{pipe_name}.sock"))
      .to_fs_name::<GenericFilePath>()
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
  }
}

/// `ok` 为假时取出 `error` 字段
fn rejection(response: &Value) -> Option<String> {
  if response.get("ok").and_then(Value::as_bool) == Some(true) {
    return None;
  }
  Some(
    response
      .get("error")
      .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
      .unwrap_or_else(|| "rpc_no_error_message".to_string()),
  )
}

/// 从工作进程写出的掩码段拷贝掩码；段读取失败只让该检测没有掩码
struct SegmentMasks<'a> {
  channel: &'a ShmChannel,
}

impl MaskMaterializer for SegmentMasks<'_> {
  fn materialize(&self, mask: &Value) -> Option<Mask> {
    let token = mask.get("mmf_token")?.as_str()?;
    let width = mask.get("width")?.as_u64()?;
    let height = mask.get("height")?.as_u64()?;
    if token.is_empty() || width == 0 || height == 0 {
      return None;
    }

    match self.channel.take_mask(token, width as u32, height as u32) {
      Ok(mask) => Some(mask),
      Err(e) => {
        warn!("读取掩码共享内存失败 ({}): {}", token, e);
        None
      }
    }
  }
}

pub struct PipeRpcClient {
  config: RpcConfig,
  shm: ShmChannel,
  supervisor: Arc<ProcessSupervisor>,
  live: LiveHandles,
}

impl PipeRpcClient {
  pub fn new(config: RpcConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
    let shm = config
      .shm_dir
      .clone()
      .map(ShmChannel::new)
      .unwrap_or_default();
    Self {
      config,
      shm,
      supervisor,
      live: LiveHandles::default(),
    }
  }

  pub fn shm_channel(&self) -> &ShmChannel {
    &self.shm
  }

  fn call(&self, request: &Value, timeout: Duration) -> Result<Value, RpcFailure> {
    let stream = Stream::connect(socket_name(&self.config.pipe_name)?)?;
    let _ = stream.set_recv_timeout(Some(timeout));
    let _ = stream.set_send_timeout(Some(timeout));

    let mut stream = BufReader::new(stream);
    let mut line = request.to_string();
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes())?;
    stream.get_mut().flush()?;

    let mut response = String::new();
    if stream.read_line(&mut response)? == 0 || response.trim().is_empty() {
      return Err(RpcFailure::Malformed("工作进程未返回任何响应".to_string()));
    }
    serde_json::from_str(response.trim())
      .map_err(|e| RpcFailure::Malformed(format!("响应无法解析: {e}")))
  }

  /// 发送 `{"action":"ping"}`，短超时内收到 `{"pong":true}` 即在线
  pub fn ping(&self) -> bool {
    match self.call(&json!({ "action": "ping" }), self.config.ping_timeout) {
      Ok(response) => response.get("pong").and_then(Value::as_bool) == Some(true),
      Err(_) => false,
    }
  }

  pub fn ensure_worker(&self) -> BridgeResult<()> {
    self
      .supervisor
      .ensure_running(
        || self.ping(),
        || {
          let exe = find_executable(&self.config.executable_candidates)?;
          info!("启动 RPC 工作进程: {}", exe.display());
          spawn_hidden(&exe).map(|_| ())
        },
        self.config.poll_interval,
        self.config.startup_timeout,
      )
      .map_err(|e| BridgeError::from_supervisor(KIND, e))
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
    // 图像段在本函数返回时释放，无论成功与否
    let (token, _segment) = self
      .shm
      .publish_image(image)
      .map_err(|e| BridgeError::infer(KIND, format!("写入图像共享内存失败: {e}")))?;

    let mut request = json!({
      "action": "infer",
      "model_path": path.to_string_lossy(),
      "mmf_token": token,
      "width": image.width(),
      "height": image.height(),
      "channels": image.channels(),
    });
    if !params.is_empty() {
      request["params_json"] = Value::Object(params.as_map().clone());
    }
    debug!("RPC 推理请求: 令牌 {}, {} 字节", token, image.len());

    let response = self
      .call(&request, self.config.call_timeout)
      .map_err(|e| e.into_bridge(BridgeError::infer))?;

    if let Some(reason) = rejection(&response) {
      warn!("工作进程拒绝推理: {}", reason);
      return Ok(SampleResult::default());
    }

    let records = response
      .get("result")
      .and_then(|r| r.get("sample_results"))
      .and_then(|s| s.get(0))
      .and_then(|s| s.get("results"))
      .ok_or_else(|| BridgeError::protocol(KIND, "响应缺少 result.sample_results"))?;

    let masks = SegmentMasks { channel: &self.shm };
    Ok(Normalizer::new(BoxConvention::TopLeftSize, &masks).sample(records))
  }
}

impl TransportClient for PipeRpcClient {
  fn kind(&self) -> BackendKind {
    KIND
  }

  fn load(&self, path: &Path, device_id: i32) -> BridgeResult<ModelHandle> {
    self.ensure_worker()?;

    let request = json!({
      "action": "load_model",
      "model_path": path.to_string_lossy(),
      "device_id": device_id,
    });
    let response = self
      .call(&request, self.config.call_timeout)
      .map_err(|e| e.into_bridge(BridgeError::load))?;

    if let Some(reason) = rejection(&response) {
      error!("RPC 加载模型失败: {}", reason);
      return Err(BridgeError::load(KIND, reason));
    }

    info!("模型已加载到工作进程: {}", path.display());
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

    let request = json!({ "action": "get_model_info", "model_path": path.to_string_lossy() });
    let response = self
      .call(&request, self.config.call_timeout)
      .map_err(|e| e.into_bridge(BridgeError::protocol))?;

    if let Some(reason) = rejection(&response) {
      return Err(BridgeError::protocol(
        KIND,
        format!("获取模型信息失败: {reason}"),
      ));
    }
    let info = response
      .get("model_info")
      .cloned()
      .ok_or_else(|| BridgeError::protocol(KIND, "响应缺少 model_info"))?;
    Ok(ModelInfo::new(KIND, info))
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
    let Ok(path) = Self::model_path(handle) else {
      return;
    };

    let request = json!({ "action": "free_model", "model_path": path.to_string_lossy() });
    match self.call(&request, self.config.call_timeout) {
      Ok(_) => info!("工作进程已释放模型: {}", path.display()),
      Err(RpcFailure::Io(e)) => warn!("释放模型失败: {}", e),
      Err(RpcFailure::Malformed(e)) => warn!("释放模型失败: {}", e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::shm::{image_segment_name, mask_segment_name, new_token};
  use interprocess::local_socket::{ListenerOptions, prelude::*};
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FakeWorker {
    pipe_name: String,
    frees: Arc<AtomicUsize>,
    actions: Arc<Mutex<Vec<String>>>,
  }

  fn respond(channel: &ShmChannel, request: &Value, frees: &AtomicUsize) -> Value {
    match request["action"].as_str().unwrap_or_default() {
      "ping" => json!({ "pong": true }),
      "load_model" if request["model_path"].as_str().unwrap().ends_with("reject.dvo") => {
        json!({ "ok": false, "error": "模型与设备不匹配" })
      }
      "load_model" => json!({ "ok": true }),
      "get_model_info" => json!({
        "ok": true,
        "model_info": { "model_info": { "task_type": "OCR", "character": ["x"], "max_len": 25 } }
      }),
      "free_model" => {
        frees.fetch_add(1, Ordering::SeqCst);
        json!({ "ok": true })
      }
      "infer" => {
        let token = request["mmf_token"].as_str().unwrap();
        let size = (request["width"].as_u64().unwrap()
          * request["height"].as_u64().unwrap()
          * request["channels"].as_u64().unwrap()) as usize;
        let image = channel.open(&image_segment_name(token), size).unwrap();
        let first = image.as_bytes()[0];
        if first == 0 {
          return json!({ "ok": false, "error": "图像全黑" });
        }

        let mask_token = new_token();
        let mut mask = channel.create(&mask_segment_name(&mask_token), 6).unwrap();
        mask.write(&[0, 0, 255, 255, 255, 0]).unwrap();
        mask.hand_over();

        json!({ "ok": true, "result": { "sample_results": [{ "results": [{
          "category_id": first,
          "category_name": "气泡",
          "score": 0.7,
          "bbox": [5, 6, 3, 2],
          "with_mask": true,
          "mask": { "mmf_token": mask_token, "width": 3, "height": 2 }
        }]}]}})
      }
      _ => json!({ "ok": false, "error": "unknown action" }),
    }
  }

  fn spawn_worker(channel: ShmChannel) -> FakeWorker {
    let pipe_name = format!("ShananRpcTest_{}", new_token());
    let listener = ListenerOptions::new()
      .name(socket_name(&pipe_name).unwrap())
      .create_sync()
      .unwrap();
    let frees = Arc::new(AtomicUsize::new(0));
    let actions = Arc::new(Mutex::new(Vec::new()));

    let (thread_frees, thread_actions) = (Arc::clone(&frees), Arc::clone(&actions));
    std::thread::spawn(move || {
      for conn in listener.incoming().flatten() {
        let mut reader = BufReader::new(conn);
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
          continue;
        }
        let request: Value = serde_json::from_str(line.trim()).unwrap();
        thread_actions
          .lock()
          .unwrap()
          .push(request["action"].as_str().unwrap_or_default().to_string());
        let reply = respond(&channel, &request, &thread_frees);
        let _ = reader
          .get_mut()
          .write_all(format!("{reply}\n").as_bytes());
      }
    });

    FakeWorker {
      pipe_name,
      frees,
      actions,
    }
  }

  fn client_for(pipe_name: &str, shm_dir: &Path) -> PipeRpcClient {
    let config = RpcConfig::default()
      .pipe_name(pipe_name)
      .shm_dir(shm_dir)
      .executable_candidates(vec![shm_dir.join("missing-worker")])
      .poll_interval(Duration::from_millis(20))
      .startup_timeout(Duration::from_millis(200));
    PipeRpcClient::new(config, Arc::new(ProcessSupervisor::new()))
  }

  fn pixels(value: u8) -> PixelBuffer {
    PixelBuffer::from_raw(3, 2, 1, vec![value; 6]).unwrap()
  }

  fn leftover_segments(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
  }

  #[test]
  fn ping_without_worker_is_false() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&format!("ShananRpcTest_{}", new_token()), dir.path());
    assert!(!client.ping());
  }

  #[test]
  fn load_infer_free_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let worker = spawn_worker(ShmChannel::new(dir.path()));
    let client = client_for(&worker.pipe_name, dir.path());

    let handle = client.load(Path::new("/m/det.dvo"), 0).unwrap();
    let batch = client
      .infer(
        &handle,
        &[pixels(3), PixelBuffer::empty(), pixels(0), pixels(8)],
        &InferParams::new().threshold(0.3),
      )
      .unwrap();

    assert_eq!(batch.len(), 4);
    let det = &batch.samples[0].detections[0];
    assert_eq!(det.category_id, 3);
    assert_eq!(det.bbox.unwrap().to_array(), [5.0, 6.0, 3.0, 2.0]);
    assert_eq!(det.mask.as_ref().unwrap().as_bytes(), &[0, 0, 255, 255, 255, 0]);
    assert!(batch.samples[1].is_empty());
    assert!(batch.samples[2].is_empty());
    assert_eq!(batch.samples[3].detections[0].category_id, 8);

    // 图像段与掩码段都已释放
    assert_eq!(leftover_segments(dir.path()), 0);

    client.free(&handle);
    client.free(&handle);
    assert_eq!(worker.frees.load(Ordering::SeqCst), 1);
    assert_eq!(worker.actions.lock().unwrap()[0], "ping");
  }

  #[test]
  fn same_path_stays_loaded_until_last_free() {
    let dir = tempfile::tempdir().unwrap();
    let worker = spawn_worker(ShmChannel::new(dir.path()));
    let client = client_for(&worker.pipe_name, dir.path());

    let first = client.load(Path::new("/m/det.dvo"), 0).unwrap();
    let second = client.load(Path::new("/m/det.dvo"), 1).unwrap();
    assert_ne!(first, second);

    client.free(&first);
    assert_eq!(worker.frees.load(Ordering::SeqCst), 0);
    let batch = client
      .infer(&second, &[pixels(3)], &InferParams::new())
      .unwrap();
    assert_eq!(batch.samples[0].detections[0].category_id, 3);

    client.free(&second);
    assert_eq!(worker.frees.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn rejected_load_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let worker = spawn_worker(ShmChannel::new(dir.path()));
    let client = client_for(&worker.pipe_name, dir.path());
    let err = client.load(Path::new("/m/reject.dvo"), 0).unwrap_err();
    assert!(matches!(
      err,
      BridgeError::Load {
        backend: BackendKind::PipeRpc,
        ..
      }
    ));
  }

  #[test]
  fn model_info_unwraps_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let worker = spawn_worker(ShmChannel::new(dir.path()));
    let client = client_for(&worker.pipe_name, dir.path());
    let handle = client.load(Path::new("/m/ocr.dvo"), 0).unwrap();

    let info = client.model_info(&handle).unwrap();
    assert_eq!(
      info.raw,
      json!({ "model_info": { "task_type": "OCR", "max_len": 25 } })
    );
  }

  #[test]
  fn missing_worker_executable_fails_load() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(&format!("ShananRpcTest_{}", new_token()), dir.path());
    let err = client.load(Path::new("/m/det.dvo"), 0).unwrap_err();
    assert!(matches!(err, BridgeError::Load { .. }));
  }

  #[test]
  fn unreadable_mask_segment_degrades_to_no_mask() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ShmChannel::new(dir.path());
    let masks = SegmentMasks { channel: &channel };
    let record = json!({
      "bbox": [0, 0, 2, 2],
      "with_mask": true,
      "mask": { "mmf_token": "gone", "width": 2, "height": 2 }
    });
    let det = Normalizer::new(BoxConvention::TopLeftSize, &masks).detection(&record);
    assert!(!det.with_mask);
    assert!(det.with_bbox);
  }
}
