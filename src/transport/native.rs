// 该文件是 Shanan （山南西风） 项目的一部分。
// src/transport/native.rs - 进程内原生库后端
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

//! 通过 C ABI 直接调用推理引擎。
//!
//! 所有请求与响应都是 JSON 字符串；引擎返回的字符串由调用方释放。
//! 掩码以 `{mask_ptr, width, height}` 给出，指针在结果释放后失效。

use std::ffi::{CStr, CString, c_char};
use std::marker::PhantomData;
use std::path::Path;

use libloading::Library;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use super::{
  BackendKind, InferParams, LiveHandles, ModelHandle, ModelInfo, Release, TransportClient,
  non_empty_positions, scatter_samples,
};
use crate::config::NativeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::frame::PixelBuffer;
use crate::normalize::{BoxConvention, MaskMaterializer, Normalizer};
use crate::result::{BatchResult, Mask};

const KIND: BackendKind = BackendKind::Native;

pub type JsonCallFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
pub type FreeFn = unsafe extern "C" fn(*mut c_char);

/// 引擎导出的函数表
#[derive(Clone, Copy)]
pub struct NativeApi {
  pub load_model: JsonCallFn,
  pub free_model: JsonCallFn,
  pub get_model_info: JsonCallFn,
  pub infer: JsonCallFn,
  pub free_result: FreeFn,
  pub free_model_result: FreeFn,
}

impl NativeApi {
  /// 从已加载的动态库中解析全部符号
  ///
  /// # Safety
  /// 动态库必须以约定的签名导出这些符号，且返回的函数指针只能在 `library` 存活期间使用。
  unsafe fn resolve(library: &Library) -> Result<Self, libloading::Error> {
    unsafe {
      Ok(Self {
        load_model: *library.get::<JsonCallFn>(b"shanan_load_model\0")?,
        free_model: *library.get::<JsonCallFn>(b"shanan_free_model\0")?,
        get_model_info: *library.get::<JsonCallFn>(b"shanan_get_model_info\0")?,
        infer: *library.get::<JsonCallFn>(b"shanan_infer\0")?,
        free_result: *library.get::<FreeFn>(b"shanan_free_result\0")?,
        free_model_result: *library.get::<FreeFn>(b"shanan_free_model_result\0")?,
      })
    }
  }
}

/// 引擎返回的字符串，析构时交还引擎释放
struct NativeResult {
  ptr: *mut c_char,
  free: FreeFn,
}

impl NativeResult {
  fn json(&self) -> BridgeResult<Value> {
    // SAFETY: ptr 非空且由引擎保证以 NUL 结尾，在本对象析构前有效
    let text = unsafe { CStr::from_ptr(self.ptr) }.to_string_lossy();
    serde_json::from_str(&text)
      .map_err(|e| BridgeError::protocol(KIND, format!("引擎返回的 JSON 无法解析: {e}")))
  }
}

impl Drop for NativeResult {
  fn drop(&mut self) {
    // SAFETY: ptr 由同一引擎分配，且只释放一次
    unsafe { (self.free)(self.ptr) };
  }
}

/// 从原生指针拷贝掩码；生命周期绑定在尚未释放的推理结果上
struct PointerMasks<'r> {
  _result: PhantomData<&'r NativeResult>,
}

impl<'r> PointerMasks<'r> {
  fn borrowing(_result: &'r NativeResult) -> Self {
    Self {
      _result: PhantomData,
    }
  }
}

impl MaskMaterializer for PointerMasks<'_> {
  fn materialize(&self, mask: &Value) -> Option<Mask> {
    let ptr = mask
      .get("mask_ptr")
      .and_then(|p| p.as_u64().or_else(|| p.as_i64().map(|v| v as u64)))?;
    let width = mask.get("width")?.as_i64()?;
    let height = mask.get("height")?.as_i64()?;
    if ptr == 0 || width <= 0 || height <= 0 {
      return None;
    }

    let len = width as usize * height as usize;
    // SAFETY: 推理结果尚未释放，引擎保证 mask_ptr 指向 width*height 字节的单通道数据
    let bytes = unsafe { std::slice::from_raw_parts(ptr as usize as *const u8, len) }.to_vec();
    Mask::new(width as u32, height as u32, bytes)
  }
}

pub struct InProcessLibraryClient {
  api: NativeApi,
  live: LiveHandles,
  // 函数表中的指针依赖动态库存活，必须最后释放
  _library: Option<Library>,
}

impl InProcessLibraryClient {
  pub fn open(config: &NativeConfig) -> BridgeResult<Self> {
    let path = &config.library_path;
    info!("加载推理引擎动态库: {}", path.display());

    // SAFETY: 信任引擎动态库以约定签名导出符号；函数表与库一同保存在客户端中
    let (library, api) = unsafe {
      let library = Library::new(path).map_err(|e| {
        BridgeError::load(KIND, format!("无法加载动态库 {}: {e}", path.display()))
      })?;
      let api = NativeApi::resolve(&library)
        .map_err(|e| BridgeError::load(KIND, format!("动态库缺少导出符号: {e}")))?;
      (library, api)
    };

    Ok(Self {
      api,
      live: LiveHandles::default(),
      _library: Some(library),
    })
  }

  /// 直接使用给定的函数表（静态链接的引擎或测试替身）
  pub fn from_api(api: NativeApi) -> Self {
    Self {
      api,
      live: LiveHandles::default(),
      _library: None,
    }
  }

  fn call(&self, func: JsonCallFn, free: FreeFn, request: &Value) -> BridgeResult<NativeResult> {
    let request = CString::new(request.to_string())
      .map_err(|e| BridgeError::InvalidInput(format!("请求中含有 NUL 字符: {e}")))?;

    // SAFETY: request 在调用期间有效；返回值为空时不交给释放函数
    let ptr = unsafe { func(request.as_ptr()) };
    if ptr.is_null() {
      return Err(BridgeError::protocol(KIND, "引擎返回空指针"));
    }
    Ok(NativeResult { ptr, free })
  }
}

impl TransportClient for InProcessLibraryClient {
  fn kind(&self) -> BackendKind {
    KIND
  }

  fn load(&self, path: &Path, device_id: i32) -> BridgeResult<ModelHandle> {
    let request = json!({
      "model_path": path.to_string_lossy(),
      "device_id": device_id,
    });
    let result = self.call(self.api.load_model, self.api.free_result, &request)?;
    let response = result.json()?;
    debug!("模型加载结果: {}", response);

    match response.get("model_index").and_then(Value::as_i64) {
      Some(index) => {
        let handle = ModelHandle::Index(index);
        self.live.insert(handle.clone());
        info!("模型已加载: {} (index {})", path.display(), index);
        Ok(handle)
      }
      None => {
        error!("模型加载失败: {}", response);
        Err(BridgeError::load(KIND, response.to_string()))
      }
    }
  }

  fn infer(
    &self,
    handle: &ModelHandle,
    images: &[PixelBuffer],
    params: &InferParams,
  ) -> BridgeResult<BatchResult> {
    self.live.check(KIND, handle)?;

    let positions = non_empty_positions(KIND, images);
    if positions.is_empty() {
      return Ok(scatter_samples(KIND, images.len(), &positions, Vec::new()));
    }

    // image_ptr 指向 images 中的连续缓冲，调用返回前一直有效
    let image_list: Vec<Value> = positions
      .iter()
      .map(|&idx| {
        let image = &images[idx];
        json!({
          "width": image.width(),
          "height": image.height(),
          "channels": image.channels(),
          "image_ptr": image.as_bytes().as_ptr() as usize as u64,
        })
      })
      .collect();

    let mut request = Map::new();
    request.insert("model_index".into(), json!(handle.wire_index()));
    request.insert("image_list".into(), Value::Array(image_list));
    params.merge_into(&mut request);

    let result = self.call(
      self.api.infer,
      self.api.free_model_result,
      &Value::Object(request),
    )?;
    let response = result.json()?;

    if let Some(code) = response.get("code").and_then(Value::as_i64) {
      if code != 0 {
        let message = response
          .get("message")
          .map(Value::to_string)
          .unwrap_or_else(|| response.to_string());
        error!("推理失败, 错误码 {}: {}", code, message);
        return Err(BridgeError::infer(KIND, format!("错误码 {code}: {message}")));
      }
    }

    // 掩码必须在 result 析构前拷贝出来
    let masks = PointerMasks::borrowing(&result);
    let batch = Normalizer::new(BoxConvention::TopLeftSize, &masks)
      .batch(&response)
      .ok_or_else(|| BridgeError::protocol(KIND, "响应缺少 sample_results"))?;
    drop(result);

    Ok(scatter_samples(
      KIND,
      images.len(),
      &positions,
      batch.samples,
    ))
  }

  fn model_info(&self, handle: &ModelHandle) -> BridgeResult<ModelInfo> {
    self.live.check(KIND, handle)?;
    let request = json!({ "model_index": handle.wire_index() });
    let result = self.call(self.api.get_model_info, self.api.free_result, &request)?;
    Ok(ModelInfo::new(KIND, result.json()?))
  }

  fn free(&self, handle: &ModelHandle) {
    if self.live.release(handle) == Release::Unknown {
      debug!("句柄 {:?} 已释放，忽略", handle);
      return;
    }

    let request = json!({ "model_index": handle.wire_index() });
    match self
      .call(self.api.free_model, self.api.free_result, &request)
      .and_then(|result| result.json())
    {
      Ok(response) => info!("模型已释放: {}", response),
      Err(e) => warn!("释放模型失败: {}", e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  thread_local! {
    static OUTSTANDING: Cell<i64> = const { Cell::new(0) };
    static FREED_MODELS: Cell<usize> = const { Cell::new(0) };
  }

  static FAKE_MASK: [u8; 6] = [0, 255, 255, 0, 255, 0];

  fn reply(value: Value) -> *mut c_char {
    OUTSTANDING.with(|n| n.set(n.get() + 1));
    CString::new(value.to_string()).unwrap().into_raw()
  }

  fn request(ptr: *const c_char) -> Value {
    let text = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
    serde_json::from_str(text).unwrap()
  }

  extern "C" fn fake_load(req: *const c_char) -> *mut c_char {
    let req = request(req);
    if req["model_path"].as_str().unwrap().ends_with("broken.dvt") {
      reply(json!({ "code": 2, "message": "模型文件损坏" }))
    } else {
      reply(json!({ "model_index": 7 }))
    }
  }

  extern "C" fn fake_free_model(_req: *const c_char) -> *mut c_char {
    FREED_MODELS.with(|n| n.set(n.get() + 1));
    reply(json!({ "code": 0 }))
  }

  extern "C" fn fake_model_info(_req: *const c_char) -> *mut c_char {
    reply(json!({
      "model_info": { "task_type": "OCR", "character": ["甲"], "dict": "甲乙", "classes": ["字"] }
    }))
  }

  extern "C" fn fake_infer(req: *const c_char) -> *mut c_char {
    let req = request(req);
    if req["threshold"].as_f64() == Some(1.0) {
      return reply(json!({ "code": 5, "message": "阈值非法" }));
    }

    let samples: Vec<Value> = req["image_list"]
      .as_array()
      .unwrap()
      .iter()
      .map(|image| {
        let ptr = image["image_ptr"].as_u64().unwrap() as usize as *const u8;
        let len = (image["width"].as_u64().unwrap()
          * image["height"].as_u64().unwrap()
          * image["channels"].as_u64().unwrap()) as usize;
        // 用第一个像素值作为类别，验证指针可读
        let first = unsafe { std::slice::from_raw_parts(ptr, len) }[0];
        json!({ "results": [{
          "category_id": first,
          "category_name": "缺陷",
          "score": 0.9,
          "bbox": [10, 20, 3, 2],
          "with_mask": true,
          "mask": { "mask_ptr": FAKE_MASK.as_ptr() as usize as u64, "width": 3, "height": 2 }
        }]})
      })
      .collect();
    reply(json!({ "code": 0, "sample_results": samples }))
  }

  extern "C" fn fake_free(ptr: *mut c_char) {
    OUTSTANDING.with(|n| n.set(n.get() - 1));
    drop(unsafe { CString::from_raw(ptr) });
  }

  fn client() -> InProcessLibraryClient {
    InProcessLibraryClient::from_api(NativeApi {
      load_model: fake_load,
      free_model: fake_free_model,
      get_model_info: fake_model_info,
      infer: fake_infer,
      free_result: fake_free,
      free_model_result: fake_free,
    })
  }

  fn pixels(value: u8) -> PixelBuffer {
    PixelBuffer::from_raw(2, 2, 3, vec![value; 12]).unwrap()
  }

  #[test]
  fn load_returns_index() {
    let client = client();
    let handle = client.load(Path::new("/m/det.dvt"), 0).unwrap();
    assert_eq!(handle, ModelHandle::Index(7));
    assert_eq!(OUTSTANDING.with(Cell::get), 0);
  }

  #[test]
  fn rejected_load_is_load_error() {
    let client = client();
    let err = client.load(Path::new("/m/broken.dvt"), 0).unwrap_err();
    assert!(matches!(
      err,
      BridgeError::Load {
        backend: BackendKind::Native,
        ..
      }
    ));
    assert_eq!(OUTSTANDING.with(Cell::get), 0);
  }

  #[test]
  fn infer_copies_mask_and_keeps_slots() {
    let client = client();
    let handle = client.load(Path::new("/m/det.dvt"), 0).unwrap();
    let images = vec![pixels(4), PixelBuffer::empty(), pixels(9)];

    let batch = client
      .infer(&handle, &images, &InferParams::new())
      .unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch.samples[1].is_empty());

    let det = &batch.samples[0].detections[0];
    assert_eq!(det.category_id, 4);
    assert_eq!(batch.samples[2].detections[0].category_id, 9);
    assert_eq!(det.bbox.unwrap().to_array(), [10.0, 20.0, 3.0, 2.0]);
    assert!(det.with_mask);
    assert_eq!(det.mask.as_ref().unwrap().as_bytes(), &FAKE_MASK);
    assert_eq!(det.area, 6.0);
    assert_eq!(OUTSTANDING.with(Cell::get), 0);
  }

  #[test]
  fn engine_error_code_fails_and_frees() {
    let client = client();
    let handle = client.load(Path::new("/m/det.dvt"), 0).unwrap();
    let err = client
      .infer(&handle, &[pixels(1)], &InferParams::new().threshold(1.0))
      .unwrap_err();
    assert!(matches!(err, BridgeError::Infer { .. }));
    assert_eq!(OUTSTANDING.with(Cell::get), 0);
  }

  #[test]
  fn model_info_strips_ocr_fields() {
    let client = client();
    let handle = client.load(Path::new("/m/ocr.dvt"), 0).unwrap();
    let info = client.model_info(&handle).unwrap();
    let inner = info.raw["model_info"].as_object().unwrap();
    assert_eq!(inner.len(), 1);
    assert_eq!(info.task_type(), Some("OCR"));
  }

  #[test]
  fn free_is_idempotent() {
    let client = client();
    let handle = client.load(Path::new("/m/det.dvt"), 0).unwrap();
    client.free(&handle);
    client.free(&handle);
    client.free(&ModelHandle::Index(99));
    assert_eq!(FREED_MODELS.with(Cell::get), 1);
    assert!(client.infer(&handle, &[pixels(1)], &InferParams::new()).is_err());
    assert_eq!(OUTSTANDING.with(Cell::get), 0);
  }
}
