// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 后端配置
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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] serde_json::Error),
}

/// 时长在配置文件中以毫秒整数表示
mod millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

/// 当前可执行文件所在目录，取不到时为当前目录
fn exe_dir() -> PathBuf {
  std::env::current_exe()
    .ok()
    .and_then(|exe| exe.parent().map(Path::to_path_buf))
    .unwrap_or_else(|| PathBuf::from("."))
}

fn exe_name(stem: &str) -> String {
  format!("{stem}{}", std::env::consts::EXE_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub base_url: String,
  pub service_executable: PathBuf,
  #[serde(with = "millis")]
  pub request_timeout: Duration,
  #[serde(with = "millis")]
  pub docs_timeout: Duration,
  #[serde(with = "millis")]
  pub poll_interval: Duration,
  #[serde(with = "millis")]
  pub startup_timeout: Duration,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      base_url: "http://127.0.0.1:9890".to_string(),
      service_executable: exe_dir().join(exe_name("ShananInferService")),
      request_timeout: Duration::from_secs(30),
      docs_timeout: Duration::from_secs(2),
      poll_interval: Duration::from_millis(200),
      startup_timeout: Duration::from_secs(30),
    }
  }
}

impl HttpConfig {
  pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
    self.base_url = base_url.into();
    self
  }

  pub fn service_executable(mut self, path: impl Into<PathBuf>) -> Self {
    self.service_executable = path.into();
    self
  }

  pub fn startup_timeout(mut self, timeout: Duration) -> Self {
    self.startup_timeout = timeout;
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
  pub pipe_name: String,
  /// 按顺序尝试，第一个存在的文件被启动
  pub executable_candidates: Vec<PathBuf>,
  /// 共享内存目录，未设置时取 `SHANAN_SHM_DIR` 或平台默认位置
  pub shm_dir: Option<PathBuf>,
  #[serde(with = "millis")]
  pub ping_timeout: Duration,
  #[serde(with = "millis")]
  pub call_timeout: Duration,
  #[serde(with = "millis")]
  pub poll_interval: Duration,
  #[serde(with = "millis")]
  pub startup_timeout: Duration,
}

impl Default for RpcConfig {
  fn default() -> Self {
    let fixed = if cfg!(windows) {
      PathBuf::from(r"C:\Program Files\Shanan\ShananModelRpc.exe")
    } else {
      PathBuf::from("/opt/shanan/bin/ShananModelRpc")
    };

    Self {
      pipe_name: "ShananModelRpcPipe".to_string(),
      executable_candidates: vec![exe_dir().join(exe_name("ShananModelRpc")), fixed],
      shm_dir: None,
      ping_timeout: Duration::from_millis(200),
      call_timeout: Duration::from_secs(300),
      poll_interval: Duration::from_millis(200),
      startup_timeout: Duration::from_secs(15),
    }
  }
}

impl RpcConfig {
  pub fn pipe_name(mut self, name: impl Into<String>) -> Self {
    self.pipe_name = name.into();
    self
  }

  pub fn executable_candidates(mut self, candidates: Vec<PathBuf>) -> Self {
    self.executable_candidates = candidates;
    self
  }

  pub fn shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.shm_dir = Some(dir.into());
    self
  }

  pub fn call_timeout(mut self, timeout: Duration) -> Self {
    self.call_timeout = timeout;
    self
  }

  pub fn startup_timeout(mut self, timeout: Duration) -> Self {
    self.startup_timeout = timeout;
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
  pub library_path: PathBuf,
}

impl Default for NativeConfig {
  fn default() -> Self {
    Self {
      library_path: exe_dir().join(libloading::library_filename("shanan_infer")),
    }
  }
}

impl NativeConfig {
  pub fn library_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.library_path = path.into();
    self
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// 调用方未显式指定时是否走缓存
  pub enabled: bool,
  #[serde(with = "millis")]
  pub poll_interval: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      poll_interval: Duration::from_millis(10),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
  pub http: HttpConfig,
  pub rpc: RpcConfig,
  pub native: NativeConfig,
  pub cache: CacheConfig,
}

impl BridgeConfig {
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
  }

  pub fn http(mut self, http: HttpConfig) -> Self {
    self.http = http;
    self
  }

  pub fn rpc(mut self, rpc: RpcConfig) -> Self {
    self.rpc = rpc;
    self
  }

  pub fn native(mut self, native: NativeConfig) -> Self {
    self.native = native;
    self
  }

  pub fn cache_enabled(mut self, enabled: bool) -> Self {
    self.cache.enabled = enabled;
    self
  }
}
