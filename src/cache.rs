// 该文件是 Shanan （山南西风） 项目的一部分。
// src/cache.rs - 模型缓存
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

//! 已加载模型的缓存。
//!
//! 同一个键在任意时刻至多只有一次加载在进行：后来的调用方轮询等待，
//! 加载完成后直接复用结果。加载本身不在锁内执行。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::transport::TransportMode;

/// 缓存键：规范化后的路径（不区分大小写）、设备号与传输方式
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
  path: String,
  device_id: i32,
  mode: TransportMode,
}

impl ModelKey {
  pub fn new(path: &Path, device_id: i32, mode: TransportMode) -> Self {
    let resolved = std::fs::canonicalize(path)
      .or_else(|_| std::path::absolute(path))
      .unwrap_or_else(|_| path.to_path_buf());
    Self {
      path: resolved.to_string_lossy().to_lowercase(),
      device_id,
      mode,
    }
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn device_id(&self) -> i32 {
    self.device_id
  }

  pub fn mode(&self) -> TransportMode {
    self.mode
  }
}

struct CacheState<V> {
  entries: HashMap<ModelKey, V>,
  /// 正在加载的键及其所属的代，`clear` 之后旧代的加载不再影响新代
  loading: HashMap<ModelKey, u64>,
  generation: u64,
}

pub struct ModelCache<V> {
  state: Mutex<CacheState<V>>,
  poll_interval: Duration,
}

impl<V: Clone> Default for ModelCache<V> {
  fn default() -> Self {
    Self::new(Duration::from_millis(10))
  }
}

impl<V: Clone> ModelCache<V> {
  pub fn new(poll_interval: Duration) -> Self {
    Self {
      state: Mutex::new(CacheState {
        entries: HashMap::new(),
        loading: HashMap::new(),
        generation: 0,
      }),
      poll_interval,
    }
  }

  fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 取出 `key` 对应的值；不存在时由当前调用方执行 `load`。
  ///
  /// 加载失败时不写入任何内容，错误原样返回，之后的调用方可以重试。
  pub fn acquire<F, E>(&self, key: &ModelKey, load: F) -> Result<V, E>
  where
    F: FnOnce() -> Result<V, E>,
  {
    let generation = loop {
      {
        let mut state = self.lock();
        if let Some(value) = state.entries.get(key) {
          trace!("缓存命中 {}", key.path);
          return Ok(value.clone());
        }
        if !state.loading.contains_key(key) {
          let generation = state.generation;
          state.loading.insert(key.clone(), generation);
          break generation;
        }
      }
      std::thread::sleep(self.poll_interval);
    };

    let _marker = LoadingMarker {
      cache: self,
      key,
      generation,
    };
    debug!("缓存未命中，加载 {}", key.path);
    let value = load()?;

    let mut state = self.lock();
    if state.generation == generation {
      state.entries.insert(key.clone(), value.clone());
    } else {
      debug!("加载期间缓存已清空，结果不写入 {}", key.path);
    }
    drop(state);
    Ok(value)
  }

  pub fn get(&self, key: &ModelKey) -> Option<V> {
    self.lock().entries.get(key).cloned()
  }

  pub fn contains(&self, key: &ModelKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  /// 清空所有条目与加载标记
  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.loading.clear();
    state.generation += 1;
  }
}

/// 加载期间占用的标记，无论成功、失败或 panic 都会在析构时撤销
struct LoadingMarker<'a, V: Clone> {
  cache: &'a ModelCache<V>,
  key: &'a ModelKey,
  generation: u64,
}

impl<V: Clone> Drop for LoadingMarker<'_, V> {
  fn drop(&mut self) {
    let mut state = self.cache.lock();
    if state.loading.get(self.key) == Some(&self.generation) {
      state.loading.remove(self.key);
    }
  }
}
