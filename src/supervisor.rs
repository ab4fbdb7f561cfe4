// 该文件是 Shanan （山南西风） 项目的一部分。
// src/supervisor.rs - 后端进程守护
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
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
  #[error("后端进程在 {0:.1?} 内未就绪")]
  StartupTimeout(Duration),
  #[error("未找到后端可执行文件，已尝试: {0:?}")]
  ExecutableNotFound(Vec<PathBuf>),
  #[error("启动后端进程失败: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 确保某一类后端进程在线。
///
/// 同一个守护对象上的调用互斥执行，因此同类后端不会被重复拉起。
/// 每种需要外部进程的后端各持有一个实例。
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
  starting: Mutex<()>,
}

impl ProcessSupervisor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 探活失败时调用一次 `spawn`，随后按 `poll_interval` 轮询探活直至成功或超过 `max_wait`。
  pub fn ensure_running<P, S>(
    &self,
    mut is_up: P,
    spawn: S,
    poll_interval: Duration,
    max_wait: Duration,
  ) -> Result<(), SupervisorError>
  where
    P: FnMut() -> bool,
    S: FnOnce() -> Result<(), SupervisorError>,
  {
    let _starting = self
      .starting
      .lock()
      .unwrap_or_else(PoisonError::into_inner);

    if is_up() {
      return Ok(());
    }

    info!("后端未响应，正在启动后端进程");
    spawn()?;

    let started = Instant::now();
    loop {
      if is_up() {
        info!("后端已就绪，用时 {:.1?}", started.elapsed());
        return Ok(());
      }

      let elapsed = started.elapsed();
      if elapsed >= max_wait {
        warn!("等待后端就绪超时 ({:.1?})", elapsed);
        return Err(SupervisorError::StartupTimeout(elapsed));
      }
      std::thread::sleep(poll_interval.min(max_wait - elapsed));
    }
  }
}

/// 按顺序返回第一个存在的候选路径
pub fn find_executable(candidates: &[PathBuf]) -> Result<PathBuf, SupervisorError> {
  candidates
    .iter()
    .find(|path| path.is_file())
    .cloned()
    .ok_or_else(|| SupervisorError::ExecutableNotFound(candidates.to_vec()))
}

/// 以后台方式启动可执行文件，工作目录为其所在目录，不继承标准输入输出。
///
/// 子进程由后台线程等待回收，返回其 pid。
pub fn spawn_hidden(executable: &Path) -> Result<u32, SupervisorError> {
  let mut cmd = Command::new(executable);
  if let Some(dir) = executable.parent().filter(|d| !d.as_os_str().is_empty()) {
    cmd.current_dir(dir);
  }
  cmd
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null());

  #[cfg(windows)]
  {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
  }

  let mut child = cmd.spawn()?;
  let pid = child.id();
  debug!("已启动 {} (pid {})", executable.display(), pid);

  let name = executable.display().to_string();
  std::thread::Builder::new()
    .name(format!("reap-{pid}"))
    .spawn(move || match child.wait() {
      Ok(status) => info!("后端进程 {} (pid {}) 已退出: {}", name, pid, status),
      Err(e) => warn!("等待后端进程 {} 失败: {}", pid, e),
    })?;
  Ok(pid)
}
