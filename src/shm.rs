// 该文件是 Shanan （山南西风） 项目的一部分。
// src/shm.rs - 跨进程共享内存段
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

//! 命名共享内存段。
//!
//! 两端只交换令牌，段名由令牌推出，因此段必须放在对端按名字就能找到的位置：
//! Linux 下直接放在 `/dev/shm` 根目录（即 `shm_open("/<name>")` 的命名空间），
//! Windows 下为 `Local\<name>` 命名的页面文件映射。
//! 也可以指定一个目录作为命名空间，两端约定同一目录即可。
//! 每个段只用一次：创建后立即使用，用完立即释放。

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::frame::PixelBuffer;
use crate::result::Mask;

/// 图像段名前缀，后接一次性随机令牌
pub const IMAGE_SEGMENT_PREFIX: &str = "ShananImage_";
/// 掩码段名前缀，后接工作进程返回的令牌
pub const MASK_SEGMENT_PREFIX: &str = "ShananMask_";

const SHM_DIR_ENV: &str = "SHANAN_SHM_DIR";

#[derive(Error, Debug)]
pub enum ShmError {
  #[error("共享内存 I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("共享内存段大小不符: 期望 {expected} 字节, 实际 {actual} 字节")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("共享内存段名无效: {0}")]
  InvalidName(String),
  #[error("共享内存段长度不能为 0")]
  Empty,
}

pub fn new_token() -> String {
  Uuid::new_v4().simple().to_string()
}

pub fn image_segment_name(token: &str) -> String {
  format!("{IMAGE_SEGMENT_PREFIX}{token}")
}

pub fn mask_segment_name(token: &str) -> String {
  format!("{MASK_SEGMENT_PREFIX}{token}")
}

#[derive(Debug)]
enum Backing {
  /// 目录中的文件，映射到内存
  File {
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
  },
  #[cfg(windows)]
  Named(named::NamedMapping),
}

/// 已映射的共享内存段。`owner` 为真时在析构时删除该段。
///
/// Windows 命名映射在最后一个句柄关闭时由系统回收，`owner` 对其不起作用。
#[derive(Debug)]
pub struct ShmSegment {
  name: String,
  backing: Backing,
  size: usize,
  owner: bool,
}

impl ShmSegment {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  pub fn is_owner(&self) -> bool {
    self.owner
  }

  pub fn as_bytes(&self) -> &[u8] {
    match &self.backing {
      Backing::File { mmap, .. } => &mmap[..self.size],
      #[cfg(windows)]
      Backing::Named(mapping) => mapping.as_slice(),
    }
  }

  pub fn write(&mut self, bytes: &[u8]) -> Result<(), ShmError> {
    if bytes.len() != self.size {
      return Err(ShmError::SizeMismatch {
        expected: self.size,
        actual: bytes.len(),
      });
    }
    match &mut self.backing {
      Backing::File { mmap, .. } => {
        mmap[..bytes.len()].copy_from_slice(bytes);
        mmap.flush()?;
      }
      #[cfg(windows)]
      Backing::Named(mapping) => mapping.as_mut_slice().copy_from_slice(bytes),
    }
    Ok(())
  }

  /// 交出段的所有权：本端不再删除，由对端打开后负责释放
  pub fn hand_over(mut self) {
    self.owner = false;
  }
}

impl Drop for ShmSegment {
  #[cfg_attr(not(windows), allow(irrefutable_let_patterns))]
  fn drop(&mut self) {
    if let Backing::File { path, .. } = &self.backing {
      if self.owner && path.exists() {
        trace!("释放共享内存段 {}", path.display());
        let _ = std::fs::remove_file(path);
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Namespace {
  Dir(PathBuf),
  #[cfg(windows)]
  Kernel,
}

/// 共享内存通道：决定段所在的命名空间，负责创建与打开。
#[derive(Debug, Clone)]
pub struct ShmChannel {
  namespace: Namespace,
}

impl Default for ShmChannel {
  fn default() -> Self {
    if let Some(dir) = std::env::var_os(SHM_DIR_ENV) {
      return Self::new(dir);
    }

    #[cfg(windows)]
    {
      Self {
        namespace: Namespace::Kernel,
      }
    }
    #[cfg(not(windows))]
    {
      let dev_shm = Path::new("/dev/shm");
      if cfg!(target_os = "linux") && dev_shm.is_dir() {
        Self::new(dev_shm)
      } else {
        Self::new(std::env::temp_dir().join("shanan-shm"))
      }
    }
  }
}

impl ShmChannel {
  /// 以目录为命名空间
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      namespace: Namespace::Dir(dir.into()),
    }
  }

  /// 目录命名空间下返回该目录
  pub fn dir(&self) -> Option<&Path> {
    match &self.namespace {
      Namespace::Dir(dir) => Some(dir),
      #[cfg(windows)]
      Namespace::Kernel => None,
    }
  }

  fn check_name(name: &str) -> Result<(), ShmError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
      return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(())
  }

  /// 新建一个段；同名段已存在时失败
  pub fn create(&self, name: &str, size: usize) -> Result<ShmSegment, ShmError> {
    if size == 0 {
      return Err(ShmError::Empty);
    }
    Self::check_name(name)?;

    let backing = match &self.namespace {
      Namespace::Dir(dir) => {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let file = OpenOptions::new()
          .read(true)
          .write(true)
          .create_new(true)
          .open(&path)?;
        file.set_len(size as u64)?;

        // SAFETY: 文件刚以 create_new 创建并设置为 size 字节，映射长度与文件长度一致
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        Backing::File {
          mmap,
          _file: file,
          path,
        }
      }
      #[cfg(windows)]
      Namespace::Kernel => Backing::Named(named::NamedMapping::create(name, size)?),
    };

    debug!("创建共享内存段 {} ({} 字节)", name, size);
    Ok(ShmSegment {
      name: name.to_string(),
      backing,
      size,
      owner: true,
    })
  }

  /// 打开对端创建的段，不负责释放
  pub fn open(&self, name: &str, size: usize) -> Result<ShmSegment, ShmError> {
    self.open_with(name, size, false)
  }

  /// 打开对端创建的段并接管其生命周期：析构时删除
  pub fn open_claimed(&self, name: &str, size: usize) -> Result<ShmSegment, ShmError> {
    self.open_with(name, size, true)
  }

  fn open_with(&self, name: &str, size: usize, owner: bool) -> Result<ShmSegment, ShmError> {
    if size == 0 {
      return Err(ShmError::Empty);
    }
    Self::check_name(name)?;

    let backing = match &self.namespace {
      Namespace::Dir(dir) => {
        let path = dir.join(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let actual = file.metadata()?.len() as usize;
        if actual < size {
          if owner {
            let _ = std::fs::remove_file(&path);
          }
          return Err(ShmError::SizeMismatch {
            expected: size,
            actual,
          });
        }

        // SAFETY: 文件长度已确认不小于映射长度
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        Backing::File {
          mmap,
          _file: file,
          path,
        }
      }
      #[cfg(windows)]
      Namespace::Kernel => Backing::Named(named::NamedMapping::open(name, size)?),
    };

    Ok(ShmSegment {
      name: name.to_string(),
      backing,
      size,
      owner,
    })
  }

  /// 把像素写入新的图像段，返回令牌与段（段析构即释放）
  pub fn publish_image(&self, pixels: &PixelBuffer) -> Result<(String, ShmSegment), ShmError> {
    let token = new_token();
    let mut segment = self.create(&image_segment_name(&token), pixels.len())?;
    segment.write(pixels.as_bytes())?;
    Ok((token, segment))
  }

  /// 读取工作进程写出的掩码段，拷贝为自有掩码后删除该段
  pub fn take_mask(&self, token: &str, width: u32, height: u32) -> Result<Mask, ShmError> {
    let size = width as usize * height as usize;
    let segment = self.open_claimed(&mask_segment_name(token), size)?;
    let data = segment.as_bytes().to_vec();
    drop(segment);

    Mask::new(width, height, data).ok_or(ShmError::SizeMismatch {
      expected: size,
      actual: 0,
    })
  }
}

/// 页面文件支持的命名映射
#[cfg(windows)]
mod named {
  use std::io;

  use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
  };
  use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE,
    UnmapViewOfFile,
  };

  #[derive(Debug)]
  pub(super) struct NamedMapping {
    handle: HANDLE,
    ptr: *mut u8,
    size: usize,
  }

  // SAFETY: 映射视图属于整个进程，没有线程局部状态；可变访问经由 &mut self
  unsafe impl Send for NamedMapping {}
  unsafe impl Sync for NamedMapping {}

  fn wide_name(name: &str) -> Vec<u16> {
    format!("Local\\{name}")
      .encode_utf16()
      .chain(std::iter::once(0))
      .collect()
  }

  impl NamedMapping {
    pub(super) fn create(name: &str, size: usize) -> io::Result<Self> {
      let wide = wide_name(name);
      // SAFETY: INVALID_HANDLE_VALUE 表示页面文件支持；名字是以 0 结尾的宽字符串
      let handle = unsafe {
        CreateFileMappingW(
          INVALID_HANDLE_VALUE,
          std::ptr::null(),
          PAGE_READWRITE,
          (size as u64 >> 32) as u32,
          size as u32,
          wide.as_ptr(),
        )
      };
      if handle == 0 {
        return Err(io::Error::last_os_error());
      }
      // SAFETY: 紧接在 CreateFileMappingW 之后读取
      if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
        // SAFETY: handle 来自上面的 CreateFileMappingW
        unsafe { CloseHandle(handle) };
        return Err(io::Error::new(
          io::ErrorKind::AlreadyExists,
          format!("共享内存段已存在: {name}"),
        ));
      }
      Self::map(handle, size)
    }

    pub(super) fn open(name: &str, size: usize) -> io::Result<Self> {
      let wide = wide_name(name);
      // SAFETY: 名字是以 0 结尾的宽字符串
      let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide.as_ptr()) };
      if handle == 0 {
        return Err(io::Error::last_os_error());
      }
      Self::map(handle, size)
    }

    fn map(handle: HANDLE, size: usize) -> io::Result<Self> {
      // SAFETY: handle 是有效的映射句柄；视图长度超过映射大小时调用失败
      let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
      if ptr.is_null() {
        let err = io::Error::last_os_error();
        // SAFETY: handle 是有效的映射句柄
        unsafe { CloseHandle(handle) };
        return Err(err);
      }
      Ok(Self {
        handle,
        ptr: ptr as *mut u8,
        size,
      })
    }

    pub(super) fn as_slice(&self) -> &[u8] {
      // SAFETY: ptr 指向 size 字节的映射视图，在 self 存活期间有效
      unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub(super) fn as_mut_slice(&mut self) -> &mut [u8] {
      // SAFETY: 同上，且 &mut self 保证独占
      unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
  }

  impl Drop for NamedMapping {
    fn drop(&mut self) {
      // SAFETY: ptr 与 handle 分别来自 MapViewOfFile 与 Create/OpenFileMappingW
      unsafe {
        UnmapViewOfFile(self.ptr as *const std::ffi::c_void);
        CloseHandle(self.handle);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn channel() -> (tempfile::TempDir, ShmChannel) {
    let dir = tempfile::tempdir().unwrap();
    let channel = ShmChannel::new(dir.path().join("segments"));
    (dir, channel)
  }

  #[test]
  fn create_write_open_read() {
    let (_dir, channel) = channel();
    let mut seg = channel.create("seg_a", 16).unwrap();
    let bytes: Vec<u8> = (0..16).collect();
    seg.write(&bytes).unwrap();

    let reader = channel.open("seg_a", 16).unwrap();
    assert!(!reader.is_owner());
    assert_eq!(reader.as_bytes(), bytes.as_slice());
  }

  #[test]
  fn owner_drop_releases_segment() {
    let (_dir, channel) = channel();
    let seg = channel.create("seg_b", 8).unwrap();
    let path = channel.dir().unwrap().join("seg_b");
    assert!(path.exists());
    drop(seg);
    assert!(!path.exists());
  }

  #[test]
  fn reader_drop_keeps_segment() {
    let (_dir, channel) = channel();
    let _owner = channel.create("seg_c", 8).unwrap();
    drop(channel.open("seg_c", 8).unwrap());
    assert!(channel.dir().unwrap().join("seg_c").exists());
  }

  #[test]
  fn duplicate_create_fails() {
    let (_dir, channel) = channel();
    let _seg = channel.create("seg_d", 8).unwrap();
    assert!(matches!(channel.create("seg_d", 8), Err(ShmError::Io(_))));
  }

  #[test]
  fn missing_segment_is_an_error() {
    let (_dir, channel) = channel();
    assert!(channel.open("nope", 4).is_err());
  }

  #[test]
  fn short_segment_is_rejected() {
    let (_dir, channel) = channel();
    let _seg = channel.create("seg_e", 4).unwrap();
    assert!(matches!(
      channel.open("seg_e", 16),
      Err(ShmError::SizeMismatch {
        expected: 16,
        actual: 4
      })
    ));
  }

  #[test]
  fn names_cannot_escape_directory() {
    let (_dir, channel) = channel();
    assert!(matches!(
      channel.create("../evil", 4),
      Err(ShmError::InvalidName(_))
    ));
  }

  #[test]
  fn take_mask_copies_and_removes() {
    let (_dir, channel) = channel();
    let token = new_token();
    {
      // 模拟工作进程：创建后交出所有权
      let mut seg = channel.create(&mask_segment_name(&token), 6).unwrap();
      seg.write(&[0, 1, 0, 1, 1, 0]).unwrap();
      seg.hand_over();
    }

    let mask = channel.take_mask(&token, 3, 2).unwrap();
    assert_eq!(mask.as_bytes(), &[0, 1, 0, 1, 1, 0]);
    assert!(!channel.dir().unwrap().join(mask_segment_name(&token)).exists());
  }

  #[test]
  fn publish_image_uses_prefixed_name() {
    let (_dir, channel) = channel();
    let pixels = PixelBuffer::from_raw(2, 1, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
    let (token, seg) = channel.publish_image(&pixels).unwrap();
    assert_eq!(seg.name(), image_segment_name(&token));
    assert_eq!(seg.as_bytes(), pixels.as_bytes());
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn default_channel_uses_shm_open_namespace() {
    if std::env::var_os(SHM_DIR_ENV).is_some() || !Path::new("/dev/shm").is_dir() {
      return;
    }
    let channel = ShmChannel::default();
    assert_eq!(channel.dir(), Some(Path::new("/dev/shm")));

    // 对端以 shm_open("/<name>") 打开的正是 /dev/shm/<name>
    let name = image_segment_name(&new_token());
    let seg = channel.create(&name, 4).unwrap();
    assert!(Path::new("/dev/shm").join(&name).is_file());
    drop(seg);
    assert!(!Path::new("/dev/shm").join(&name).exists());
  }

  #[cfg(windows)]
  #[test]
  fn kernel_mapping_is_found_by_name() {
    let channel = ShmChannel {
      namespace: Namespace::Kernel,
    };
    assert_eq!(channel.dir(), None);

    let name = mask_segment_name(&new_token());
    let mut seg = channel.create(&name, 4).unwrap();
    seg.write(&[9, 8, 7, 6]).unwrap();

    let reader = channel.open(&name, 4).unwrap();
    assert_eq!(reader.as_bytes(), &[9, 8, 7, 6]);
    assert!(channel.create(&name, 4).is_err());
  }
}
