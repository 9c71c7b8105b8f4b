#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::kmd::fence::{FenceCounter, WaitStatus};
use crate::kmd::ioctl::{
    DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM, DRM_IOCTL_I915_GEM_CREATE,
    DRM_IOCTL_I915_GEM_GET_TILING, DRM_IOCTL_I915_GEM_MMAP, DRM_IOCTL_I915_GEM_SET_DOMAIN,
    DRM_IOCTL_I915_GEM_SET_TILING, DRM_IOCTL_I915_GEM_USERPTR, DRM_IOCTL_I915_GEM_WAIT,
    DRM_IOCTL_PRIME_FD_TO_HANDLE, GemCloseArgs, GemContextParamArgs, GemCreateArgs,
    GemGetTilingArgs, GemMmapArgs, GemSetDomainArgs, GemSetTilingArgs, GemUserptrArgs,
    GemWaitArgs, I915_CONTEXT_PARAM_GTT_SIZE, I915_GEM_DOMAIN_CPU, I915_TILING_NONE,
    I915_TILING_X, I915_TILING_Y, I915_USERPTR_PROBE, PrimeHandleArgs,
};
use crate::kmd::status::{KmdError, KmdResult};
use crate::kmd::{
    BackingDescriptor, BackingHandle, BackingInfo, Completion, ExternalHandle, GpuRange,
    KernelDriver, ResidencyFailure, SharedBacking, TilingMode,
};
use crate::utils::PAGE_SIZE;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A handle to an i915 DRM render node (`/dev/dri/renderD*`).
///
/// The kernel manages residency for this driver model, so residency requests
/// complete immediately and no paging fence is ever pending. Monitored fences
/// are plain counters advanced by whoever submits work.
#[derive(Clone, Debug)]
pub struct DrmDevice {
    pub file: Arc<File>,
    paging_fence: Arc<FenceCounter>,
}

impl DrmDevice {
    const DEFAULT_RENDER_NODE: &'static str = "/dev/dri/renderD128";

    /// Opens the first render node.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened (no GPU, permissions).
    pub fn open() -> io::Result<Self> {
        Self::open_path(Self::DEFAULT_RENDER_NODE)
    }

    /// Opens a specific render node.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened.
    pub fn open_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
            paging_fence: Arc::new(FenceCounter::new(u64::MAX)),
        })
    }

    /// Generic unsafe helper to execute an IOCTL, restarting on `EINTR`/`EAGAIN`.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> KmdResult<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
            if ret == 0 {
                return Ok(());
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR && errno != libc::EAGAIN {
                return Err(KmdError::from_errno(errno));
            }
        }
    }

    fn set_domain_cpu(&self, handle: BackingHandle) -> KmdResult<()> {
        let mut args = GemSetDomainArgs {
            handle,
            read_domains: I915_GEM_DOMAIN_CPU,
            write_domain: 0,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_SET_DOMAIN, &mut args) }
    }

    fn gtt_size(&self) -> KmdResult<u64> {
        let mut args = GemContextParamArgs {
            param: I915_CONTEXT_PARAM_GTT_SIZE,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM, &mut args)?;
        }
        Ok(args.value)
    }
}

impl KernelDriver for DrmDevice {
    fn create_backing(&self, desc: &BackingDescriptor) -> KmdResult<BackingInfo> {
        match *desc {
            BackingDescriptor::UserPtr {
                address,
                size,
                validate,
            } => {
                let mut args = GemUserptrArgs {
                    user_ptr: address as u64,
                    user_size: size as u64,
                    flags: if validate { I915_USERPTR_PROBE } else { 0 },
                    handle: 0,
                };
                if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_I915_GEM_USERPTR, &mut args) } {
                    tracing::debug!(address, size, error = %e, "GEM_USERPTR failed");
                    return Err(e);
                }
                Ok(BackingInfo {
                    handle: args.handle,
                    size,
                })
            }
            BackingDescriptor::Device { size } => {
                let mut args = GemCreateArgs {
                    size: size as u64,
                    ..Default::default()
                };
                if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CREATE, &mut args) } {
                    tracing::debug!(size, error = %e, "GEM_CREATE failed");
                    return Err(e);
                }
                Ok(BackingInfo {
                    handle: args.handle,
                    size: args.size as usize,
                })
            }
        }
    }

    fn destroy_backing(&self, handle: BackingHandle) -> KmdResult<()> {
        let mut args = GemCloseArgs { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) }
    }

    // i915 binds objects at the address they are soft-pinned to on submission.
    fn map_virtual_address(&self, _handle: BackingHandle, _range: GpuRange) -> KmdResult<Completion> {
        Ok(Completion::Done)
    }

    fn make_resident(
        &self,
        _handles: &[BackingHandle],
        _cant_trim_further: bool,
    ) -> Result<Completion, ResidencyFailure> {
        Ok(Completion::Done)
    }

    fn evict(&self, _handles: &[BackingHandle]) -> KmdResult<u64> {
        Ok(0)
    }

    fn open_shared_handle(&self, external: ExternalHandle) -> KmdResult<SharedBacking> {
        let fd = RawFd::try_from(external).map_err(|_| KmdError::Protocol(i64::from(libc::EBADF)))?;
        let mut args = PrimeHandleArgs {
            handle: 0,
            flags: 0,
            fd,
        };
        if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args) } {
            tracing::warn!(fd, error = %e, "ioctl(PRIME_FD_TO_HANDLE) failed");
            return Err(e);
        }

        let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if size < 0 {
            return Err(KmdError::last_os_error());
        }

        Ok(SharedBacking {
            handle: args.handle,
            size: size as usize,
        })
    }

    fn close_external_handle(&self, external: ExternalHandle) -> KmdResult<()> {
        let fd = RawFd::try_from(external).map_err(|_| KmdError::Protocol(i64::from(libc::EBADF)))?;
        if unsafe { libc::close(fd) } != 0 {
            return Err(KmdError::last_os_error());
        }
        Ok(())
    }

    fn set_tiling(&self, handle: BackingHandle, mode: TilingMode, stride: u32) -> KmdResult<()> {
        let tiling_mode = match mode {
            TilingMode::None => I915_TILING_NONE,
            TilingMode::X => I915_TILING_X,
            TilingMode::Y => I915_TILING_Y,
        };
        let mut args = GemSetTilingArgs {
            handle,
            tiling_mode,
            stride,
            swizzle_mode: 0,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_SET_TILING, &mut args) }
    }

    fn get_tiling(&self, handle: BackingHandle) -> KmdResult<TilingMode> {
        let mut args = GemGetTilingArgs {
            handle,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_GET_TILING, &mut args)?;
        }
        Ok(match args.tiling_mode {
            I915_TILING_X => TilingMode::X,
            I915_TILING_Y => TilingMode::Y,
            _ => TilingMode::None,
        })
    }

    fn wait_idle(&self, handle: BackingHandle, timeout: Option<Duration>) -> KmdResult<WaitStatus> {
        let timeout_ns = timeout.map_or(-1, |t| i64::try_from(t.as_nanos()).unwrap_or(i64::MAX));
        let mut args = GemWaitArgs {
            bo_handle: handle,
            flags: 0,
            timeout_ns,
        };
        match unsafe { self.ioctl(DRM_IOCTL_I915_GEM_WAIT, &mut args) } {
            Ok(()) => Ok(WaitStatus::Signaled),
            Err(KmdError::Protocol(code)) if code == i64::from(libc::ETIME) => {
                Ok(WaitStatus::TimedOut)
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self, handle: BackingHandle, size: usize) -> KmdResult<usize> {
        let mut args = GemMmapArgs {
            handle,
            size: size as u64,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_MMAP, &mut args)?;
        }
        // Move the object to the CPU read domain, waiting on outstanding flushes.
        self.set_domain_cpu(handle)?;
        Ok(args.addr_ptr as usize)
    }

    fn unlock(&self, _handle: BackingHandle, address: usize, size: usize) -> KmdResult<()> {
        if unsafe { libc::munmap(address as *mut libc::c_void, size) } != 0 {
            return Err(KmdError::last_os_error());
        }
        Ok(())
    }

    fn create_monitored_fence(&self) -> KmdResult<Arc<FenceCounter>> {
        Ok(Arc::new(FenceCounter::new(0)))
    }

    fn paging_fence(&self) -> Arc<FenceCounter> {
        self.paging_fence.clone()
    }

    fn system_shared_memory(&self) -> u64 {
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let host_memory = (PAGE_SIZE as u64).saturating_mul(u64::try_from(pages).unwrap_or(0));

        match self.gtt_size() {
            Ok(gtt) => host_memory.min(gtt),
            Err(e) => {
                tracing::warn!(error = %e, "GTT size query failed");
                host_memory
            }
        }
    }
}

impl AsRawFd for DrmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
