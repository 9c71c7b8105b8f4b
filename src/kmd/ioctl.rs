use crate::utils::{iow, iowr};

// ===============================================================================================
// Constants
// ===============================================================================================

pub const DRM_IOCTL_BASE: u32 = 0x64; // 'd'
pub const DRM_COMMAND_BASE: u32 = 0x40;

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

// ===============================================================================================
// Core GEM / PRIME
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PrimeHandleArgs {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

// ===============================================================================================
// i915 Memory Management
// ===============================================================================================

pub const I915_USERPTR_READ_ONLY: u32 = 0x1;
pub const I915_USERPTR_PROBE: u32 = 0x2;

pub const I915_TILING_NONE: u32 = 0;
pub const I915_TILING_X: u32 = 1;
pub const I915_TILING_Y: u32 = 2;

pub const I915_GEM_DOMAIN_CPU: u32 = 0x0000_0001;

pub const I915_CONTEXT_PARAM_GTT_SIZE: u64 = 0x3;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreateArgs {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemUserptrArgs {
    pub user_ptr: u64,
    pub user_size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetTilingArgs {
    pub handle: u32,
    pub tiling_mode: u32,
    pub stride: u32,
    pub swizzle_mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemGetTilingArgs {
    pub handle: u32,
    pub tiling_mode: u32,
    pub swizzle_mode: u32,
    pub phys_swizzle_mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemWaitArgs {
    pub bo_handle: u32,
    pub flags: u32,
    pub timeout_ns: i64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMmapArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetDomainArgs {
    pub handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextParamArgs {
    pub ctx_id: u32,
    pub size: u32,
    pub param: u64,
    pub value: u64,
}

// ===============================================================================================
// IOCTL Definitions
// ===============================================================================================

pub const DRM_IOCTL_GEM_CLOSE: u32 = iow::<GemCloseArgs>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = iowr::<PrimeHandleArgs>(DRM_IOCTL_BASE, 0x2D);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = iowr::<PrimeHandleArgs>(DRM_IOCTL_BASE, 0x2E);

pub const DRM_IOCTL_I915_GEM_CREATE: u32 =
    iowr::<GemCreateArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x1B);
pub const DRM_IOCTL_I915_GEM_MMAP: u32 =
    iowr::<GemMmapArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x1E);
pub const DRM_IOCTL_I915_GEM_SET_DOMAIN: u32 =
    iow::<GemSetDomainArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x1F);
pub const DRM_IOCTL_I915_GEM_SET_TILING: u32 =
    iowr::<GemSetTilingArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x21);
pub const DRM_IOCTL_I915_GEM_GET_TILING: u32 =
    iowr::<GemGetTilingArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x22);
pub const DRM_IOCTL_I915_GEM_WAIT: u32 =
    iowr::<GemWaitArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x2C);
pub const DRM_IOCTL_I915_GEM_USERPTR: u32 =
    iowr::<GemUserptrArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x33);
pub const DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM: u32 =
    iowr::<GemContextParamArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x34);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_uapi() {
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_PRIME_FD_TO_HANDLE, 0xC00C_642E);
        assert_eq!(DRM_IOCTL_I915_GEM_CREATE, 0xC010_645B);
        assert_eq!(DRM_IOCTL_I915_GEM_USERPTR, 0xC018_6473);
    }
}
