//! Saved execution contexts and the assembly primitives that switch
//! between them.  The register sets live in `ctx_*.asm`; the layouts here
//! must match the offsets used there.

use std::ffi::c_void;
use std::mem;

#[cfg(target_arch = "x86_64")]
#[repr(C)]
pub(crate) struct Ctx {
    rsp: u64,
    rip: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
pub(crate) struct Ctx {
    sp: u64,
    pc: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
    d: [u64; 8],
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("greenrt supports x86_64 and aarch64 only");

unsafe extern "C" {
    fn grt_ctx_swap(from: *mut Ctx, to: *mut Ctx);
    fn grt_ctx_start();
    fn grt_ctx_onstack(arg: *mut c_void, f: unsafe extern "C" fn(*mut c_void), sp: *mut u8);
}

impl Ctx {
    pub(crate) fn zeroed() -> Ctx {
        unsafe { mem::zeroed() }
    }
}

/// Point a context at the start shim so that the first swap into it calls
/// `grt_ctx_entry(arg)` on a fresh stack whose top is `top` (16-aligned).
pub(crate) unsafe fn ctx_init(ctx: &mut Ctx, top: *mut u8, arg: *mut c_void) {
    let top = (top as usize) & !0xFusize;
    #[cfg(target_arch = "x86_64")]
    {
        *ctx = Ctx::zeroed();
        ctx.rsp = top as u64;
        ctx.rip = grt_ctx_start as *const () as usize as u64;
        ctx.r12 = arg as usize as u64;
    }
    #[cfg(target_arch = "aarch64")]
    {
        *ctx = Ctx::zeroed();
        ctx.sp = top as u64;
        ctx.pc = grt_ctx_start as *const () as usize as u64;
        ctx.x19 = arg as usize as u64;
    }
}

/// Save the current context into `from` and resume `to`.  Returns when
/// something swaps back into `from`.
#[inline]
pub(crate) unsafe fn ctx_swap(from: *mut Ctx, to: *mut Ctx) {
    grt_ctx_swap(from, to);
}

/// Call `f(arg)` with the stack pointer moved to `sp`, returning on the
/// original stack.  `f` must not unwind across the switch; callers catch
/// on the inner side and re-raise on the outer side.
#[inline]
pub(crate) unsafe fn onstack(arg: *mut c_void, f: unsafe extern "C" fn(*mut c_void), sp: *mut u8) {
    grt_ctx_onstack(arg, f, (sp as usize & !0xFusize) as *mut u8);
}
