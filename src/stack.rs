//! Segmented stacks.
//!
//! Every task starts on one mmap'd, guard-paged segment.  There is no
//! compiler prologue to trap on overflow, so growth is an explicit call:
//! `maybe_grow` compares the approximate stack pointer against the
//! current segment's guard and, when the headroom is short, splices in a
//! fresh segment with a `Stktop` record at its top and runs the closure
//! there through the `ctx_onstack` switch.  `oldstack` undoes the splice.
//!
//! `defercall` is the reflective-call path: it always pushes a `Stktop`
//! (reusing the current segment when the headroom allows), because the
//! panic/recover machinery keys off the record, not the allocation.

use std::ffi::c_void;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr;
use std::sync::{Mutex, OnceLock};
use std::thread::Result as ThreadResult;

use tracing::trace;

use crate::ctx;
use crate::sched::{G, tls_g, tls_m};
use crate::stats::{ST_STACK_GROW, ST_STACK_RECORD, stat_inc};
use crate::sys::{self, page_size, throw};

pub(crate) const STACK_SYSTEM: usize = 0;
pub(crate) const STACK_GUARD: usize = 4096;
pub(crate) const STACK_MIN: usize = 32 * 1024;
pub(crate) const STACK_EXTRA: usize = 4 * 1024;

/// How far below the runtime's deferred-call entry SP a `recover` call may
/// sit and still count as the top frame of the deferred call.
pub(crate) const RECOVER_WINDOW: usize = 2048;

/// Gap left between the live frame and a same-segment `Stktop` record so
/// the record survives the calls made before the stack pointer moves.
const RECORD_PAD: usize = 512;

/// Top-of-segment record.  Lives at the high end of every non-base
/// segment (and, for deferred calls, sometimes in the middle of one).
/// A zeroed record marks the base segment.
#[repr(C)]
pub(crate) struct Stktop {
    pub stackbase: *mut u8,
    pub stackguard: *mut u8,
    /// Allocation size to hand back to `stackfree`; 0 for a record that
    /// did not allocate.
    pub free: usize,
    /// Set when this segment was created to run a deferred call during a
    /// panic.  `recover` keys off it.
    pub panic: bool,
    /// SP at which the runtime invoked a deferred call; null for plain
    /// growth.
    pub entry_sp: *mut u8,
}

/// Address of a local, standing in for the caller's stack pointer.
#[inline(always)]
pub(crate) fn approx_sp() -> *mut u8 {
    let x = 0u8;
    &x as *const u8 as *mut u8
}

struct CacheEnt {
    stk: usize,
    free: usize,
}

static STACK_CACHE: OnceLock<Mutex<Vec<CacheEnt>>> = OnceLock::new();
static STACK_CACHE_MAX: OnceLock<usize> = OnceLock::new();

fn stack_cache() -> &'static Mutex<Vec<CacheEnt>> {
    STACK_CACHE.get_or_init(|| Mutex::new(Vec::new()))
}

fn stack_cache_max() -> usize {
    *STACK_CACHE_MAX.get_or_init(|| sys::env_usize("GREENRT_STACK_CACHE", 64).min(8192))
}

fn round_page(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) / page * page
}

/// Allocate a stack segment with at least `n` usable bytes.  Returns the
/// first usable byte and the total allocation size; the page below the
/// usable span is PROT_NONE.
pub(crate) unsafe fn stackalloc(n: usize) -> (*mut u8, usize) {
    let page = page_size();
    let usable = round_page(n);
    let total = usable + page;

    {
        let mut cache = match stack_cache().lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        if let Some(idx) = cache.iter().rposition(|ent| ent.free == total) {
            let ent = cache.swap_remove(idx);
            return (ent.stk as *mut u8, ent.free);
        }
    }

    let m = tls_m();
    if !m.is_null() {
        (*m).mallocing += 1;
    }
    let base = libc::mmap(
        ptr::null_mut(),
        total,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if base == libc::MAP_FAILED {
        throw("stackalloc: out of memory");
    }
    let stk = (base as *mut u8).add(page);
    if libc::mprotect(stk as *mut c_void, usable, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        throw("stackalloc: mprotect failed");
    }
    if !m.is_null() {
        (*m).mallocing -= 1;
    }
    (stk, total)
}

pub(crate) unsafe fn stackfree(stk: *mut u8, free: usize) {
    if stk.is_null() || free == 0 {
        return;
    }
    {
        let mut cache = match stack_cache().lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        if cache.len() < stack_cache_max() {
            cache.push(CacheEnt {
                stk: stk as usize,
                free,
            });
            return;
        }
    }
    let page = page_size();
    libc::munmap(stk.sub(page) as *mut c_void, free);
}

pub(crate) unsafe fn stack_cache_drain() {
    let mut cache = match stack_cache().lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };
    let page = page_size();
    for ent in cache.drain(..) {
        libc::munmap((ent.stk - page) as *mut c_void, ent.free);
    }
}

/// First byte past the usable span of a segment returned by `stackalloc`.
pub(crate) unsafe fn usable_top(stk: *mut u8, free: usize) -> *mut u8 {
    stk.add(free - page_size())
}

struct OnStackCell<F, R> {
    f: Option<F>,
    res: Option<ThreadResult<R>>,
}

unsafe extern "C" fn onstack_tramp<F, R>(p: *mut c_void)
where
    F: FnOnce() -> R,
{
    let cell = &mut *(p as *mut OnStackCell<F, R>);
    let f = match cell.f.take() {
        Some(f) => f,
        None => throw("onstack: missing closure"),
    };
    cell.res = Some(catch_unwind(AssertUnwindSafe(f)));
}

/// Run `f` with the stack pointer moved to `sp`, catching any unwind on
/// the inner side.  The caller restores segment bounds before re-raising.
unsafe fn run_onstack<F, R>(f: F, sp: *mut u8) -> ThreadResult<R>
where
    F: FnOnce() -> R,
{
    let mut cell = OnStackCell::<F, R> {
        f: Some(f),
        res: None,
    };
    ctx::onstack(
        &mut cell as *mut OnStackCell<F, R> as *mut c_void,
        onstack_tramp::<F, R>,
        sp,
    );
    match cell.res {
        Some(r) => r,
        None => throw("onstack: no result"),
    }
}

/// Write a `Stktop` just below `top_limit` and splice the task onto it.
/// Returns the record address, which is also the new stack pointer.
unsafe fn push_stktop(
    g: *mut G,
    top_limit: *mut u8,
    new_guard: *mut u8,
    free: usize,
    panic: bool,
    entry: bool,
) -> *mut Stktop {
    let addr = (top_limit as usize - mem::size_of::<Stktop>()) & !0xFusize;
    let top = addr as *mut Stktop;
    ptr::write(
        top,
        Stktop {
            stackbase: (*g).stackbase,
            stackguard: (*g).stackguard,
            free,
            panic,
            entry_sp: if entry { addr as *mut u8 } else { ptr::null_mut() },
        },
    );
    (*g).stackbase = top as *mut u8;
    (*g).stackguard = new_guard;
    top
}

/// Pop the top `Stktop`, restoring the previous segment bounds and
/// freeing the segment if it was allocated.
pub(crate) unsafe fn oldstack(g: *mut G) {
    let top = (*g).stackbase as *mut Stktop;
    let old = ptr::read(top);
    let stk = (*g).stackguard.sub(STACK_GUARD);
    (*g).stackbase = old.stackbase;
    (*g).stackguard = old.stackguard;
    if old.free != 0 {
        stackfree(stk, old.free);
    }
}

/// Run `f`, growing the stack first if fewer than `framesize` bytes
/// remain on the current segment.  Off-task callers run `f` in place.
pub fn maybe_grow<R>(framesize: usize, f: impl FnOnce() -> R) -> R {
    let g = tls_g();
    if g.is_null() {
        return f();
    }
    let sp = approx_sp() as usize;
    unsafe {
        let guard = (*g).stackguard as usize;
        if sp > guard && sp - guard > framesize {
            return f();
        }
        newstack(g, framesize, f)
    }
}

unsafe fn newstack<R>(g: *mut G, framesize: usize, f: impl FnOnce() -> R) -> R {
    let mut size = framesize + STACK_EXTRA;
    if size < STACK_MIN {
        size = STACK_MIN;
    }
    size += STACK_SYSTEM;
    stat_inc(&ST_STACK_GROW);
    trace!(goid = (*g).goid, size, "newstack");

    let ispanic = (*g).ispanic;
    (*g).ispanic = false;
    let (stk, free) = stackalloc(size);
    let top = push_stktop(
        g,
        usable_top(stk, free),
        stk.add(STACK_GUARD),
        free,
        ispanic,
        false,
    );
    let res = run_onstack(f, top as *mut u8);
    oldstack(g);
    match res {
        Ok(r) => r,
        Err(payload) => resume_unwind(payload),
    }
}

/// Invoke a deferred call the way the panic and exit paths need it run:
/// above a fresh `Stktop` whose `panic` tag mirrors `g.ispanic`, either
/// on the current segment (enough headroom) or on a new minimum-size one.
/// The unwind payload, if any, is returned rather than propagated.
pub(crate) unsafe fn defercall(g: *mut G, f: Box<dyn FnOnce() + Send>) -> ThreadResult<()> {
    let sp = approx_sp() as usize;
    let ispanic = (*g).ispanic;
    (*g).ispanic = false;
    let guard = (*g).stackguard as usize;

    if sp > guard && sp - guard > STACK_MIN && sp > RECORD_PAD {
        stat_inc(&ST_STACK_RECORD);
        let top = push_stktop(
            g,
            (sp - RECORD_PAD) as *mut u8,
            (*g).stackguard,
            0,
            ispanic,
            true,
        );
        let res = run_onstack(f, top as *mut u8);
        oldstack(g);
        return res;
    }

    let (stk, free) = stackalloc(STACK_MIN + STACK_SYSTEM);
    let top = push_stktop(
        g,
        usable_top(stk, free),
        stk.add(STACK_GUARD),
        free,
        ispanic,
        true,
    );
    let res = run_onstack(f, top as *mut u8);
    oldstack(g);
    res
}

/// Free stack segments of `gp` from the top until reaching the segment
/// containing `sp`, or the base segment when `sp` is null.  Must be run
/// from a different task (normally the scheduler context).
pub(crate) unsafe fn unwindstack(gp: *mut G, sp: *mut u8) {
    if tls_g() == gp {
        throw("unwindstack on self");
    }
    loop {
        let top = (*gp).stackbase as *mut Stktop;
        if top.is_null() || (*top).stackbase.is_null() {
            break;
        }
        let stk = (*gp).stackguard.sub(STACK_GUARD);
        if !sp.is_null() && stk <= sp && sp < (*gp).stackbase {
            break;
        }
        let old = ptr::read(top);
        (*gp).stackbase = old.stackbase;
        (*gp).stackguard = old.stackguard;
        if old.free != 0 {
            stackfree(stk, old.free);
        }
    }
    if !sp.is_null() && (sp < (*gp).stackguard.sub(STACK_GUARD) || (*gp).stackbase < sp) {
        throw("bad unwindstack");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stackalloc_reuses_cached_segments() {
        unsafe {
            let (stk1, free1) = stackalloc(STACK_MIN);
            // Touch the usable span to prove the protection layout.
            ptr::write_bytes(stk1, 0xa5, 64);
            let top = usable_top(stk1, free1);
            ptr::write_bytes(top.sub(64), 0x5a, 64);
            stackfree(stk1, free1);
            let (stk2, free2) = stackalloc(STACK_MIN);
            assert_eq!(free1, free2);
            stackfree(stk2, free2);
        }
    }

    #[test]
    fn round_page_is_monotone() {
        let page = page_size();
        assert_eq!(round_page(1), page);
        assert_eq!(round_page(page), page);
        assert_eq!(round_page(page + 1), 2 * page);
    }

    #[test]
    fn growth_restores_the_old_bounds() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let ok = Arc::new(AtomicBool::new(false));
        let o = ok.clone();
        crate::sched::run(move || {
            let o = o.clone();
            crate::sched::spawn(move || {
                let g = tls_g();
                let (base, guard) = unsafe { ((*g).stackbase, (*g).stackguard) };
                // Well past the base segment: forces a fresh segment.
                let v = maybe_grow(512 * 1024, || {
                    let mut buf = [0u8; 64 * 1024];
                    std::hint::black_box(&mut buf);
                    7u32
                });
                let same = unsafe { (*g).stackbase == base && (*g).stackguard == guard };
                o.store(v == 7 && same, Ordering::SeqCst);
            });
        });
        assert!(ok.load(Ordering::SeqCst));
    }
}
