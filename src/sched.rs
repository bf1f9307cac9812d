//! The scheduler: match ready-to-run tasks (G) with waiting-for-work
//! workers (M), keeping at most `gomaxprocs` workers executing task code
//! at once.  Workers never go away.
//!
//! The hot coordination state is packed into one atomic word so the
//! syscall enter/exit paths can make their decision with a single
//! read-modify-write and no lock:
//!
//!     [15 bits] mcpu      workers currently executing task code
//!     [15 bits] mcpumax   allowed ceiling
//!     [1 bit]   waitstop  a stop-the-world actor sleeps on `stopped`
//!     [1 bit]   gwaiting  the ready queue is non-empty
//!
//! Everything else is guarded by the scheduler lock.  Writes to mcpumax
//! and waitstop go through CAS; mcpu moves by atomic add from the
//! syscall paths; gwaiting tracks queue emptiness under the lock.

use std::cell::Cell;
use std::ffi::c_void;
use std::mem::{self, MaybeUninit};
use std::panic::Location;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};

use tracing::trace;

use crate::ctx::{Ctx, ctx_init, ctx_swap};
use crate::panic as rtpanic;
use crate::stack::{self, STACK_GUARD, STACK_MIN, Stktop};
use crate::stats::*;
use crate::sys::{
    self, Note, OsThread, fd_write_bytes, os_mutex_destroy, os_mutex_init, os_mutex_lock,
    os_mutex_unlock, os_thread_create_worker, os_thread_join, os_yield, throw,
};

pub(crate) const G_IDLE: i32 = 0;
pub(crate) const G_RUNNABLE: i32 = 1;
pub(crate) const G_RUNNING: i32 = 2;
pub(crate) const G_SYSCALL: i32 = 3;
pub(crate) const G_WAITING: i32 = 4;
pub(crate) const G_MORIBUND: i32 = 5;
pub(crate) const G_DEAD: i32 = 6;

const MCPU_WIDTH: u32 = 15;
const MCPU_MASK: u32 = (1 << MCPU_WIDTH) - 1;
const MCPU_SHIFT: u32 = 0;
const MCPUMAX_SHIFT: u32 = MCPU_SHIFT + MCPU_WIDTH;
const WAITSTOP_SHIFT: u32 = MCPUMAX_SHIFT + MCPU_WIDTH;
const GWAITING_SHIFT: u32 = WAITSTOP_SHIFT + 1;

/// Ceiling for `gomaxprocs`, held back from the field maximum so an
/// accidental decrement past zero shows up as an impossible value.
pub const MAX_GOMAXPROCS: i32 = (MCPU_MASK - 10) as i32;

fn atomic_mcpu(v: u32) -> u32 {
    (v >> MCPU_SHIFT) & MCPU_MASK
}

fn atomic_mcpumax(v: u32) -> u32 {
    (v >> MCPUMAX_SHIFT) & MCPU_MASK
}

fn atomic_waitstop(v: u32) -> u32 {
    (v >> WAITSTOP_SHIFT) & 1
}

fn atomic_gwaiting(v: u32) -> u32 {
    (v >> GWAITING_SHIFT) & 1
}

fn xadd(a: &AtomicU32, delta: i64) -> u32 {
    a.fetch_add(delta as u32, Ordering::SeqCst)
        .wrapping_add(delta as u32)
}

/// One task: a cooperative computation with its own segmented stack.
pub(crate) struct G {
    pub ctx: Ctx,
    pub stack0: *mut u8,
    pub stackguard: *mut u8,
    pub stackbase: *mut u8,
    pub stack_free: usize,
    pub status: AtomicI32,
    pub entry: Option<Box<dyn FnOnce() + Send + 'static>>,
    pub goid: i32,
    pub gopc: Option<&'static Location<'static>>,
    pub waitreason: &'static str,
    pub schedlink: *mut G,
    pub alllink: *mut G,
    pub m: *mut M,
    pub lockedm: *mut M,
    pub idlem: *mut M,
    pub readyonstop: i32,
    pub ispanic: bool,
    // Stack mirrors left for collectors while the task is in a syscall.
    pub gcsp: *mut u8,
    pub gcstack: *mut u8,
    pub gcguard: *mut u8,
    pub scope: *mut rtpanic::Scope,
    pub panic: *mut rtpanic::Panic,
}

impl G {
    fn new() -> G {
        G {
            ctx: Ctx::zeroed(),
            stack0: ptr::null_mut(),
            stackguard: ptr::null_mut(),
            stackbase: ptr::null_mut(),
            stack_free: 0,
            status: AtomicI32::new(G_IDLE),
            entry: None,
            goid: 0,
            gopc: None,
            waitreason: "",
            schedlink: ptr::null_mut(),
            alllink: ptr::null_mut(),
            m: ptr::null_mut(),
            lockedm: ptr::null_mut(),
            idlem: ptr::null_mut(),
            readyonstop: 0,
            ispanic: false,
            gcsp: ptr::null_mut(),
            gcstack: ptr::null_mut(),
            gcguard: ptr::null_mut(),
            scope: ptr::null_mut(),
            panic: ptr::null_mut(),
        }
    }
}

/// One worker: an OS thread running the scheduler loop on its own stack.
/// `sched_ctx` is the saved scheduler context tasks swap back into.
pub(crate) struct M {
    pub sched_ctx: Ctx,
    pub curg: *mut G,
    pub nextg: *mut G,
    pub havenextg: Note,
    pub waitnextg: i32,
    pub lockedg: *mut G,
    pub idleg: *mut G,
    pub id: i32,
    pub fastrand: u32,
    pub mallocing: i32,
    pub gcing: i32,
    pub locks: i32,
    pub profilehz: i32,
    pub schedlink: *mut M,
    pub alllink: *mut M,
    pub thread: OsThread,
    pub stats: StatsLocal,
}

impl M {
    fn new() -> M {
        unsafe { mem::zeroed() }
    }
}

struct Sched {
    lock: sys::OsMutex,

    gfree: *mut G,
    goidgen: i32,

    ghead: *mut G,
    gtail: *mut G,
    gwait: i32,
    gcount: i32,
    grunning: i32,

    mhead: *mut M,
    mwait: i32,
    mcount: i32,

    atomic: AtomicU32,

    predawn: i32,
    profilehz: i32,
    gcwaiting: i32,
    singleproc: bool,
    gomaxprocs: i32,

    /// Set when the last task died; workers drain out and `run` returns.
    stopping: i32,

    /// Deferred wakeup: the worker most recently handed a task inside
    /// the lock, signalled at unlock time so it does not immediately
    /// contend for the lock we still hold.
    mwakeup: *mut M,

    allg: AtomicPtr<G>,
    allm: AtomicPtr<M>,

    stopped: Note,
}

static mut SCHED: MaybeUninit<Sched> = MaybeUninit::uninit();
static SCHED_LIVE: AtomicBool = AtomicBool::new(false);
static RUN_LOCK: StdMutex<()> = StdMutex::new(());

unsafe fn sched() -> *mut Sched {
    SCHED.as_mut_ptr()
}

thread_local! {
    static TLS_M: Cell<*mut M> = const { Cell::new(ptr::null_mut()) };
    static TLS_G: Cell<*mut G> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn tls_m() -> *mut M {
    TLS_M.with(|c| c.get())
}

fn tls_m_set(m: *mut M) {
    TLS_M.with(|c| c.set(m));
}

pub(crate) fn tls_g() -> *mut G {
    TLS_G.with(|c| c.get())
}

fn tls_g_set(g: *mut G) {
    TLS_G.with(|c| c.set(g));
}

pub(crate) unsafe fn allm_head() -> *mut M {
    (*sched()).allm.load(Ordering::Acquire)
}

unsafe fn schedlock() {
    let m = tls_m();
    if !m.is_null() {
        (*m).locks += 1;
    }
    os_mutex_lock(&mut (*sched()).lock);
}

unsafe fn schedunlock() {
    let s = sched();
    let mw = (*s).mwakeup;
    (*s).mwakeup = ptr::null_mut();
    let m = tls_m();
    if !m.is_null() {
        (*m).locks -= 1;
        if (*m).locks < 0 {
            throw("schedunlock: negative lock count");
        }
    }
    os_mutex_unlock(&mut (*s).lock);
    if !mw.is_null() {
        (*mw).havenextg.wakeup();
    }
}

unsafe fn setmcpumax(n: u32) {
    let s = sched();
    loop {
        let v = (*s).atomic.load(Ordering::SeqCst);
        let w = (v & !(MCPU_MASK << MCPUMAX_SHIFT)) | (n << MCPUMAX_SHIFT);
        if (*s)
            .atomic
            .compare_exchange(v, w, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
}

/// Try to take one cpu slot.  Sched may or may not be locked.
unsafe fn canaddmcpu() -> bool {
    let s = sched();
    loop {
        let v = (*s).atomic.load(Ordering::SeqCst);
        if atomic_mcpu(v) >= atomic_mcpumax(v) {
            return false;
        }
        if (*s)
            .atomic
            .compare_exchange(v, v + (1 << MCPU_SHIFT), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

/// Put on the ready queue.  Sched must be locked.
unsafe fn gput(gp: *mut G) {
    let s = sched();

    // A pinned task goes straight to its worker when a cpu is free.
    let lm = (*gp).lockedm;
    if !lm.is_null() && canaddmcpu() {
        mnextg(lm, gp);
        return;
    }

    // A worker's idle task parks in its slot, never the queue.
    let im = (*gp).idlem;
    if !im.is_null() {
        if !(*im).idleg.is_null() {
            let msg = format!(
                "worker m{} idle out of sync: task {} task {}\n",
                (*im).id,
                (*(*im).idleg).goid,
                (*gp).goid
            );
            fd_write_bytes(2, msg.as_bytes());
            throw("double idle");
        }
        (*im).idleg = gp;
        return;
    }

    (*gp).schedlink = ptr::null_mut();
    if (*s).ghead.is_null() {
        (*s).ghead = gp;
    } else {
        (*(*s).gtail).schedlink = gp;
    }
    (*s).gtail = gp;

    if (*s).gwait == 0 {
        xadd(&(*s).atomic, 1 << GWAITING_SHIFT);
    }
    (*s).gwait += 1;
}

/// Report whether gget(m) would return something.
unsafe fn haveg(m: *mut M) -> bool {
    !(*sched()).ghead.is_null() || (!m.is_null() && !(*m).idleg.is_null())
}

/// Take from the ready queue (or the worker's idle slot).  Sched locked.
unsafe fn gget(m: *mut M) -> *mut G {
    let s = sched();
    let gp = (*s).ghead;
    if !gp.is_null() {
        (*s).ghead = (*gp).schedlink;
        if (*s).ghead.is_null() {
            (*s).gtail = ptr::null_mut();
        }
        (*s).gwait -= 1;
        if (*s).gwait == 0 {
            xadd(&(*s).atomic, -(1 << GWAITING_SHIFT));
        }
        return gp;
    }
    if !m.is_null() && !(*m).idleg.is_null() {
        let gp = (*m).idleg;
        (*m).idleg = ptr::null_mut();
        return gp;
    }
    ptr::null_mut()
}

/// Put on the idle worker list.  Sched must be locked.
unsafe fn mput(m: *mut M) {
    let s = sched();
    (*m).schedlink = (*s).mhead;
    (*s).mhead = m;
    (*s).mwait += 1;
}

/// Get a worker to run `gp`: its pinned worker if any, else an idle one.
unsafe fn mget(gp: *mut G) -> *mut M {
    let lm = (*gp).lockedm;
    if !lm.is_null() {
        return lm;
    }
    let s = sched();
    let m = (*s).mhead;
    if !m.is_null() {
        (*s).mhead = (*m).schedlink;
        (*s).mwait -= 1;
    }
    m
}

/// Hand `gp` to `m` for running.  Caller already took the cpu slot.
unsafe fn mnextg(m: *mut M, gp: *mut G) {
    let s = sched();
    (*s).grunning += 1;
    (*m).nextg = gp;
    stat_inc(&ST_HANDOFF);
    if (*m).waitnextg != 0 {
        (*m).waitnextg = 0;
        if !(*s).mwakeup.is_null() {
            (*(*s).mwakeup).havenextg.wakeup();
        }
        (*s).mwakeup = m;
    }
}

/// Mark `gp` ready to run.  Sched is already locked; `gp` might still be
/// running on another worker and about to stop.
unsafe fn readylocked(gp: *mut G) {
    stat_inc(&ST_READY_CALLS);
    if !(*gp).m.is_null() {
        // Running elsewhere; ready it when it comes back to the
        // scheduler.
        (*gp).readyonstop = 1;
        return;
    }

    let st = (*gp).status.load(Ordering::SeqCst);
    if st == G_RUNNABLE || st == G_RUNNING {
        let msg = format!("task {} has status {}\n", (*gp).goid, st);
        fd_write_bytes(2, msg.as_bytes());
        throw("bad g status in ready");
    }
    (*gp).status.store(G_RUNNABLE, Ordering::SeqCst);

    gput(gp);
    if (*sched()).predawn == 0 {
        matchmg();
    }
}

unsafe fn mcommoninit(m: *mut M) {
    let s = sched();
    // Publish on the all-workers list with an atomic store so walkers
    // may iterate without the scheduler lock.
    (*m).alllink = (*s).allm.load(Ordering::Acquire);
    (*s).allm.store(m, Ordering::Release);

    (*m).id = (*s).mcount;
    (*s).mcount += 1;
    (*m).fastrand = 0x49f6428a_u32.wrapping_add((*m).id as u32);
}

unsafe extern "C" fn m_worker_entry(arg: *mut c_void) -> *mut c_void {
    let m = arg as *mut M;
    mstart(m);
    ptr::null_mut()
}

/// Kick off new workers as needed, up to the cpu ceiling.  Sched locked.
unsafe fn matchmg() {
    let cur = tls_m();
    if !cur.is_null() && ((*cur).mallocing != 0 || (*cur).gcing != 0) {
        return;
    }
    while haveg(cur) && canaddmcpu() {
        let gp = gget(cur);
        if gp.is_null() {
            throw("gget inconsistency");
        }

        let mut m = mget(gp);
        if m.is_null() {
            m = Box::into_raw(Box::new(M::new()));
            (*m).havenextg.init();
            mcommoninit(m);
            stat_inc(&ST_M_SPAWNED);
            trace!(mid = (*m).id, "matchmg: new worker");
            if os_thread_create_worker(&mut (*m).thread, m_worker_entry, m as *mut c_void) != 0 {
                throw("newosproc: thread create failed");
            }
        }
        mnextg(m, gp);
    }
}

static PARK_FUZZ: OnceLock<i32> = OnceLock::new();

/// Optional race-shaking point before a worker commits to sleeping.
#[inline]
fn park_fuzz_point() {
    let mode = *PARK_FUZZ.get_or_init(|| sys::env_i32("GREENRT_PARK_FUZZ", 0));
    if mode <= 0 {
        return;
    }
    for _ in 0..50 {
        std::hint::spin_loop();
    }
    unsafe { os_yield() };
}

/// Get the next task for `m`.  Sched must be locked on entry and is
/// unlocked on exit.  Returns null only when the world is draining.
unsafe fn nextgandunlock(m: *mut M) -> *mut G {
    let s = sched();

    if (*s).stopping != 0 {
        schedunlock();
        return ptr::null_mut();
    }

    if atomic_mcpu((*s).atomic.load(Ordering::SeqCst)) >= MAX_GOMAXPROCS as u32 {
        throw("negative mcpu");
    }

    // A task already handed over (the cpu slot came with it).
    if !(*m).nextg.is_null() {
        let gp = (*m).nextg;
        (*m).nextg = ptr::null_mut();
        schedunlock();
        return gp;
    }

    if !(*m).lockedg.is_null() {
        // Only the pinned task will do, and it is not here.  Keep other
        // workers busy with the queue while this one waits.
        if (*s).gwait != 0 {
            matchmg();
            if !(*m).nextg.is_null() {
                let gp = (*m).nextg;
                (*m).nextg = ptr::null_mut();
                schedunlock();
                return gp;
            }
        }
    } else {
        while haveg(m) && canaddmcpu() {
            let gp = gget(m);
            if gp.is_null() {
                throw("gget inconsistency");
            }
            if !(*gp).lockedm.is_null() {
                // Not ours; pass it along, keep the cpu slot with it.
                mnextg((*gp).lockedm, gp);
                continue;
            }
            (*s).grunning += 1;
            schedunlock();
            return gp;
        }

        // Queue empty or cpus maxed out.  The syscall fast paths cannot
        // invalidate this: entersyscall takes the slow path while
        // gwaiting is set, and exitsyscall never pushes mcpu over the
        // ceiling.  Wait on the idle-worker list.
        mput(m);
    }

    let v = (*s).atomic.load(Ordering::SeqCst);
    if (*s).grunning == 0 {
        throw("all tasks are asleep - deadlock!");
    }
    (*m).nextg = ptr::null_mut();
    (*m).waitnextg = 1;
    (*m).havenextg.clear();

    // A stop-the-world actor may be waiting for this cpu to drain.
    if atomic_waitstop(v) != 0 && atomic_mcpu(v) <= atomic_mcpumax(v) {
        xadd(&(*s).atomic, -(1 << WAITSTOP_SHIFT));
        (*s).stopped.wakeup();
    }
    schedunlock();

    park_fuzz_point();
    (*m).havenextg.sleep();
    let gp = (*m).nextg;
    if gp.is_null() {
        if (*s).stopping != 0 {
            return ptr::null_mut();
        }
        throw("bad m nextg in scheduler");
    }
    (*m).nextg = ptr::null_mut();
    gp
}

/// The last task died: wake every idle worker so the loops drain out.
unsafe fn shutdown_locked() {
    let s = sched();
    (*s).stopping = 1;
    loop {
        let m = (*s).mhead;
        if m.is_null() {
            break;
        }
        (*s).mhead = (*m).schedlink;
        (*s).mwait -= 1;
        (*m).waitnextg = 0;
        (*m).havenextg.wakeup();
    }
}

/// One round of the scheduler: account for the task that just stopped,
/// then pick (or wait for) the next one.  Returns null when draining.
unsafe fn schedule(m: *mut M, gp: *mut G) -> *mut G {
    schedlock();
    let s = sched();
    if !gp.is_null() {
        if (*s).predawn != 0 {
            throw("init rescheduling");
        }

        (*gp).m = ptr::null_mut();
        (*s).grunning -= 1;
        let v = xadd(&(*s).atomic, -(1 << MCPU_SHIFT));
        if atomic_mcpu(v) > MAX_GOMAXPROCS as u32 {
            throw("negative mcpu in scheduler");
        }

        match (*gp).status.load(Ordering::SeqCst) {
            G_RUNNABLE | G_DEAD => throw("bad g status in scheduler"),
            G_RUNNING => {
                (*gp).status.store(G_RUNNABLE, Ordering::SeqCst);
                gput(gp);
            }
            G_MORIBUND => {
                trace!(goid = (*gp).goid, "task exit");
                (*gp).status.store(G_DEAD, Ordering::SeqCst);
                let lm = (*gp).lockedm;
                if !lm.is_null() {
                    (*lm).lockedg = ptr::null_mut();
                    (*gp).lockedm = ptr::null_mut();
                }
                (*gp).idlem = ptr::null_mut();
                stack::unwindstack(gp, ptr::null_mut());
                gfput(gp);
                stat_inc(&ST_G_FREED);
                (*s).gcount -= 1;
                if (*s).gcount == 0 {
                    shutdown_locked();
                }
            }
            _ => {}
        }
        if (*gp).readyonstop != 0 {
            (*gp).readyonstop = 0;
            readylocked(gp);
        }
    }
    nextgandunlock(m)
}

/// Initial entry of every worker thread (and of the boot thread).
unsafe fn mstart(m: *mut M) {
    tls_m_set(m);
    tls_g_set(ptr::null_mut());

    let mut prev: *mut G = ptr::null_mut();
    loop {
        let gp = schedule(m, prev);
        if gp.is_null() {
            break;
        }

        let hz = (*sched()).profilehz;
        if (*m).profilehz != hz {
            resetcpuprofiler(m, hz);
        }

        (*gp).readyonstop = 0;
        (*gp).status.store(G_RUNNING, Ordering::SeqCst);
        (*m).curg = gp;
        (*gp).m = m;
        tls_g_set(gp);
        stat_inc(&ST_SCHED_SWITCH);
        trace!(goid = (*gp).goid, mid = (*m).id, "dispatch");

        ctx_swap(&mut (*m).sched_ctx, &mut (*gp).ctx);

        tls_g_set(ptr::null_mut());
        (*m).curg = ptr::null_mut();
        prev = gp;
    }
}

/// Rust-side target of the assembly start shim: runs the task body, then
/// reports the task moribund and leaves the context for good.
#[unsafe(no_mangle)]
unsafe extern "C" fn grt_ctx_entry(arg: *mut c_void) -> ! {
    let gp = arg as *mut G;
    rtpanic::task_main(gp);
    (*gp).status.store(G_MORIBUND, Ordering::SeqCst);
    let m = tls_m();
    if m.is_null() {
        throw("task finished with no worker");
    }
    ctx_swap(&mut (*gp).ctx, &mut (*m).sched_ctx);
    loop {
        std::hint::spin_loop();
    }
}

/// Put on the free-task list for reuse.  Sched must be locked.
unsafe fn gfput(gp: *mut G) {
    if (*gp).stackguard.sub(STACK_GUARD) != (*gp).stack0 {
        throw("invalid stack in gfput");
    }
    let s = sched();
    (*gp).schedlink = (*s).gfree;
    (*s).gfree = gp;
}

/// Take from the free-task list.  Sched must be locked.
unsafe fn gfget() -> *mut G {
    let s = sched();
    let gp = (*s).gfree;
    if !gp.is_null() {
        (*s).gfree = (*gp).schedlink;
    }
    gp
}

unsafe fn malg(stacksize: usize) -> *mut G {
    let gp = Box::into_raw(Box::new(G::new()));
    let (stk, free) = stack::stackalloc(stacksize);
    (*gp).stack0 = stk;
    (*gp).stack_free = free;
    (*gp).stackguard = stk.add(STACK_GUARD);
    let top = stack::usable_top(stk, free);
    let base = (top as usize - mem::size_of::<Stktop>()) & !0xFusize;
    ptr::write_bytes(base as *mut u8, 0, mem::size_of::<Stktop>());
    (*gp).stackbase = base as *mut u8;
    gp
}

fn base_stack_size() -> usize {
    static SZ: OnceLock<usize> = OnceLock::new();
    *SZ.get_or_init(|| (sys::env_usize("GREENRT_STACK_KB", 64) * 1024).max(STACK_MIN))
}

/// Handle to a spawned task, usable for `ready`.
pub struct Task {
    goid: i32,
    g: *mut G,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn id(&self) -> i32 {
        self.goid
    }
}

/// Create a task running `f` and put it on the ready queue.
#[track_caller]
pub fn spawn<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        throw("spawn before run");
    }
    // The closure value stands in for the argument frame copied onto a
    // fresh stack; reject ones that would not fit.
    if mem::size_of::<F>() > STACK_MIN - 1024 {
        throw("spawn: task arguments too large for new task");
    }
    let gopc = Location::caller();
    unsafe {
        schedlock();
        let s = sched();

        let mut newg = gfget();
        if newg.is_null() {
            newg = malg(base_stack_size());
            (*newg).alllink = (*s).allg.load(Ordering::Acquire);
            (*s).allg.store(newg, Ordering::Release);
        } else if (*newg).stackguard.sub(STACK_GUARD) != (*newg).stack0 {
            throw("invalid stack in spawn");
        }

        (*newg).status.store(G_WAITING, Ordering::SeqCst);
        (*newg).waitreason = "new task";
        (*newg).entry = Some(Box::new(f));
        (*newg).gopc = Some(gopc);
        (*newg).readyonstop = 0;
        (*newg).ispanic = false;
        ctx_init(&mut (*newg).ctx, (*newg).stackbase, newg as *mut c_void);

        (*s).gcount += 1;
        (*s).goidgen += 1;
        (*newg).goid = (*s).goidgen;
        stat_inc(&ST_G_CREATED);
        trace!(goid = (*newg).goid, "spawn");

        readylocked(newg);
        let task = Task {
            goid: (*newg).goid,
            g: newg,
        };
        schedunlock();
        task
    }
}

/// Re-queue the current task and run everyone else who is waiting first.
pub fn yield_now() {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        throw("yield on scheduler stack");
    }
    unsafe {
        if (*m).locks != 0 {
            throw("yield holding locks");
        }
        ctx_swap(&mut (*g).ctx, &mut (*m).sched_ctx);
    }
}

/// Park the current task until someone calls `ready` on it.
pub fn park(reason: &'static str) {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        throw("park on scheduler stack");
    }
    unsafe {
        if (*m).locks != 0 {
            throw("park holding locks");
        }
        stat_inc(&ST_PARK_CALLS);
        (*g).status.store(G_WAITING, Ordering::SeqCst);
        (*g).waitreason = reason;
        ctx_swap(&mut (*g).ctx, &mut (*m).sched_ctx);
    }
}

/// Mark a parked task ready to run.
pub fn ready(t: &Task) {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        throw("ready before run");
    }
    unsafe {
        schedlock();
        readylocked(t.g);
        schedunlock();
    }
}

/// The current task is entering a blocking system call; give its cpu
/// slot away so the call does not steal parallelism from compute.
pub fn enter_syscall() {
    let g = tls_g();
    if g.is_null() {
        throw("enter_syscall outside task");
    }
    unsafe {
        let s = sched();
        if (*s).predawn != 0 {
            return;
        }

        // Leave the stack mirrors around for collectors and tracebacks.
        (*g).gcsp = stack::approx_sp();
        (*g).gcstack = (*g).stackbase;
        (*g).gcguard = (*g).stackguard;
        (*g).status.store(G_SYSCALL, Ordering::SeqCst);
        if (*g).gcsp < (*g).gcguard.sub(STACK_GUARD) || (*g).gcstack < (*g).gcsp {
            throw("entersyscall");
        }

        // Fast path: the slow path below gets through without stopping
        // if it does mcpu--, finds gwaiting clear, and finds waitstop
        // irrelevant.  A single atomic add answers all three.
        let v = xadd(&(*s).atomic, -(1 << MCPU_SHIFT));
        if atomic_gwaiting(v) == 0
            && (atomic_waitstop(v) == 0 || atomic_mcpu(v) > atomic_mcpumax(v))
        {
            stat_inc(&ST_SYSCALL_FAST);
            return;
        }

        stat_inc(&ST_SYSCALL_SLOW);
        trace!(goid = (*g).goid, "enter_syscall slow path");
        schedlock();
        let mut v = (*s).atomic.load(Ordering::SeqCst);
        if atomic_gwaiting(v) != 0 {
            matchmg();
            v = (*s).atomic.load(Ordering::SeqCst);
        }
        if atomic_waitstop(v) != 0 && atomic_mcpu(v) <= atomic_mcpumax(v) {
            xadd(&(*s).atomic, -(1 << WAITSTOP_SHIFT));
            (*s).stopped.wakeup();
        }

        // Re-save: the routines above may have moved things under us.
        (*g).gcsp = stack::approx_sp();
        schedunlock();
    }
}

/// The system call finished; get back onto a cpu.
pub fn exit_syscall() {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        throw("exit_syscall outside task");
    }
    unsafe {
        let s = sched();
        if (*s).predawn != 0 {
            return;
        }

        // Fast path: if the bookkeeping leaves us at or under the
        // ceiling, keep running right here.
        let v = xadd(&(*s).atomic, 1 << MCPU_SHIFT);
        if (*m).profilehz == (*s).profilehz && atomic_mcpu(v) <= atomic_mcpumax(v) {
            stat_inc(&ST_EXITSYSCALL_FAST);
            (*g).status.store(G_RUNNING, Ordering::SeqCst);
            (*g).gcstack = ptr::null_mut();
            return;
        }

        stat_inc(&ST_EXITSYSCALL_SLOW);
        trace!(goid = (*g).goid, "exit_syscall slow path");

        // All the cpus are taken.  The scheduler will re-queue this task
        // and undo the mcpu++ above when it takes it off the worker.
        (*g).readyonstop = 1;
        yield_now();

        // Back on a cpu; only now is it safe to drop the mirrors.
        (*g).gcstack = ptr::null_mut();
    }
}

/// Drain the world to a single running cpu (the caller's).
pub fn stop_the_world() {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        throw("stop_the_world before run");
    }
    unsafe {
        schedlock();
        let s = sched();
        (*s).gcwaiting = 1;
        setmcpumax(1);

        // while mcpu > 1
        loop {
            let v = (*s).atomic.load(Ordering::SeqCst);
            if atomic_mcpu(v) <= 1 {
                break;
            }

            // Only one actor ever stops the world, so the note is ours.
            (*s).stopped.clear();
            if atomic_waitstop(v) != 0 {
                throw("invalid waitstop");
            }

            // waitstop = 1, predicated on the word still being `v`.
            if (*s)
                .atomic
                .compare_exchange(v, v + (1 << WAITSTOP_SHIFT), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            stat_inc(&ST_STW_ROUNDS);
            trace!("stop_the_world: waiting for cpus to drain");
            schedunlock();
            (*s).stopped.sleep();
            schedlock();
        }
        (*s).singleproc = (*s).gomaxprocs == 1;
        schedunlock();
    }
}

/// Restore the parallelism ceiling and hand out the queued work.
pub fn start_the_world() {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        throw("start_the_world before run");
    }
    unsafe {
        schedlock();
        let s = sched();
        (*s).gcwaiting = 0;
        setmcpumax((*s).gomaxprocs as u32);
        matchmg();
        schedunlock();
    }
}

/// Set the parallelism ceiling, returning the previous one.
pub fn set_gomaxprocs(n: i32) -> i32 {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        throw("set_gomaxprocs before run");
    }
    unsafe {
        schedlock();
        let s = sched();
        let ret = (*s).gomaxprocs;
        let mut n = n;
        if n <= 0 {
            n = ret;
        }
        if n > MAX_GOMAXPROCS {
            n = MAX_GOMAXPROCS;
        }
        (*s).gomaxprocs = n;
        if n > 1 {
            (*s).singleproc = false;
        }

        if (*s).gcwaiting != 0 {
            if atomic_mcpumax((*s).atomic.load(Ordering::SeqCst)) != 1 {
                throw("invalid mcpumax during gc");
            }
            schedunlock();
            return ret;
        }

        setmcpumax(n as u32);

        // If fewer cpus are allowed than are running, give ours up.
        let v = (*s).atomic.load(Ordering::SeqCst);
        if atomic_mcpu(v) > n as u32 {
            schedunlock();
            yield_now();
            return ret;
        }

        matchmg();
        schedunlock();
        ret
    }
}

pub fn gomaxprocs() -> i32 {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        return 0;
    }
    unsafe { (*sched()).gomaxprocs }
}

/// Number of live tasks.  Counts a dead task until the scheduler has
/// reclaimed it, so the value can run slightly high.
pub fn num_tasks() -> i32 {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        return 0;
    }
    unsafe { (*sched()).gcount }
}

/// Number of workers ever created.
pub fn num_workers() -> i32 {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        return 0;
    }
    unsafe { (*sched()).mcount }
}

/// Pin the current task to its worker: no other worker will run it.
pub fn lock_os_thread() {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        throw("lock_os_thread outside task");
    }
    unsafe {
        if (*sched()).predawn != 0 {
            throw("cannot wire during init");
        }
        (*m).lockedg = g;
        (*g).lockedm = m;
    }
}

pub fn unlock_os_thread() {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        throw("unlock_os_thread outside task");
    }
    unsafe {
        (*m).lockedg = ptr::null_mut();
        (*g).lockedm = ptr::null_mut();
    }
}

pub fn locked_os_thread() -> bool {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        return false;
    }
    unsafe { !(*g).lockedm.is_null() && !(*m).lockedg.is_null() }
}

/// Mark the current task as its worker's idle task: it runs only when
/// that worker has nothing else.  The link is permanent until the task
/// dies.
pub fn idle_task() {
    let g = tls_g();
    let m = tls_m();
    if g.is_null() || m.is_null() {
        throw("idle_task outside task");
    }
    unsafe {
        if !(*g).idlem.is_null() {
            throw("task is already an idle task");
        }
        (*g).idlem = m;
    }
}

/// Identifier of the current task, 0 off-task.
pub fn current() -> i32 {
    let g = tls_g();
    if g.is_null() {
        return 0;
    }
    unsafe { (*g).goid }
}

/// Identifier of the current worker, -1 off-worker.
pub fn worker_id() -> i32 {
    let m = tls_m();
    if m.is_null() {
        return -1;
    }
    unsafe { (*m).id }
}

fn status_str(st: i32) -> &'static str {
    match st {
        G_IDLE => "idle",
        G_RUNNABLE => "runnable",
        G_RUNNING => "running",
        G_SYSCALL => "syscall",
        G_WAITING => "waiting",
        G_MORIBUND => "moribund",
        G_DEAD => "dead",
        _ => "???",
    }
}

/// Print one status line per live task to stderr.  Walks the all-tasks
/// list, which is published with atomic stores, so no lock is needed.
pub fn dump_tasks() {
    if !SCHED_LIVE.load(Ordering::SeqCst) {
        return;
    }
    unsafe {
        let mut gp = (*sched()).allg.load(Ordering::Acquire);
        while !gp.is_null() {
            let st = (*gp).status.load(Ordering::SeqCst);
            if st != G_DEAD {
                let mut line = format!("task {} [{}", (*gp).goid, status_str(st));
                if st == G_WAITING && !(&(*gp).waitreason).is_empty() {
                    line.push_str(": ");
                    line.push_str((*gp).waitreason);
                }
                line.push(']');
                if let Some(loc) = (*gp).gopc {
                    line.push_str(&format!(" created at {}:{}", loc.file(), loc.line()));
                }
                line.push('\n');
                fd_write_bytes(2, line.as_bytes());
            }
            gp = (*gp).alllink;
        }
    }
}

pub type CpuProfileFn = fn(&[usize]);

struct Prof {
    f: Option<CpuProfileFn>,
    hz: i32,
}

fn prof_table() -> &'static StdMutex<Prof> {
    static PROF: OnceLock<StdMutex<Prof>> = OnceLock::new();
    PROF.get_or_init(|| StdMutex::new(Prof { f: None, hz: 0 }))
}

/// Per-worker profiler reconfiguration hook.  Signal delivery itself is
/// the platform driver's job; the scheduler only tracks the rate.
fn resetcpuprofiler(m: *mut M, hz: i32) {
    unsafe {
        (*m).profilehz = hz;
    }
}

/// Install (or with `hz == 0` remove) the cpu profile callback.
pub fn set_cpu_profile_rate(f: Option<CpuProfileFn>, hz: i32) {
    // Force sane arguments.
    let mut hz = hz;
    let mut f = f;
    if hz < 0 {
        hz = 0;
    }
    if hz == 0 {
        f = None;
    }
    if f.is_none() {
        hz = 0;
    }

    // Stop profiling on this worker before touching the table, so a
    // profiling signal cannot arrive while we hold its lock.
    let m = tls_m();
    if !m.is_null() {
        resetcpuprofiler(m, 0);
    }

    {
        let mut prof = match prof_table().lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        prof.f = f;
        prof.hz = hz;
    }

    if SCHED_LIVE.load(Ordering::SeqCst) {
        unsafe {
            schedlock();
            (*sched()).profilehz = hz;
            schedunlock();
        }
    }

    if hz != 0 && !m.is_null() {
        resetcpuprofiler(m, hz);
    }
}

/// Entry point for the external profiling signal driver.
pub fn sigprof(pcs: &[usize]) {
    let prof = match prof_table().lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };
    if prof.hz == 0 {
        return;
    }
    if let Some(f) = prof.f {
        f(pcs);
    }
}

unsafe fn schedinit() {
    let s = sched();
    ptr::write(
        s,
        Sched {
            lock: mem::zeroed(),
            gfree: ptr::null_mut(),
            goidgen: 0,
            ghead: ptr::null_mut(),
            gtail: ptr::null_mut(),
            gwait: 0,
            gcount: 0,
            grunning: 0,
            mhead: ptr::null_mut(),
            mwait: 0,
            mcount: 0,
            atomic: AtomicU32::new(0),
            predawn: 1,
            profilehz: 0,
            gcwaiting: 0,
            singleproc: true,
            gomaxprocs: 1,
            stopping: 0,
            mwakeup: ptr::null_mut(),
            allg: AtomicPtr::new(ptr::null_mut()),
            allm: AtomicPtr::new(ptr::null_mut()),
            stopped: Note::zeroed(),
        },
    );
    os_mutex_init(&mut (*s).lock);
    (*s).stopped.init();

    let mut n = sys::env_i32("GOMAXPROCS", 1);
    if n > MAX_GOMAXPROCS {
        n = MAX_GOMAXPROCS;
    }
    (*s).gomaxprocs = n;
    setmcpumax(n as u32);
    (*s).singleproc = n == 1;
    (*s).predawn = 1;
}

/// Initialization is over; kick off workers for anything queued during
/// it, the way `ready` would have.
unsafe fn initdone() {
    (*sched()).predawn = 0;
    schedlock();
    matchmg();
    schedunlock();
}

unsafe fn teardown(m0: *mut M) {
    let s = sched();

    // Workers exit their loops on their own; wait for each thread.
    let mut m = (*s).allm.load(Ordering::Acquire);
    while !m.is_null() {
        if m != m0 {
            os_thread_join((*m).thread);
        }
        m = (*m).alllink;
    }

    #[cfg(feature = "stats")]
    crate::stats::dump::dump_stats();

    let mut gp = (*s).allg.load(Ordering::Acquire);
    while !gp.is_null() {
        let next = (*gp).alllink;
        stack::stackfree((*gp).stack0, (*gp).stack_free);
        drop(Box::from_raw(gp));
        gp = next;
    }

    let mut m = (*s).allm.load(Ordering::Acquire);
    while !m.is_null() {
        let next = (*m).alllink;
        (*m).havenextg.destroy();
        drop(Box::from_raw(m));
        m = next;
    }

    stack::stack_cache_drain();
    (*s).stopped.destroy();
    os_mutex_destroy(&mut (*s).lock);
    SCHED_LIVE.store(false, Ordering::SeqCst);
    tls_m_set(ptr::null_mut());
    tls_g_set(ptr::null_mut());
}

/// Boot a world: spawn `main` as the first task, turn the calling thread
/// into worker 0 and run until the task count drops to zero.  Exits with
/// status 0 in the original design; here the 0 is returned so several
/// worlds can run in one process (they serialize on an internal lock and
/// the scheduler state is rebuilt each time).
pub fn run<F>(main: F) -> i32
where
    F: FnOnce() + Send + 'static,
{
    let _guard = match RUN_LOCK.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };
    rtpanic::install_hook();
    unsafe {
        schedinit();

        let m0 = Box::into_raw(Box::new(M::new()));
        (*m0).havenextg.init();
        (*m0).thread = libc::pthread_self();
        mcommoninit(m0);
        tls_m_set(m0);
        tls_g_set(ptr::null_mut());

        SCHED_LIVE.store(true, Ordering::SeqCst);
        // The main task finishes initialization itself, then runs the
        // user's body; worker 0 picks it straight off the queue.
        spawn(move || {
            unsafe { initdone() };
            main();
        });

        mstart(m0);
        teardown(m0);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicI32 as StdAtomicI32, AtomicU64};
    use std::time::Duration;

    fn push(log: &Arc<StdMutex<String>>, s: &str) {
        match log.lock() {
            Ok(mut g) => g.push_str(s),
            Err(e) => e.into_inner().push_str(s),
        }
    }

    #[test]
    fn atomic_word_packing() {
        let v = (3u32 << MCPU_SHIFT) | (7u32 << MCPUMAX_SHIFT) | (1u32 << WAITSTOP_SHIFT);
        assert_eq!(atomic_mcpu(v), 3);
        assert_eq!(atomic_mcpumax(v), 7);
        assert_eq!(atomic_waitstop(v), 1);
        assert_eq!(atomic_gwaiting(v), 0);
        let v = v + (1 << GWAITING_SHIFT);
        assert_eq!(atomic_gwaiting(v), 1);
        // The reserved headroom detects a decrement past zero.
        let neg = xadd(&AtomicU32::new(0), -(1 << MCPU_SHIFT));
        assert!(atomic_mcpu(neg) > MAX_GOMAXPROCS as u32);
    }

    #[test]
    fn single_proc_fifo_order() {
        let log = Arc::new(StdMutex::new(String::new()));
        let l = log.clone();
        run(move || {
            set_gomaxprocs(1);
            for id in ["a", "b", "c"] {
                let l = l.clone();
                spawn(move || {
                    for _ in 0..3 {
                        push(&l, id);
                        yield_now();
                    }
                });
            }
        });
        assert_eq!(log.lock().unwrap().as_str(), "abcabcabc");
    }

    #[test]
    fn parallel_two_spinners() {
        let c1 = Arc::new(AtomicU64::new(0));
        let c2 = Arc::new(AtomicU64::new(0));
        let (a, b) = (c1.clone(), c2.clone());
        run(move || {
            set_gomaxprocs(2);
            let a = a.clone();
            let b = b.clone();
            spawn(move || {
                let t = std::time::Instant::now();
                while t.elapsed() < Duration::from_millis(10) {
                    a.fetch_add(1, Ordering::Relaxed);
                }
            });
            spawn(move || {
                let t = std::time::Instant::now();
                while t.elapsed() < Duration::from_millis(10) {
                    b.fetch_add(1, Ordering::Relaxed);
                }
            });
        });
        assert!(c1.load(Ordering::Relaxed) > 0);
        assert!(c2.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn syscall_releases_the_cpu() {
        let a_count = Arc::new(AtomicU64::new(0));
        let b_done = Arc::new(AtomicBool::new(false));
        let a_seen_during = Arc::new(AtomicU64::new(0));
        let (ac, bd, seen) = (a_count.clone(), b_done.clone(), a_seen_during.clone());
        run(move || {
            set_gomaxprocs(1);
            let (ac2, bd2) = (ac.clone(), bd.clone());
            spawn(move || {
                while !bd2.load(Ordering::SeqCst) {
                    ac2.fetch_add(1, Ordering::Relaxed);
                    yield_now();
                }
            });
            let (ac3, bd3, seen3) = (ac.clone(), bd.clone(), seen.clone());
            spawn(move || {
                enter_syscall();
                // Block in "the syscall" until the compute task has
                // demonstrably run on another worker.
                let t0 = std::time::Instant::now();
                while ac3.load(Ordering::Relaxed) == 0 && t0.elapsed() < Duration::from_secs(5) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                exit_syscall();
                seen3.store(ac3.load(Ordering::Relaxed), Ordering::SeqCst);
                bd3.store(true, Ordering::SeqCst);
            });
        });
        // The compute task kept running while the syscall slept.
        assert!(a_seen_during.load(Ordering::SeqCst) > 0);
        assert!(b_done.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_the_world_drains_cpus() {
        const N: usize = 8;
        let counters: Arc<Vec<AtomicU64>> = Arc::new((0..N).map(|_| AtomicU64::new(0)).collect());
        let released = Arc::new(AtomicBool::new(false));
        let frozen_ok = Arc::new(AtomicBool::new(false));
        let drained_ok = Arc::new(AtomicBool::new(false));
        let resumed_ok = Arc::new(AtomicBool::new(false));
        let (cs, rel, froz, drained, resumed) = (
            counters.clone(),
            released.clone(),
            frozen_ok.clone(),
            drained_ok.clone(),
            resumed_ok.clone(),
        );
        run(move || {
            set_gomaxprocs(4);
            for i in 0..N {
                let cs = cs.clone();
                let rel = rel.clone();
                spawn(move || {
                    while !rel.load(Ordering::SeqCst) {
                        cs[i].fetch_add(1, Ordering::Relaxed);
                        yield_now();
                    }
                });
            }
            let (cs, rel, froz, drained, resumed) = (
                cs.clone(),
                rel.clone(),
                froz.clone(),
                drained.clone(),
                resumed.clone(),
            );
            spawn(move || {
                // Let the spinners get going.
                for _ in 0..50 {
                    yield_now();
                }
                stop_the_world();
                let v = unsafe { (*sched()).atomic.load(Ordering::SeqCst) };
                drained.store(atomic_mcpu(v) <= 1, Ordering::SeqCst);

                let snap: Vec<u64> = cs.iter().map(|c| c.load(Ordering::SeqCst)).collect();
                std::thread::sleep(Duration::from_millis(20));
                let still: Vec<u64> = cs.iter().map(|c| c.load(Ordering::SeqCst)).collect();
                froz.store(snap == still, Ordering::SeqCst);

                start_the_world();
                // Every spinner makes progress again.
                loop {
                    let moved = cs
                        .iter()
                        .zip(snap.iter())
                        .all(|(c, s)| c.load(Ordering::SeqCst) > *s);
                    if moved {
                        break;
                    }
                    yield_now();
                }
                resumed.store(true, Ordering::SeqCst);
                rel.store(true, Ordering::SeqCst);
            });
        });
        assert!(drained_ok.load(Ordering::SeqCst), "mcpu did not drain to 1");
        assert!(frozen_ok.load(Ordering::SeqCst), "spinners ran while stopped");
        assert!(resumed_ok.load(Ordering::SeqCst));
    }

    #[test]
    fn pinned_task_stays_on_its_worker() {
        let stable = Arc::new(AtomicBool::new(false));
        let was_pinned = Arc::new(AtomicBool::new(false));
        let (st, wp) = (stable.clone(), was_pinned.clone());
        run(move || {
            set_gomaxprocs(2);
            let (st, wp) = (st.clone(), wp.clone());
            spawn(move || {
                lock_os_thread();
                wp.store(locked_os_thread(), Ordering::SeqCst);
                let w = worker_id();
                let mut ok = true;
                for _ in 0..20 {
                    yield_now();
                    ok &= worker_id() == w;
                }
                unlock_os_thread();
                st.store(ok, Ordering::SeqCst);
            });
            // Cross-traffic so an unpinned task could migrate.
            for _ in 0..3 {
                spawn(|| {
                    for _ in 0..30 {
                        yield_now();
                    }
                });
            }
        });
        assert!(was_pinned.load(Ordering::SeqCst));
        assert!(stable.load(Ordering::SeqCst));
    }

    #[test]
    fn lowering_gomaxprocs_reports_old_value() {
        let old = Arc::new(StdAtomicI32::new(0));
        let now = Arc::new(StdAtomicI32::new(0));
        let (o, n) = (old.clone(), now.clone());
        run(move || {
            set_gomaxprocs(4);
            let (o, n) = (o.clone(), n.clone());
            spawn(move || {
                o.store(set_gomaxprocs(1), Ordering::SeqCst);
                n.store(gomaxprocs(), Ordering::SeqCst);
            });
        });
        assert_eq!(old.load(Ordering::SeqCst), 4);
        assert_eq!(now.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn park_and_ready_round_trip() {
        let woke = Arc::new(AtomicBool::new(false));
        let w = woke.clone();
        run(move || {
            set_gomaxprocs(1);
            let w = w.clone();
            let t = spawn(move || {
                park("test wait");
                w.store(true, Ordering::SeqCst);
            });
            spawn(move || {
                // FIFO guarantees the parker ran (and parked) first.
                ready(&t);
            });
        });
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn goids_are_monotonic() {
        let ids = Arc::new(StdMutex::new(Vec::new()));
        let i = ids.clone();
        run(move || {
            set_gomaxprocs(1);
            for _ in 0..5 {
                let i = i.clone();
                spawn(move || {
                    i.lock().unwrap().push(current());
                });
            }
        });
        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 5);
        for w in ids.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn task_counts_and_reuse() {
        let peak = Arc::new(StdAtomicI32::new(0));
        let p = peak.clone();
        run(move || {
            set_gomaxprocs(1);
            for _ in 0..50 {
                spawn(|| {});
            }
            p.store(num_tasks(), Ordering::SeqCst);
        });
        // Main plus fifty children were alive when sampled.
        assert_eq!(peak.load(Ordering::SeqCst), 51);
        assert_eq!(num_tasks(), 0);
    }

    #[test]
    fn dump_tasks_smoke() {
        run(|| {
            set_gomaxprocs(1);
            let t = spawn(|| {
                park("dumped while waiting");
            });
            spawn(move || {
                dump_tasks();
                ready(&t);
            });
        });
    }

    #[test]
    fn idle_task_runs_when_nothing_else_is_left() {
        let idle_done = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let (id, rel) = (idle_done.clone(), release.clone());
        run(move || {
            set_gomaxprocs(1);
            let (id, rel) = (id.clone(), rel.clone());
            let rel2 = rel.clone();
            spawn(move || {
                idle_task();
                while !rel.load(Ordering::SeqCst) {
                    yield_now();
                }
                id.store(true, Ordering::SeqCst);
            });
            spawn(move || {
                for _ in 0..10 {
                    yield_now();
                }
                rel2.store(true, Ordering::SeqCst);
            });
        });
        assert!(idle_done.load(Ordering::SeqCst));
    }

    #[test]
    fn worlds_can_run_back_to_back() {
        for _ in 0..3 {
            let hit = Arc::new(AtomicBool::new(false));
            let h = hit.clone();
            run(move || {
                let h = h.clone();
                spawn(move || h.store(true, Ordering::SeqCst));
            });
            assert!(hit.load(Ordering::SeqCst));
        }
    }
}
