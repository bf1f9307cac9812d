//! Deferred calls, panic and recover.
//!
//! Function activations are explicit: `scope` brackets a body, collects
//! the `defer`s registered inside it and runs them LIFO when the body
//! returns or unwinds.  A panic walks the innermost scope's deferred
//! calls through `stack::defercall`, so each one executes above a
//! panic-tagged `Stktop`; a deferred call that invokes `recover` cancels
//! the panic and `scope` reports it by returning `None`.  Unrecovered
//! panics re-raise scope by scope until the task root prints the chain
//! and exits.
//!
//! The original design resumed the deferring frame by rewiring the
//! task's saved SP/PC from the scheduler stack.  Native frames cannot be
//! resumed that way, so the unwind itself (caught at each scope) carries
//! control back; the observable contract is the same.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr;
use std::sync::Once;

use tracing::trace;

use crate::sched::{G, tls_g};
use crate::stack::{self, Stktop};
use crate::stats::{ST_PANIC_DEFERS, stat_inc};
use crate::sys::{fd_write_bytes, throw};

type Payload = Box<dyn Any + Send>;

/// One function activation's deferred calls, linked through the task.
pub(crate) struct Scope {
    defers: Vec<Box<dyn FnOnce() + Send>>,
    link: *mut Scope,
}

/// One in-flight panic.  `arg` is taken by `recover`; `desc` survives for
/// the chain printer.
pub(crate) struct Panic {
    arg: Option<Payload>,
    desc: String,
    pub(crate) link: *mut Panic,
    stackbase: *mut u8,
    recovered: bool,
}

/// Unwind payload for a panic whose record is already on the task chain.
struct PanicRaised;

/// Unwind payload for `task_exit`.
struct Goexit;

static HOOK_ONCE: Once = Once::new();

/// Silence the default "thread panicked" report for unwinds happening on
/// a task; the runtime prints the panic chain itself if nothing recovers.
pub(crate) fn install_hook() {
    HOOK_ONCE.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !tls_g().is_null() {
                return;
            }
            prev(info);
        }));
    });
}

fn describe(arg: &Payload) -> String {
    if let Some(s) = arg.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = arg.downcast_ref::<String>() {
        return s.clone();
    }
    macro_rules! try_fmt {
        ($($ty:ty),*) => {
            $(if let Some(v) = arg.downcast_ref::<$ty>() {
                return v.to_string();
            })*
        };
    }
    try_fmt!(i32, i64, u32, u64, usize, isize, bool, f64);
    "(value of unprintable type)".to_string()
}

unsafe fn push_record(g: *mut G, arg: Payload) {
    let desc = describe(&arg);
    trace!(goid = (*g).goid, desc = desc.as_str(), "panic");
    let p = Box::into_raw(Box::new(Panic {
        arg: Some(arg),
        desc,
        link: (*g).panic,
        stackbase: (*g).stackbase,
        recovered: false,
    }));
    (*g).panic = p;
}

/// Raise a panic on the current task with `v` as the argument.  Off-task
/// callers fall through to the standard panic machinery.
pub fn panic_any<T: Any + Send>(v: T) -> ! {
    let g = tls_g();
    if g.is_null() {
        std::panic::panic_any(v);
    }
    unsafe {
        push_record(g, Box::new(v));
    }
    std::panic::panic_any(PanicRaised);
}

/// Terminate the current task, running every pending deferred call on
/// the way out.
pub fn task_exit() -> ! {
    if tls_g().is_null() {
        throw("task_exit outside task");
    }
    std::panic::panic_any(Goexit);
}

/// Register `f` to run when the innermost enclosing `scope` exits.
pub fn defer(f: impl FnOnce() + Send + 'static) {
    let g = tls_g();
    if g.is_null() {
        throw("defer outside task");
    }
    unsafe {
        let sc = (*g).scope;
        if sc.is_null() {
            throw("defer outside scope");
        }
        (*sc).defers.push(Box::new(f));
    }
}

/// Cancel the panic in flight, if the caller is the top frame of a
/// deferred call the panic walk invoked.  Returns the panic argument on
/// success; the next call returns `None`.
pub fn recover() -> Option<Payload> {
    let g = tls_g();
    if g.is_null() {
        return None;
    }
    unsafe {
        let p = (*g).panic;
        if p.is_null() || (*p).recovered {
            return None;
        }
        let mut top = (*g).stackbase as *mut Stktop;
        if top.is_null() {
            return None;
        }
        let mut check_window = true;
        if !(*top).panic {
            // The deferred call may have grown its own stack once; a
            // plain growth record (no entry SP) is transparent, anything
            // else is a deeper frame.
            if !(*top).entry_sp.is_null() {
                return None;
            }
            let below = (*top).stackbase as *mut Stktop;
            if below.is_null() || !(*below).panic {
                return None;
            }
            top = below;
            check_window = false;
        }
        if check_window {
            let sp = stack::approx_sp() as usize;
            let entry = (*top).entry_sp as usize;
            if entry == 0 || sp > entry || entry - sp > stack::RECOVER_WINDOW {
                return None;
            }
        }
        (*p).recovered = true;
        trace!(goid = (*g).goid, "recover");
        (*p).arg.take()
    }
}

/// Pin the recovery window to the point where the runtime hands control
/// to the deferred closure itself, so `recover` can tell the closure's
/// own frame from anything it calls.
#[inline(always)]
fn mark_defer_entry() {
    let g = tls_g();
    if g.is_null() {
        return;
    }
    unsafe {
        let top = (*g).stackbase as *mut Stktop;
        if !top.is_null() && !(*top).entry_sp.is_null() {
            (*top).entry_sp = stack::approx_sp();
        }
    }
}

enum Mode {
    Normal,
    Panicking,
    Exiting,
}

/// Run a scope's deferred calls after its body finished with `incoming`
/// (`None` for a normal return, the unwind payload otherwise).  Returns
/// the payload still to be re-raised and whether a panic was cancelled.
unsafe fn rundefers(g: *mut G, sc: &mut Scope, incoming: Option<Payload>) -> (Option<Payload>, bool) {
    let mut recovered_any = false;
    let mut pending = incoming;
    let mut mode = match &pending {
        None => Mode::Normal,
        Some(p) if p.is::<Goexit>() => Mode::Exiting,
        Some(_) => Mode::Panicking,
    };
    if let Mode::Panicking = mode {
        // A payload not raised by panic_any (an assert, an overflow) has
        // no record yet; adopt it into the chain.
        if let Some(p) = pending.take() {
            if !p.is::<PanicRaised>() {
                push_record(g, p);
            }
        }
        pending = Some(Box::new(PanicRaised));
    }

    while let Some(f) = sc.defers.pop() {
        if let Mode::Panicking = mode {
            (*g).ispanic = true;
            stat_inc(&ST_PANIC_DEFERS);
        }
        // Give the deferred call its own activation so defers it
        // registers run at its return, as for any other call.
        let wrapped: Box<dyn FnOnce() + Send> = Box::new(move || {
            let _ = scope(|| {
                mark_defer_entry();
                f();
            });
        });
        let res = stack::defercall(g, wrapped);
        (*g).ispanic = false;
        match res {
            Ok(()) => {
                if let Mode::Panicking = mode {
                    while !(*g).panic.is_null() && (*(*g).panic).recovered {
                        let p = (*g).panic;
                        (*g).panic = (*p).link;
                        drop(Box::from_raw(p));
                        pending = None;
                        mode = Mode::Normal;
                        recovered_any = true;
                    }
                }
            }
            Err(p2) => {
                if p2.is::<Goexit>() {
                    pending = Some(p2);
                    mode = Mode::Exiting;
                } else {
                    if !p2.is::<PanicRaised>() {
                        push_record(g, p2);
                    }
                    pending = Some(Box::new(PanicRaised));
                    mode = Mode::Panicking;
                }
            }
        }
    }
    (pending, recovered_any)
}

/// Bracket one function activation: run `body`, then its deferred calls.
/// `Some` carries the body's value; `None` reports that the body panicked
/// and a deferred call recovered it.
pub fn scope<R>(body: impl FnOnce() -> R) -> Option<R> {
    let g = tls_g();
    if g.is_null() {
        throw("scope outside task");
    }
    unsafe {
        let mut sc = Scope {
            defers: Vec::new(),
            link: (*g).scope,
        };
        (*g).scope = &mut sc;
        let res = catch_unwind(AssertUnwindSafe(body));
        (*g).scope = sc.link;
        let (value, incoming) = match res {
            Ok(v) => (Some(v), None),
            Err(p) => (None, Some(p)),
        };
        let (outgoing, recovered) = rundefers(g, &mut sc, incoming);
        if let Some(p) = outgoing {
            resume_unwind(p);
        }
        match value {
            Some(v) => Some(v),
            None => {
                if !recovered {
                    throw("scope: unwound without payload");
                }
                None
            }
        }
    }
}

/// proc-style chain printer: oldest panic first, later entries indented,
/// recovered entries tagged.
unsafe fn printpanics(p: *mut Panic) {
    if !(*p).link.is_null() {
        printpanics((*p).link);
        fd_write_bytes(2, b"\t");
    }
    fd_write_bytes(2, b"panic: ");
    fd_write_bytes(2, (*p).desc.as_bytes());
    if (*p).recovered {
        fd_write_bytes(2, b" [recovered]");
    }
    fd_write_bytes(2, b"\n");
}

unsafe fn free_panic_chain(g: *mut G) {
    let mut p = (*g).panic;
    (*g).panic = ptr::null_mut();
    while !p.is_null() {
        let next = (*p).link;
        drop(Box::from_raw(p));
        p = next;
    }
}

/// Task root: run the entry closure inside the root scope.  An
/// unrecovered panic escaping it is fatal; a `task_exit` unwind is the
/// normal moribund path.
pub(crate) unsafe fn task_main(g: *mut G) {
    let f = match (*g).entry.take() {
        Some(f) => f,
        None => throw("task has no entry"),
    };
    let res = catch_unwind(AssertUnwindSafe(|| {
        let _ = scope(f);
    }));
    if let Err(p) = res {
        if !p.is::<Goexit>() {
            if !(*g).panic.is_null() {
                printpanics((*g).panic);
            }
            crate::sys::exit(2);
        }
    }
    free_panic_chain(g);
}
