//! Thin wrappers over the OS primitives the scheduler depends on:
//! pthread mutexes and condition variables, worker threads, the one-shot
//! Note event, raw fd writes and a fatal `throw`.

use std::ffi::c_void;
use std::io::ErrorKind;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::write as c_fd_write;

pub(crate) type OsMutex = libc::pthread_mutex_t;
pub(crate) type OsCond = libc::pthread_cond_t;
pub(crate) type OsThread = libc::pthread_t;

pub(crate) unsafe fn os_mutex_init(m: *mut OsMutex) {
    libc::pthread_mutex_init(m, ptr::null());
}

pub(crate) unsafe fn os_mutex_destroy(m: *mut OsMutex) {
    libc::pthread_mutex_destroy(m);
}

pub(crate) unsafe fn os_mutex_lock(m: *mut OsMutex) {
    libc::pthread_mutex_lock(m);
}

pub(crate) unsafe fn os_mutex_unlock(m: *mut OsMutex) {
    libc::pthread_mutex_unlock(m);
}

pub(crate) unsafe fn os_cond_init(c: *mut OsCond) {
    libc::pthread_cond_init(c, ptr::null());
}

pub(crate) unsafe fn os_cond_destroy(c: *mut OsCond) {
    libc::pthread_cond_destroy(c);
}

pub(crate) unsafe fn os_cond_signal(c: *mut OsCond) {
    libc::pthread_cond_signal(c);
}

pub(crate) unsafe fn os_cond_wait(c: *mut OsCond, m: *mut OsMutex) {
    libc::pthread_cond_wait(c, m);
}

/// One-shot wait/wake event.  `clear` resets it, `wakeup` fires it exactly
/// once, `sleep` blocks until it has fired.  At most one thread may sleep
/// on a note at a time.
pub(crate) struct Note {
    mu: OsMutex,
    cv: OsCond,
    set: i32,
}

impl Note {
    pub(crate) unsafe fn zeroed() -> Note {
        mem::zeroed()
    }

    pub(crate) unsafe fn init(&mut self) {
        os_mutex_init(&mut self.mu);
        os_cond_init(&mut self.cv);
        self.set = 0;
    }

    pub(crate) unsafe fn destroy(&mut self) {
        os_cond_destroy(&mut self.cv);
        os_mutex_destroy(&mut self.mu);
    }

    pub(crate) unsafe fn clear(&mut self) {
        os_mutex_lock(&mut self.mu);
        self.set = 0;
        os_mutex_unlock(&mut self.mu);
    }

    pub(crate) unsafe fn wakeup(&mut self) {
        os_mutex_lock(&mut self.mu);
        self.set = 1;
        os_cond_signal(&mut self.cv);
        os_mutex_unlock(&mut self.mu);
    }

    pub(crate) unsafe fn sleep(&mut self) {
        os_mutex_lock(&mut self.mu);
        while self.set == 0 {
            os_cond_wait(&mut self.cv, &mut self.mu);
        }
        os_mutex_unlock(&mut self.mu);
    }
}

pub(crate) unsafe fn os_thread_create_worker(
    out: *mut OsThread,
    entry: unsafe extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> i32 {
    let entry: extern "C" fn(*mut c_void) -> *mut c_void = std::mem::transmute(entry);
    libc::pthread_create(out, ptr::null(), entry, arg)
}

pub(crate) unsafe fn os_thread_join(t: OsThread) {
    libc::pthread_join(t, ptr::null_mut());
}

pub(crate) unsafe fn os_yield() {
    libc::sched_yield();
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ps = if ps <= 0 { 4096 } else { ps as usize };
    PAGE_SIZE.store(ps, Ordering::Relaxed);
    ps
}

pub(crate) fn fd_write_bytes(fd: i32, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let mut off = 0usize;
    while off < bytes.len() {
        let n = unsafe {
            c_fd_write(
                fd,
                bytes[off..].as_ptr() as *const c_void,
                bytes.len() - off,
            )
        };
        if n > 0 {
            off += n as usize;
            continue;
        }
        if n == 0 {
            break;
        }
        let e = std::io::Error::last_os_error();
        if e.kind() == ErrorKind::Interrupted {
            continue;
        }
        break;
    }
}

/// Fatal invariant violation.  Prints the message to stderr and aborts;
/// never surfaced to task code.
pub(crate) fn throw(msg: &str) -> ! {
    fd_write_bytes(2, b"fatal error: ");
    fd_write_bytes(2, msg.as_bytes());
    fd_write_bytes(2, b"\n");
    unsafe { libc::abort() }
}

pub(crate) fn exit(code: i32) -> ! {
    unsafe { libc::exit(code) }
}

pub(crate) fn env_i32(name: &str, defv: i32) -> i32 {
    if let Ok(val) = std::env::var(name) {
        if let Ok(v) = val.parse::<i32>() {
            if v > 0 {
                return v;
            }
        }
    }
    defv
}

pub(crate) fn env_usize(name: &str, defv: usize) -> usize {
    if let Ok(val) = std::env::var(name) {
        if let Ok(v) = val.parse::<usize>() {
            if v > 0 {
                return v;
            }
        }
    }
    defv
}
