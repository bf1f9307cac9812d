//! greenrt is a user-level M:N task scheduler: lightweight stackful
//! tasks are multiplexed onto OS worker threads, bounded by a
//! configurable parallelism ceiling (`GOMAXPROCS`).  Tasks yield
//! cooperatively, hand their cpu slot away around blocking system calls,
//! can be pinned to their worker, grow their stacks segment by segment,
//! and carry Go-style defer/panic/recover semantics.  A stop-the-world
//! barrier drains execution to a single cpu for collectors.
//!
//! ```no_run
//! greenrt::run(|| {
//!     greenrt::spawn(|| {
//!         greenrt::scope(|| {
//!             greenrt::defer(|| println!("last"));
//!             println!("first");
//!         });
//!     });
//! });
//! ```

#![allow(dead_code, unsafe_op_in_unsafe_fn, static_mut_refs)]

mod ctx;
mod panic;
mod sched;
mod stack;
mod stats;
mod sys;

pub use panic::{defer, panic_any, recover, scope, task_exit};
pub use sched::{
    CpuProfileFn, MAX_GOMAXPROCS, Task, current, dump_tasks, enter_syscall, exit_syscall,
    gomaxprocs, idle_task, lock_os_thread, locked_os_thread, num_tasks, num_workers, park, ready,
    run, set_cpu_profile_rate, set_gomaxprocs, sigprof, spawn, start_the_world, stop_the_world,
    unlock_os_thread, worker_id, yield_now,
};
pub use stack::maybe_grow;
