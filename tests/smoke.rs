//! End-to-end scenarios through the public surface only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn push(log: &Arc<Mutex<String>>, s: &str) {
    match log.lock() {
        Ok(mut g) => g.push_str(s),
        Err(e) => e.into_inner().push_str(s),
    }
}

#[test]
fn fifo_round_robin_under_one_cpu() {
    init_tracing();
    let log = Arc::new(Mutex::new(String::new()));
    let l = log.clone();
    greenrt::run(move || {
        greenrt::set_gomaxprocs(1);
        for id in ["a", "b", "c"] {
            let l = l.clone();
            greenrt::spawn(move || {
                for _ in 0..3 {
                    push(&l, id);
                    greenrt::yield_now();
                }
            });
        }
    });
    assert_eq!(log.lock().unwrap().as_str(), "abcabcabc");
}

#[test]
fn deferred_calls_run_lifo() {
    init_tracing();
    let log = Arc::new(Mutex::new(String::new()));
    let l = log.clone();
    greenrt::run(move || {
        let l = l.clone();
        greenrt::spawn(move || {
            let _ = greenrt::scope(|| {
                for s in ["1", "2", "3"] {
                    let l = l.clone();
                    greenrt::defer(move || push(&l, s));
                }
            });
        });
    });
    assert_eq!(log.lock().unwrap().as_str(), "321");
}

#[test]
fn defers_run_at_scope_exit_not_task_exit() {
    init_tracing();
    let log = Arc::new(Mutex::new(String::new()));
    let l = log.clone();
    greenrt::run(move || {
        let l = l.clone();
        greenrt::spawn(move || {
            let l2 = l.clone();
            let _ = greenrt::scope(move || {
                let l3 = l2.clone();
                greenrt::defer(move || push(&l3, "1"));
            });
            push(&l, "2");
        });
    });
    assert_eq!(log.lock().unwrap().as_str(), "12");
}

#[test]
fn recover_cancels_a_panic_once() {
    init_tracing();
    let first = Arc::new(Mutex::new(None::<String>));
    let second_is_none = Arc::new(AtomicBool::new(false));
    let b_recovered = Arc::new(AtomicBool::new(false));
    let a_resumed = Arc::new(AtomicBool::new(false));
    let (f, s, b, a) = (
        first.clone(),
        second_is_none.clone(),
        b_recovered.clone(),
        a_resumed.clone(),
    );
    greenrt::run(move || {
        let (f, s, b, a) = (f.clone(), s.clone(), b.clone(), a.clone());
        greenrt::spawn(move || {
            // "A calls B": B is the scope below.
            let r = greenrt::scope(|| {
                let (f, s) = (f.clone(), s.clone());
                greenrt::defer(move || {
                    if let Some(v) = greenrt::recover() {
                        if let Some(msg) = v.downcast_ref::<&str>() {
                            match f.lock() {
                                Ok(mut g) => *g = Some(msg.to_string()),
                                Err(e) => *e.into_inner() = Some(msg.to_string()),
                            }
                        }
                    }
                    s.store(greenrt::recover().is_none(), Ordering::SeqCst);
                });
                greenrt::panic_any("boom");
            });
            b.store(r.is_none(), Ordering::SeqCst);
            a.store(true, Ordering::SeqCst);
        });
    });
    assert_eq!(first.lock().unwrap().as_deref(), Some("boom"));
    assert!(second_is_none.load(Ordering::SeqCst), "second recover must be None");
    assert!(b_recovered.load(Ordering::SeqCst), "scope must report the recovery");
    assert!(a_resumed.load(Ordering::SeqCst), "caller must resume normally");
}

#[test]
fn recover_fails_outside_the_top_frame() {
    init_tracing();

    #[inline(never)]
    fn recover_from_helper() -> bool {
        // Deep enough below the deferred call's entry frame to fall out
        // of the recovery window.
        let mut pad = [0u8; 4096];
        std::hint::black_box(&mut pad);
        greenrt::recover().is_some()
    }

    let helper_got = Arc::new(AtomicBool::new(true));
    let direct_got = Arc::new(AtomicBool::new(false));
    let (h, d) = (helper_got.clone(), direct_got.clone());
    greenrt::run(move || {
        let (h, d) = (h.clone(), d.clone());
        greenrt::spawn(move || {
            let _ = greenrt::scope(|| {
                let (h, d) = (h.clone(), d.clone());
                greenrt::defer(move || {
                    h.store(recover_from_helper(), Ordering::SeqCst);
                    d.store(greenrt::recover().is_some(), Ordering::SeqCst);
                });
                greenrt::panic_any("nested");
            });
        });
    });
    assert!(!helper_got.load(Ordering::SeqCst), "nested frame must not recover");
    assert!(direct_got.load(Ordering::SeqCst), "top frame must recover");
}

#[test]
fn recover_without_panic_is_none() {
    init_tracing();
    let got = Arc::new(AtomicBool::new(true));
    let g = got.clone();
    greenrt::run(move || {
        let g = g.clone();
        greenrt::spawn(move || {
            let _ = greenrt::scope(|| {
                let g = g.clone();
                greenrt::defer(move || {
                    g.store(greenrt::recover().is_some(), Ordering::SeqCst);
                });
            });
        });
    });
    assert!(!got.load(Ordering::SeqCst));
}

#[test]
fn task_exit_runs_pending_defers_and_stops_the_task() {
    init_tracing();
    let log = Arc::new(Mutex::new(String::new()));
    let l = log.clone();
    greenrt::run(move || {
        let l = l.clone();
        greenrt::spawn(move || {
            let l2 = l.clone();
            let _ = greenrt::scope(move || {
                let l3 = l2.clone();
                greenrt::defer(move || push(&l3, "d"));
                greenrt::task_exit();
            });
            push(&l, "unreachable");
        });
    });
    assert_eq!(log.lock().unwrap().as_str(), "d");
}

#[test]
fn stacks_grow_and_shrink_on_demand() {
    init_tracing();

    fn rec(n: u32) -> u64 {
        greenrt::maybe_grow(48 * 1024, || {
            let mut buf = [0u8; 8192];
            buf[0] = (n & 0xff) as u8;
            std::hint::black_box(&mut buf);
            if n == 0 {
                u64::from(buf[0])
            } else {
                rec(n - 1) + u64::from(buf[0])
            }
        })
    }

    let total = Arc::new(AtomicU64::new(0));
    let t = total.clone();
    greenrt::run(move || {
        let t = t.clone();
        greenrt::spawn(move || {
            t.store(rec(24), Ordering::SeqCst);
        });
    });
    let want: u64 = (0..=24u64).map(|n| n & 0xff).sum();
    assert_eq!(total.load(Ordering::SeqCst), want);
}

#[test]
fn syscall_brackets_keep_running_on_the_fast_path() {
    init_tracing();
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    greenrt::run(move || {
        let d = d.clone();
        greenrt::spawn(move || {
            greenrt::enter_syscall();
            std::thread::sleep(std::time::Duration::from_millis(1));
            greenrt::exit_syscall();
            d.store(true, Ordering::SeqCst);
        });
    });
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn counters_report_workers_and_tasks() {
    init_tracing();
    let workers = Arc::new(AtomicU64::new(0));
    let w = workers.clone();
    greenrt::run(move || {
        greenrt::set_gomaxprocs(2);
        let w = w.clone();
        greenrt::spawn(move || {
            w.store(greenrt::num_workers() as u64, Ordering::SeqCst);
        });
    });
    assert!(workers.load(Ordering::SeqCst) >= 1);
    assert_eq!(greenrt::num_tasks(), 0);
}
