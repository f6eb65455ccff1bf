//! SIGINT/SIGTERM turn into cancellation instead of killing us outright, so
//! scoped cleanups (unmounts, servo restore) still run.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static FOREGROUND_PGID: AtomicI32 = AtomicI32::new(0);

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub(crate) fn set_foreground(pgid: u32) {
    FOREGROUND_PGID.store(pgid as i32, Ordering::SeqCst);
}

pub(crate) fn clear_foreground() {
    FOREGROUND_PGID.store(0, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    // Only async-signal-safe work here: atomics and kill(2).
    INTERRUPTED.store(true, Ordering::SeqCst);
    let pgid = FOREGROUND_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }
    }
}

#[cfg(unix)]
pub fn install() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install() {}
