use crate::pool::Event;
use crate::ui::Ui;
use libc::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, spawn};
use std::time::Duration;

// Handlers only flip these; the monitor thread does the real work.
static TERM: AtomicBool = AtomicBool::new(false);
static INTERRUPT: AtomicBool = AtomicBool::new(false);
static SKIP_SLEEP: AtomicBool = AtomicBool::new(false);
static STOP_LOOPING: AtomicBool = AtomicBool::new(false);

pub fn install() {
    unsafe {
        libc::signal(SIGTERM, handle_signal as usize);
        libc::signal(SIGINT, handle_signal as usize);
        libc::signal(SIGHUP, handle_signal as usize);
        libc::signal(SIGUSR1, handle_signal as usize);
        libc::signal(SIGUSR2, handle_signal as usize);
    }
}

extern "C" fn handle_signal(signal: i32) {
    match signal {
        SIGTERM => TERM.store(true, Ordering::Relaxed),
        SIGINT => INTERRUPT.store(true, Ordering::Relaxed),
        SIGHUP | SIGUSR1 => SKIP_SLEEP.store(true, Ordering::Relaxed),
        SIGUSR2 => STOP_LOOPING.store(true, Ordering::Relaxed),
        _ => (),
    }
}

/// Watch the signal flags and translate them into engine events: SIGTERM and
/// SIGINT terminate immediately, SIGHUP/SIGUSR1 skip every account's current
/// sleep once, SIGUSR2 ends the autorefresh loops after the running cycle.
pub fn monitor(ui: Arc<Ui>, abort: Arc<Event>, skip_flags: Vec<Arc<AtomicBool>>) {
    spawn(move || loop {
        if TERM.swap(false, Ordering::Relaxed) {
            ui.warn("signal", "terminating...");
            std::process::exit(0);
        }
        if INTERRUPT.swap(false, Ordering::Relaxed) {
            ui.warn("signal", "interrupted, aborting...");
            std::process::exit(1);
        }
        if SKIP_SLEEP.swap(false, Ordering::Relaxed) {
            ui.info("signal", "resync requested, skipping sleep");
            for flag in &skip_flags {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if STOP_LOOPING.swap(false, Ordering::Relaxed) {
            ui.info("signal", "will stop after the current cycle");
            abort.set();
        }
        sleep(Duration::from_millis(500));
    });
}
