use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

/// A counting semaphore bounding how many tasks of one instance class run at
/// a time. Task creators block in `acquire` until a slot frees.
pub struct InstanceLimit {
    count: Mutex<usize>,
    cond: Condvar,
    max: usize,
}

impl InstanceLimit {
    pub fn new(max: usize) -> InstanceLimit {
        InstanceLimit {
            count: Mutex::new(0),
            cond: Condvar::new(),
            max: max.max(1),
        }
    }

    fn acquire(self: &Arc<Self>) -> Permit {
        let mut count = self.count.lock().unwrap();
        while *count >= self.max {
            count = self.cond.wait(count).unwrap();
        }
        *count += 1;
        Permit {
            limit: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        self.cond.notify_one();
    }
}

/// RAII slot in an `InstanceLimit`; dropping it frees the slot.
pub struct Permit {
    limit: Arc<InstanceLimit>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limit.release();
    }
}

/// The named pools: `ACCOUNTLIMIT`, `FOLDER_<repo>`, `MSGCOPY_<repo>`.
/// All names are registered by the driver before any account starts.
pub struct Limits {
    pools: Mutex<HashMap<String, Arc<InstanceLimit>>>,
}

impl Limits {
    pub fn new() -> Limits {
        Limits {
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn init(&self, name: &str, max: usize) {
        self.pools
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(InstanceLimit::new(max)));
    }

    /// Block until a slot in the named pool frees, then hold it. Unregistered
    /// names are unbounded.
    pub fn acquire(&self, name: &str) -> Option<Permit> {
        let limit = self.pools.lock().unwrap().get(name).cloned();
        limit.map(|l| l.acquire())
    }
}

/// Spawn a named worker through a pool. The creator blocks while the pool is
/// saturated; the slot is released when the worker finishes.
pub fn spawn_limited<F, T>(
    limits: &Limits,
    instance: &str,
    thread_name: String,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let permit = limits.acquire(instance);
    Builder::new().name(thread_name).spawn(move || {
        let _permit = permit;
        f()
    })
}

/// A one-way latch with a timed wait, used as the process-wide abort signal.
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Wait up to `dur` for the event; returns whether it is set.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let flag = self.flag.lock().unwrap();
        if *flag {
            return true;
        }
        let (flag, _) = self.cond.wait_timeout(flag, dur).unwrap();
        *flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    #[test]
    fn pool_bound_is_respected() {
        let limits = Limits::new();
        limits.init("FOLDER_test", 2);
        let limits = Arc::new(limits);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for i in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let handle = spawn_limited(&limits, "FOLDER_test", format!("worker {}", i), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
            handles.push(handle);
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn unregistered_pool_is_unbounded() {
        let limits = Limits::new();
        assert!(limits.acquire("nope").is_none());
    }

    #[test]
    fn event_wakes_waiters() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let t = std::thread::spawn(move || ev2.wait_timeout(Duration::from_secs(10)));
        sleep(Duration::from_millis(10));
        ev.set();
        assert!(t.join().unwrap());
        assert!(ev.is_set());
    }

    #[test]
    fn event_times_out_unset() {
        let ev = Event::new();
        assert!(!ev.wait_timeout(Duration::from_millis(10)));
    }
}
