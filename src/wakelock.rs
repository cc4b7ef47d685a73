//! Named wakelocks keeping the CPU awake while bus work is in flight.
//!
//! The kernel primitive is reference-counted by name: the sysfs interface is
//! only written when a name goes from zero to one holders and back. Unique
//! names for per-call locks come from a fixed prefix and a monotonic counter,
//! so two concurrent calls never share a lock.

use std::{
    collections::HashMap,
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use event_listener::Event;
use tracing::{debug, trace, warn};

const SYSFS_LOCK: &str = "/sys/power/wake_lock";
const SYSFS_UNLOCK: &str = "/sys/power/wake_unlock";

/// Prefix for uniquely named per-call locks.
pub const CALL_LOCK_PREFIX: &str = "devmoded_call_";
/// Shared lock held for the duration of one inbound dispatch.
pub const DISPATCH_LOCK: &str = "devmoded_dispatch";
/// Timed lock spanning the queueing of no-reply sends and signals.
pub const SEND_LOCK: &str = "devmoded_send";
/// How long the queueing lock may outlive the send operation.
pub const SEND_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Where lock and unlock requests end up. The daemon talks to the kernel;
/// tests record.
pub trait Sink: Send + Sync {
    fn acquire(&self, name: &str);
    fn release(&self, name: &str);
    /// A lock the kernel drops by itself after `timeout`; never released
    /// explicitly.
    fn acquire_timed(&self, name: &str, timeout: Duration);
}

/// Writes lock names to the sysfs wakelock interface.
pub struct SysfsSink {
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

impl SysfsSink {
    /// Probe for the kernel interface; `None` when the system has no
    /// wakelock support (e.g. build hosts).
    pub fn detect() -> Option<Self> {
        Self::at(Path::new(SYSFS_LOCK), Path::new(SYSFS_UNLOCK))
    }

    fn at(lock: &Path, unlock: &Path) -> Option<Self> {
        if lock.exists() && unlock.exists() {
            Some(Self {
                lock_path: lock.to_path_buf(),
                unlock_path: unlock.to_path_buf(),
            })
        } else {
            None
        }
    }

    fn write(path: &Path, data: &str) {
        let res = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|mut f| f.write_all(data.as_bytes()));
        if let Err(e) = res {
            debug!("wakelock write to {} failed: {}", path.display(), e);
        }
    }
}

impl Sink for SysfsSink {
    fn acquire(&self, name: &str) {
        Self::write(&self.lock_path, name);
    }

    fn release(&self, name: &str) {
        Self::write(&self.unlock_path, name);
    }

    fn acquire_timed(&self, name: &str, timeout: Duration) {
        Self::write(&self.lock_path, &format!("{} {}", name, timeout.as_nanos()));
    }
}

/// No kernel interface available; suspend is not a concern on this host.
pub struct NullSink;

impl Sink for NullSink {
    fn acquire(&self, _name: &str) {}
    fn release(&self, _name: &str) {}
    fn acquire_timed(&self, _name: &str, _timeout: Duration) {}
}

/// Records every sink operation, for tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Acquire(String),
    Release(String),
    AcquireTimed(String, Duration),
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn acquire(&self, name: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Acquire(name.to_string()));
    }

    fn release(&self, name: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Release(name.to_string()));
    }

    fn acquire_timed(&self, name: &str, timeout: Duration) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::AcquireTimed(name.to_string(), timeout));
    }
}

/// Process-wide wakelock bookkeeping.
pub struct WakelockHub {
    sink: Box<dyn Sink>,
    held: Mutex<HashMap<String, usize>>,
    counter: AtomicU64,
    idle: Event,
}

impl fmt::Debug for WakelockHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakelockHub")
            .field("held", &self.held.lock().unwrap().len())
            .finish()
    }
}

impl WakelockHub {
    pub fn new(sink: Box<dyn Sink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            held: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            idle: Event::new(),
        })
    }

    /// Kernel sink when the interface exists, otherwise a no-op sink.
    pub fn with_default_sink() -> Arc<Self> {
        match SysfsSink::detect() {
            Some(sink) => Self::new(Box::new(sink)),
            None => {
                debug!("no kernel wakelock interface, suspend blocking disabled");
                Self::new(Box::new(NullSink))
            }
        }
    }

    /// Take the named lock; released when the guard drops.
    pub fn acquire(self: &Arc<Self>, name: &str) -> Guard {
        {
            let mut held = self.held.lock().unwrap();
            let count = held.entry(name.to_string()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.sink.acquire(name);
            }
        }
        trace!("wakelock acquired: {}", name);
        Guard {
            hub: self.clone(),
            name: name.to_string(),
        }
    }

    /// Take a lock under a name no other caller holds or will ever hold.
    pub fn acquire_unique(self: &Arc<Self>, prefix: &str) -> Guard {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.acquire(&format!("{prefix}{n}"))
    }

    /// Fire-and-forget lock the kernel expires on its own.
    pub fn acquire_timed(&self, name: &str, timeout: Duration) {
        self.sink.acquire_timed(name, timeout);
    }

    fn release(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        match held.get_mut(name) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                held.remove(name);
                self.sink.release(name);
                if held.is_empty() {
                    self.idle.notify(usize::MAX);
                }
            }
            None => warn!("release of wakelock {} that is not held", name),
        }
        trace!("wakelock released: {}", name);
    }

    /// Number of distinct names currently held.
    pub fn active(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Whether the process is currently allowing suspend.
    pub fn suspend_permitted(&self) -> bool {
        self.active() == 0
    }

    /// Resolve once every held lock has been released.
    pub async fn wait_idle(&self) {
        loop {
            if self.suspend_permitted() {
                return;
            }
            let listener = self.idle.listen();
            if self.suspend_permitted() {
                return;
            }
            listener.await;
        }
    }
}

/// Scoped hold on a named wakelock.
pub struct Guard {
    hub: Arc<WakelockHub>,
    name: String,
}

impl Guard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Guard").field(&self.name).finish()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.hub.release(&self.name);
    }
}
