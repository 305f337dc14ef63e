use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::WorkerActor;
use crate::{Error, Result};

/// How pool threads interpret the affinity index list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AffinityMode {
    /// No pinning; run on every available CPU.
    All,
    /// The index list names CPUs.
    Cpu,
    /// The index list names NUMA nodes (best effort).
    Numa,
}

impl FromStr for AffinityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<AffinityMode> {
        match s {
            "" | "ALL" => Ok(AffinityMode::All),
            "CPU" => Ok(AffinityMode::Cpu),
            "NUMA" => Ok(AffinityMode::Numa),
            other => Err(Error::ThreadPool(format!("unknown affinity mode {}", other))),
        }
    }
}

/// Idle behavior of pool threads when no actor is runnable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum YieldMode {
    /// Park on a condition variable until an actor is woken.
    Condition,
    /// Spin 1024 times, then yield the time slice, and repeat.
    Hybrid,
    /// Busy-wait without yielding.
    Spin,
}

impl FromStr for YieldMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<YieldMode> {
        match s {
            "" | "CONDITION" => Ok(YieldMode::Condition),
            "HYBRID" => Ok(YieldMode::Hybrid),
            "SPIN" => Ok(YieldMode::Spin),
            other => Err(Error::ThreadPool(format!("unknown yield mode {}", other))),
        }
    }
}

/// Thread pool configuration.
#[derive(Clone, Debug)]
pub struct ThreadPoolArgs {
    /// Thread count; 0 means one per logical CPU plus one.
    pub num_threads: usize,
    /// −1.0…+1.0. Zero is nominal scheduling; positive values request the
    /// realtime class where the platform allows it.
    pub priority: f64,
    pub affinity_mode: AffinityMode,
    /// CPUs or NUMA nodes, per `affinity_mode`.
    pub affinity: Vec<usize>,
    pub yield_mode: YieldMode,
}

impl Default for ThreadPoolArgs {
    fn default() -> ThreadPoolArgs {
        ThreadPoolArgs {
            num_threads: 0,
            priority: 0.0,
            affinity_mode: AffinityMode::All,
            affinity: Vec::new(),
            yield_mode: YieldMode::Condition,
        }
    }
}

impl ThreadPoolArgs {
    pub fn with_num_threads(num_threads: usize) -> ThreadPoolArgs {
        ThreadPoolArgs {
            num_threads,
            ..Default::default()
        }
    }
}

/// The wake channel between actors and parked pool threads.
#[derive(Default)]
pub(crate) struct PoolSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl PoolSignal {
    pub(crate) fn notify(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        *flag = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        if !*flag {
            let (next, _) = self
                .cond
                .wait_timeout(flag, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            flag = next;
        }
        *flag = false;
    }
}

struct PoolShared {
    args: ThreadPoolArgs,
    actors: Mutex<Vec<Arc<WorkerActor>>>,
    signal: Arc<PoolSignal>,
    stopping: AtomicBool,
}

struct PoolInner {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Maps worker actors onto OS threads.
///
/// Threads repeatedly scan the attached actors; the exclusivity primitive
/// guarantees each actor runs on at most one thread at a time. Shutdown is
/// cooperative: threads finish the message or work call in flight.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(args: ThreadPoolArgs) -> Result<ThreadPool> {
        if !args.priority.is_finite() || !(-1.0..=1.0).contains(&args.priority) {
            return Err(Error::ThreadPool(format!(
                "priority out of range {}",
                args.priority
            )));
        }
        Ok(ThreadPool {
            inner: Arc::new(PoolInner {
                shared: Arc::new(PoolShared {
                    args,
                    actors: Mutex::new(Vec::new()),
                    signal: Arc::new(PoolSignal::default()),
                    stopping: AtomicBool::new(false),
                }),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Pools compare by identity; a topology keeps blocks that share a
    /// pool on the same threads.
    pub fn same(a: &ThreadPool, b: &ThreadPool) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn attach(&self, actor: &Arc<WorkerActor>) {
        {
            let mut actors = self
                .inner
                .shared
                .actors
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if actors.iter().any(|a| a.uid() == actor.uid()) {
                return;
            }
            actors.push(Arc::clone(actor));
        }
        actor.set_wait_mode(self.inner.shared.args.yield_mode == YieldMode::Condition);
        actor.attach_pool_signal(Arc::clone(&self.inner.shared.signal));
        self.ensure_threads();
    }

    pub(crate) fn detach(&self, uid: usize) {
        let mut actors = self
            .inner
            .shared
            .actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        actors.retain(|a| a.uid() != uid);
    }

    fn ensure_threads(&self) {
        let mut threads = self
            .inner
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !threads.is_empty() {
            return;
        }
        let count = effective_threads(&self.inner.shared.args);
        log::debug!("thread pool starting {} threads", count);
        for index in 0..count {
            let shared = Arc::clone(&self.inner.shared);
            let handle = thread::Builder::new()
                .name(format!("runnel-worker-{}", index))
                .spawn(move || run_worker(shared));
            match handle {
                Ok(handle) => threads.push(handle),
                Err(e) => log::error!("failed to spawn pool thread: {}", e),
            }
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("args", &self.inner.shared.args)
            .finish()
    }
}

impl Default for ThreadPool {
    fn default() -> ThreadPool {
        // default args always validate
        match ThreadPool::new(ThreadPoolArgs::default()) {
            Ok(pool) => pool,
            Err(_) => unreachable!("default thread pool args are valid"),
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.signal.notify();
        let threads = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in threads {
            let _ = handle.join();
        }
    }
}

fn effective_threads(args: &ThreadPoolArgs) -> usize {
    if args.num_threads != 0 {
        return args.num_threads;
    }
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1) + 1
}

const HYBRID_SPINS: u32 = 1024;

fn run_worker(shared: Arc<PoolShared>) {
    apply_thread_tuning(&shared.args);

    let mut spins = 0u32;
    while !shared.stopping.load(Ordering::Acquire) {
        let actors: Vec<Arc<WorkerActor>> = shared
            .actors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut progress = false;
        for actor in &actors {
            if shared.stopping.load(Ordering::Acquire) {
                return;
            }
            if actor.try_process(None) {
                progress = true;
            }
        }
        if progress {
            spins = 0;
            continue;
        }

        match shared.args.yield_mode {
            YieldMode::Condition => shared.signal.wait(Duration::from_millis(100)),
            YieldMode::Hybrid => {
                spins += 1;
                if spins > HYBRID_SPINS {
                    thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
            YieldMode::Spin => std::hint::spin_loop(),
        }
    }
}

#[cfg(unix)]
fn apply_thread_tuning(args: &ThreadPoolArgs) {
    if args.priority > 0.0 {
        unsafe {
            let policy = libc::SCHED_RR;
            let max = libc::sched_get_priority_max(policy);
            let min = libc::sched_get_priority_min(policy);
            if max > min {
                let priority = min + ((max - min) as f64 * args.priority) as libc::c_int;
                let param = libc::sched_param {
                    sched_priority: priority,
                };
                if libc::pthread_setschedparam(libc::pthread_self(), policy, &param) != 0 {
                    log::warn!("realtime priority was not granted; running at nominal priority");
                }
            }
        }
    } else if args.priority < 0.0 {
        unsafe {
            let offset = (-args.priority * 19.0) as libc::c_int;
            let _ = libc::nice(offset);
        }
    }

    match args.affinity_mode {
        AffinityMode::All => {}
        AffinityMode::Cpu => pin_to_cpus(&args.affinity),
        AffinityMode::Numa => {
            log::debug!("NUMA affinity hint {:?} (best effort, not applied)", args.affinity);
        }
    }
}

#[cfg(not(unix))]
fn apply_thread_tuning(_args: &ThreadPoolArgs) {}

#[cfg(target_os = "linux")]
fn pin_to_cpus(cpus: &[usize]) {
    if cpus.is_empty() {
        return;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!("CPU affinity {:?} was not applied", cpus);
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pin_to_cpus(cpus: &[usize]) {
    log::debug!("CPU affinity hint {:?} (best effort, not applied)", cpus);
}
