//! Resource enforcement: the interrupter and the watchers that trip it.
//!
//! Every abort path (wall-clock timeout, memory ceiling, caller
//! cancellation) goes through one [`Interrupter`] per execution. The first
//! trip wins and records its [`AbortReason`]; later trips are no-ops. A trip
//! terminates V8 execution, which the isolate observes at the next call or
//! loop back-edge, and wakes the event-loop driver so a guest blocked on a
//! pending host call is aborted too.
//!
//! Watchers run on their own threads, since the isolate thread is busy
//! running guest code while they need to act. Each is stopped and joined
//! before the execution returns.
//!
//! ArrayBuffer backing stores live outside the V8 heap, so heap limits alone
//! do not bound them. A [`BufferBudget`] allocator refuses backing stores past
//! the memory limit and trips the interrupter when it does.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use deno_core::v8;
use tokio::sync::Notify;

/// Why an execution was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    /// The wall-clock budget elapsed.
    Timeout = 1,
    /// The guest heap exceeded the memory budget.
    MemoryExceeded = 2,
    /// The caller cancelled the execution.
    Cancelled = 3,
}

/// Marks an execution that finished before any watcher tripped.
const COMPLETED: u8 = u8::MAX;

impl AbortReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Timeout),
            2 => Some(Self::MemoryExceeded),
            3 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Error text reported in the function output.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Timeout => "script execution timed out",
            Self::MemoryExceeded => "script exceeded memory limit",
            Self::Cancelled => "script execution cancelled",
        }
    }
}

/// Single abort path shared by all watchers of one execution.
#[derive(Default)]
pub struct Interrupter {
    reason: AtomicU8,
    isolate: OnceLock<v8::IsolateHandle>,
    wake: Notify,
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("reason", &self.reason())
            .field("attached", &self.isolate.get().is_some())
            .finish()
    }
}

impl Interrupter {
    /// A fresh, untripped interrupter.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind the isolate to terminate. A trip that happened before attaching
    /// takes effect immediately.
    pub fn attach(&self, handle: v8::IsolateHandle) {
        if self.isolate.set(handle).is_err() {
            tracing::warn!("interrupter already attached to an isolate");
            return;
        }
        if self.reason().is_some() {
            if let Some(h) = self.isolate.get() {
                h.terminate_execution();
            }
        }
    }

    /// Abort with `reason`. Returns `false` if another reason already won.
    pub fn trip(&self, reason: AbortReason) -> bool {
        if self
            .reason
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tracing::debug!(?reason, "execution interrupted");
        if let Some(h) = self.isolate.get() {
            h.terminate_execution();
        }
        // notify_one stores a permit, so a driver that starts waiting later still wakes.
        self.wake.notify_one();
        true
    }

    /// Mark the guest as finished. Trips that arrive afterwards are no-ops,
    /// so a watcher firing while the execution winds down cannot turn a
    /// completed call into an abort. Returns `false` if a trip came first.
    pub fn complete(&self) -> bool {
        self.reason
            .compare_exchange(0, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The winning abort reason, if tripped.
    pub fn reason(&self) -> Option<AbortReason> {
        AbortReason::from_u8(self.reason.load(Ordering::SeqCst))
    }

    /// Resolves once the interrupter has been tripped.
    pub async fn tripped(&self) {
        while matches!(self.reason.load(Ordering::SeqCst), 0 | COMPLETED) {
            self.wake.notified().await;
        }
    }
}

/// A running watcher thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct Watcher {
    name: &'static str,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    fn spawn(
        name: &'static str,
        body: impl FnOnce(mpsc::Receiver<()>) + Send + 'static,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("funcbox-{name}"))
            .spawn(move || body(rx))?;
        Ok(Self {
            name,
            stop: Some(tx),
            thread: Some(thread),
        })
    }

    /// Signal the watcher and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel and ends recv_timeout.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(watcher = self.name, "watcher thread panicked");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Arm a timer that trips [`AbortReason::Timeout`] after `timeout`.
pub fn spawn_timeout_watcher(
    interrupter: Arc<Interrupter>,
    timeout: Duration,
) -> std::io::Result<Watcher> {
    Watcher::spawn("timeout", move |stop| {
        if let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(timeout) {
            interrupter.trip(AbortReason::Timeout);
        }
    })
}

/// Heap accounting shared between the memory watcher, the near-heap-limit
/// callback and the executor.
#[derive(Debug)]
pub struct HeapProbe {
    interrupter: Arc<Interrupter>,
    buffers: Arc<BufferBudget>,
    limit: u64,
    peak: AtomicU64,
}

impl HeapProbe {
    /// Probe that trips `interrupter` once usage exceeds `limit` bytes.
    /// `buffers` supplies the backing-store bytes allocated outside the heap.
    pub fn new(interrupter: Arc<Interrupter>, buffers: Arc<BufferBudget>, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            interrupter,
            buffers,
            limit: limit as u64,
            peak: AtomicU64::new(0),
        })
    }

    /// Record one sample of used heap bytes.
    pub fn record(&self, used: u64) {
        self.peak.fetch_max(used, Ordering::SeqCst);
        if used > self.limit {
            self.interrupter.trip(AbortReason::MemoryExceeded);
        }
    }

    /// Highest usage recorded so far.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Sample the isolate's own heap statistics: the managed heap plus
    /// external memory, of which ArrayBuffer backing stores are the bulk.
    pub fn sample(&self, isolate: &mut v8::Isolate) {
        let stats = isolate.get_heap_statistics();
        let external = stats.external_memory().max(self.buffers.used());
        self.record((stats.used_heap_size() + external) as u64);
    }
}

extern "C" fn sample_heap_interrupt(isolate: &mut v8::Isolate, data: *mut c_void) {
    // SAFETY: `data` comes from `Arc::as_ptr` on a HeapProbe that the executor
    // keeps alive until after the isolate is dropped, so any interrupt V8
    // still runs sees a live probe.
    let probe = unsafe { &*(data as *const HeapProbe) };
    probe.sample(isolate);
}

/// Sample heap usage every `interval` by interrupting the isolate, and trip
/// [`AbortReason::MemoryExceeded`] past the probe's limit.
///
/// Samples are taken on the isolate thread at the next safe point, so a guest
/// parked on a pending host call is sampled once it resumes.
pub fn spawn_memory_watcher(
    probe: Arc<HeapProbe>,
    isolate: v8::IsolateHandle,
    interval: Duration,
) -> std::io::Result<Watcher> {
    Watcher::spawn("memory", move |stop| loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if probe.interrupter.reason().is_some() {
                    return;
                }
                let data = Arc::as_ptr(&probe) as *mut c_void;
                if !isolate.request_interrupt(sample_heap_interrupt, data) {
                    // Isolate is gone or terminating.
                    return;
                }
            }
            _ => return,
        }
    })
}

extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: same lifetime argument as `sample_heap_interrupt`.
    let probe = unsafe { &*(data as *const HeapProbe) };
    probe.peak.fetch_max(current_heap_limit as u64, Ordering::SeqCst);
    probe.interrupter.trip(AbortReason::MemoryExceeded);
    // 1MB of headroom lets the termination exception unwind.
    current_heap_limit + 1024 * 1024
}

/// Byte budget for ArrayBuffer backing stores of one isolate.
#[derive(Debug)]
pub struct BufferBudget {
    interrupter: Arc<Interrupter>,
    limit: usize,
    used: AtomicUsize,
}

impl BufferBudget {
    /// Budget of `limit` bytes that trips `interrupter` when exhausted.
    pub fn new(interrupter: Arc<Interrupter>, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            interrupter,
            limit,
            used: AtomicUsize::new(0),
        })
    }

    /// Claim `len` bytes. Past the limit nothing is claimed and the
    /// interrupter trips [`AbortReason::MemoryExceeded`].
    pub fn reserve(&self, len: usize) -> bool {
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|total| *total <= self.limit)
            })
            .is_ok();
        if !reserved {
            tracing::debug!(len, limit = self.limit, "array buffer allocation refused");
            self.interrupter.trip(AbortReason::MemoryExceeded);
        }
        reserved
    }

    /// Return `len` previously reserved bytes.
    pub fn release(&self, len: usize) {
        self.used.fetch_sub(len, Ordering::SeqCst);
    }

    /// Bytes currently held by live backing stores.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// ArrayBuffer allocator drawing from this budget. The allocator keeps
    /// its own reference, released when V8 drops it.
    pub fn allocator(self: &Arc<Self>) -> v8::UniqueRef<v8::Allocator> {
        // SAFETY: the pointer comes from Arc::into_raw and is reclaimed
        // exactly once, by `budget_drop`.
        unsafe { v8::new_rust_allocator(Arc::into_raw(self.clone()), &BUDGET_VTABLE) }
    }
}

static BUDGET_VTABLE: v8::RustAllocatorVtable<BufferBudget> = v8::RustAllocatorVtable {
    allocate: budget_allocate,
    allocate_uninitialized: budget_allocate,
    free: budget_free,
    drop: budget_drop,
};

unsafe extern "C" fn budget_allocate(budget: &BufferBudget, len: usize) -> *mut c_void {
    if !budget.reserve(len) {
        // V8 turns a null backing store into a RangeError.
        return std::ptr::null_mut();
    }
    Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8 as *mut c_void
}

unsafe extern "C" fn budget_free(budget: &BufferBudget, data: *mut c_void, len: usize) {
    budget.release(len);
    if !data.is_null() {
        // SAFETY: `data` and `len` describe a boxed slice from `budget_allocate`.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(data as *mut u8, len)) });
    }
}

unsafe extern "C" fn budget_drop(budget: *const BufferBudget) {
    // SAFETY: balances the Arc::into_raw in `BufferBudget::allocator`.
    drop(unsafe { Arc::from_raw(budget) });
}

/// Trip the probe's interrupter when V8 approaches its hard heap limit.
pub fn install_heap_limit_callback(isolate: &mut v8::Isolate, probe: &Arc<HeapProbe>) {
    isolate.add_near_heap_limit_callback(
        near_heap_limit_callback,
        Arc::as_ptr(probe) as *mut c_void,
    );
}
