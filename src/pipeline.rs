//! Bounded queues, worker threads, and the strict startup/shutdown sequence
//! that ties the Carver, Change Monitor, Hash Index, and the external
//! transport/storage collaborators together.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::carver::{Carver, MetaSink};
use crate::config::{ConfigError, ConfigRecord};
use crate::hash::Hash;
use crate::hash_index::{HashIndex, HashIndexError, HashStore};
use crate::metadata::MetaData;
use crate::monitor::{ChangeMonitor, ChangeEvent, MonitorError, RecarveSink};

/// Default soft bound on both the metadata-queue and the store-queue.
pub const DEFAULT_SOFT_BOUND: usize = 10_000;

/// Shutdown must complete within this soft deadline before escalating.
pub const SHUTDOWN_SOFT_DEADLINE: Duration = Duration::from_secs(30);

/// Queue sends during shutdown (the `Shutdown` sentinel) give up and drop
/// the item with a warning after this long, per the timeout policy.
pub const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `push_with_timeout` waits between `try_send` retries while a
/// bounded channel is full.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(20);

const TRANSPORT_MAX_ATTEMPTS: u32 = 3;
const TRANSPORT_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// One item carried on the metadata-queue.
#[derive(Debug)]
pub enum QueueItem {
    /// A finished capture, ready for the transport sink.
    Emit(MetaData),
    /// Sentinel appended once at shutdown; the transport-sender flushes and
    /// exits on receipt.
    Shutdown,
}

/// One item carried on the store-queue: a hint that the Hash Index has new
/// pending entries worth flushing. The batch itself is informational (for
/// logging); the index is the source of truth for what is actually pending.
#[derive(Debug)]
pub enum StoreItem {
    /// New hashes were just admitted to the index.
    Batch(Vec<Hash>),
    /// Sentinel appended once at shutdown.
    Shutdown,
}

/// Outcome of handing one `MetaData` to the transport sink.
#[derive(Debug)]
pub enum TransportOutcome {
    /// Accepted.
    Ack,
    /// A retryable failure (the sink's own retry policy has already given
    /// up, or it never retries internally).
    Transient(String),
    /// Not retryable; the item is dropped after one attempt.
    Permanent(String),
}

/// The outbound collaborator the original spec calls an "external sink":
/// not owned or persisted by this crate, only called through this trait.
pub trait TransportSink: Send + Sync {
    /// Hand one finished capture to the transport layer.
    fn submit(&self, meta: &MetaData) -> TransportOutcome;
}

/// A `TransportSink` that validates and logs every record it receives and
/// always acknowledges it. Stands in for the real wire client, whose RPC
/// layer is out of scope for this crate.
#[derive(Debug, Default)]
pub struct LoggingTransport;

impl TransportSink for LoggingTransport {
    fn submit(&self, meta: &MetaData) -> TransportOutcome {
        info!(
            "submit {} ({} blocks, {} bytes)",
            meta.path,
            meta.hash_list.len(),
            meta.size
        );
        TransportOutcome::Ack
    }
}

/// Errors surfaced while running the pipeline and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A queue's receiving end was dropped before all producers finished.
    #[error("a pipeline queue disconnected unexpectedly")]
    Disconnected,
    /// Workers did not finish within the soft shutdown deadline.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimedOut(Duration),
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The Hash Index's backing store could not be opened.
    #[error(transparent)]
    HashIndex(#[from] HashIndexError),
    /// The change-notification backend failed.
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Bounded multi-producer, single-consumer queue with hysteresis
/// backpressure: producers pause once `depth` exceeds `bound` and resume
/// once it drops to half that. `depth` is the fast, lock-free read path;
/// `gate`/`resumed` exist only to park and wake producers, per the
/// `AtomicUsize` + `Condvar` pairing used for worker bookkeeping elsewhere
/// in this codebase.
pub struct BoundedQueue<T> {
    sender: SyncSender<T>,
    receiver: Mutex<Receiver<T>>,
    depth: AtomicUsize,
    gate: Mutex<()>,
    resumed: Condvar,
    bound: usize,
}

impl<T> BoundedQueue<T> {
    /// Build a queue with the given soft bound. The underlying channel
    /// capacity is the bound itself, so a producer that ignores
    /// backpressure still cannot run away unboundedly.
    pub fn new(bound: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel(bound.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
            gate: Mutex::new(()),
            resumed: Condvar::new(),
            bound,
        }
    }

    /// Current queue depth (for tests and diagnostics).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Enqueue `item`, blocking while the queue is over its soft bound.
    pub fn push(&self, item: T) -> Result<(), PipelineError> {
        {
            let mut guard = self.gate.lock();
            while self.depth.load(Ordering::Acquire) > self.bound {
                self.resumed.wait(&mut guard);
            }
        }
        self.sender.send(item).map_err(|_| PipelineError::Disconnected)?;
        self.depth.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Enqueue `item`, but give up and drop it (logging a warning) if it
    /// cannot be sent within `timeout`. Used for the `Shutdown` sentinel
    /// per spec.md §5's shutdown timeout policy: normal operation uses
    /// [`Self::push`] and never times out. Returns `true` if the item was
    /// sent, `false` if it was dropped.
    pub fn push_with_timeout(&self, item: T, timeout: Duration, label: &str) -> bool {
        let deadline = Instant::now() + timeout;

        {
            let mut guard = self.gate.lock();
            while self.depth.load(Ordering::Acquire) > self.bound {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || self.resumed.wait_for(&mut guard, remaining).timed_out() {
                    warn!(
                        "dropping {label} after waiting {timeout:?}: queue still over its \
                         backpressure bound"
                    );
                    return false;
                }
            }
        }

        let mut item = item;
        loop {
            match self.sender.try_send(item) {
                Ok(()) => {
                    self.depth.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("dropping {label}: queue receiver already disconnected");
                    return false;
                }
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        warn!("dropping {label} after waiting {timeout:?}: queue still full");
                        return false;
                    }
                    item = returned;
                    thread::sleep(SEND_RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
                }
            }
        }
    }

    /// Dequeue one item, blocking until one is available or every sender is
    /// dropped (in which case `None` is returned).
    pub fn pop(&self) -> Option<T> {
        let item = self.receiver.lock().recv().ok()?;
        let depth_after = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        if depth_after <= self.bound / 2 {
            let _guard = self.gate.lock();
            self.resumed.notify_all();
        }
        Some(item)
    }
}

/// A carve request fed to the Carver worker: the initial full sweep at
/// startup, or a single re-carve triggered by the Change Monitor.
enum CarveRequest {
    Initial,
    Recarve(PathBuf),
}

/// `MetaSink` that consults/updates the Hash Index, forwards newly-admitted
/// hashes to the store-queue, and finally forwards the capture itself to
/// the metadata-queue — the point where the two halves of the data flow
/// ("Carver/Monitor -> metadata-queue" and "Hasher -> Hash Index ->
/// store-queue") meet.
struct PipelineMetaSink<'a> {
    metadata_queue: &'a BoundedQueue<QueueItem>,
    store_queue: &'a BoundedQueue<StoreItem>,
    hash_index: &'a HashIndex,
    cancel: &'a AtomicBool,
}

impl MetaSink for PipelineMetaSink<'_> {
    fn push(&self, meta: MetaData) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return false;
        }
        let newly_admitted: Vec<Hash> = meta
            .hash_list
            .iter()
            .copied()
            .filter(|h| self.hash_index.insert_if_absent(*h))
            .collect();
        if !newly_admitted.is_empty() {
            let _ = self.store_queue.push(StoreItem::Batch(newly_admitted));
        }
        self.metadata_queue.push(QueueItem::Emit(meta)).is_ok()
    }
}

/// Forwards Change Monitor events to the Carver as re-carve requests.
struct RecarveForwarder {
    carve_tx: SyncSender<CarveRequest>,
    cancel: Arc<AtomicBool>,
}

impl RecarveSink for RecarveForwarder {
    fn push(&self, event: ChangeEvent) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return false;
        }
        debug!("re-carve requested for {}", event.path.display());
        self.carve_tx.send(CarveRequest::Recarve(event.path)).is_ok()
    }
}

fn submit_with_retry(transport: &dyn TransportSink, meta: &MetaData) -> bool {
    let mut backoff = TRANSPORT_INITIAL_BACKOFF;
    for attempt in 1..=TRANSPORT_MAX_ATTEMPTS {
        match transport.submit(meta) {
            TransportOutcome::Ack => return true,
            TransportOutcome::Permanent(reason) => {
                warn!("dropping {}: permanent transport error: {reason}", meta.path);
                return false;
            }
            TransportOutcome::Transient(reason) => {
                if attempt == TRANSPORT_MAX_ATTEMPTS {
                    warn!(
                        "dropping {} after {attempt} attempts: {reason}",
                        meta.path
                    );
                    return false;
                }
                thread::sleep(backoff);
                backoff *= 2;
            }
        }
    }
    false
}

/// Owns every long-lived worker and the descriptors they hold, replacing
/// what would otherwise be ad-hoc process-global state with fields on one
/// struct constructed once at startup.
pub struct LifecycleController {
    config: ConfigRecord,
    cancel: Arc<AtomicBool>,
    metadata_queue: Arc<BoundedQueue<QueueItem>>,
    store_queue: Arc<BoundedQueue<StoreItem>>,
    hash_index: Arc<HashIndex>,
    store: Arc<Mutex<Box<dyn HashStore + Send>>>,
    transport: Arc<dyn TransportSink>,
    monitor: ChangeMonitor,
    signal_fd: nix::sys::signalfd::SignalFd,
}

impl LifecycleController {
    /// Perform the strict startup sequence: validate configuration, open
    /// the DB and load the Hash Index, accept the (already-initialized)
    /// transport sink, block termination signals, and prepare the Change
    /// Monitor. The initial carve and main loop happen in [`Self::run`].
    pub fn new(
        config: ConfigRecord,
        mut store: Box<dyn HashStore + Send>,
        transport: Arc<dyn TransportSink>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let hash_index = Arc::new(HashIndex::load_all(store.as_mut())?);
        let signal_fd = crate::monitor::block_termination_signals()?;
        let monitor = ChangeMonitor::new(&config.dirname_list)?;

        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            metadata_queue: Arc::new(BoundedQueue::new(DEFAULT_SOFT_BOUND)),
            store_queue: Arc::new(BoundedQueue::new(DEFAULT_SOFT_BOUND)),
            hash_index,
            store: Arc::new(Mutex::new(store)),
            transport,
            monitor,
            signal_fd,
        })
    }

    /// Run the initial carve, then the Change Monitor's blocking main loop,
    /// until a termination signal arrives; then run the strict shutdown
    /// sequence and return.
    pub fn run(mut self) -> Result<(), PipelineError> {
        let (carve_tx, carve_rx) = mpsc::sync_channel::<CarveRequest>(64);

        let transport_done = Arc::new(AtomicBool::new(false));
        let db_done = Arc::new(AtomicBool::new(false));

        let transport_handle = spawn_transport_sender(
            Arc::clone(&self.metadata_queue),
            Arc::clone(&self.transport),
            Arc::clone(&transport_done),
        );
        let db_handle = spawn_db_writer(
            Arc::clone(&self.store_queue),
            Arc::clone(&self.hash_index),
            Arc::clone(&self.store),
            Arc::clone(&db_done),
        );
        let carver_handle = spawn_carver(
            self.config.clone(),
            Arc::clone(&self.cancel),
            Arc::clone(&self.metadata_queue),
            Arc::clone(&self.store_queue),
            Arc::clone(&self.hash_index),
            carve_rx,
        );

        carve_tx
            .send(CarveRequest::Initial)
            .map_err(|_| PipelineError::Disconnected)?;

        let forwarder = RecarveForwarder {
            carve_tx: carve_tx.clone(),
            cancel: Arc::clone(&self.cancel),
        };
        let monitor_result = run_monitor_with_restart(
            &mut self.monitor,
            &self.signal_fd,
            &self.cancel,
            &forwarder,
        );

        // Shutdown order, strict: Monitor already stopped (ChangeMonitor::run
        // disarms on every exit path); cancel the Carver; close its request
        // channel so its worker loop ends; append the Shutdown sentinel;
        // wait (with a soft deadline, escalating on a second signal) for
        // the transport-sender and DB-writer to drain and exit; flush and
        // release.
        self.cancel.store(true, Ordering::Relaxed);
        drop(carve_tx);
        let _ = carver_handle.join();

        self.metadata_queue.push_with_timeout(
            QueueItem::Shutdown,
            SHUTDOWN_SEND_TIMEOUT,
            "metadata-queue shutdown sentinel",
        );
        self.store_queue.push_with_timeout(
            StoreItem::Shutdown,
            SHUTDOWN_SEND_TIMEOUT,
            "store-queue shutdown sentinel",
        );

        let escalated = wait_for_shutdown(
            &[&transport_done, &db_done],
            SHUTDOWN_SOFT_DEADLINE,
            &self.signal_fd,
        );
        let _ = transport_handle.join();
        let _ = db_handle.join();

        {
            let mut store = self.store.lock();
            let _ = self.hash_index.flush(store.as_mut());
        }

        monitor_result?;
        if escalated {
            return Err(PipelineError::ShutdownTimedOut(SHUTDOWN_SOFT_DEADLINE));
        }
        Ok(())
    }
}

/// `KernelNotificationFailure` policy: one restart attempt, then fatal. A
/// clean exit (cancellation already requested) is never retried; only an
/// actual I/O failure from the backend triggers the single retry.
fn run_monitor_with_restart(
    monitor: &mut ChangeMonitor,
    signal_fd: &nix::sys::signalfd::SignalFd,
    cancel: &AtomicBool,
    sink: &dyn RecarveSink,
) -> Result<(), MonitorError> {
    match monitor.run(signal_fd, cancel, sink) {
        Ok(()) => Ok(()),
        Err(e) if cancel.load(Ordering::Relaxed) => Err(e),
        Err(e) => {
            warn!("change monitor failed, attempting one restart: {e}");
            monitor.run(signal_fd, cancel, sink)
        }
    }
}

fn spawn_carver(
    config: ConfigRecord,
    cancel: Arc<AtomicBool>,
    metadata_queue: Arc<BoundedQueue<QueueItem>>,
    store_queue: Arc<BoundedQueue<StoreItem>>,
    hash_index: Arc<HashIndex>,
    carve_rx: Receiver<CarveRequest>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let carver = Carver::new(&config, &cancel);
        let sink = PipelineMetaSink {
            metadata_queue: &metadata_queue,
            store_queue: &store_queue,
            hash_index: &hash_index,
            cancel: &cancel,
        };
        for request in carve_rx {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            match request {
                CarveRequest::Initial => carver.carve_all(&sink),
                CarveRequest::Recarve(path) => carver.recarve_entry(&path, &sink),
            }
        }
        if carver.skipped_entries() > 0 {
            info!("carver skipped {} entries this run", carver.skipped_entries());
        }
    })
}

fn spawn_transport_sender(
    metadata_queue: Arc<BoundedQueue<QueueItem>>,
    transport: Arc<dyn TransportSink>,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Some(item) = metadata_queue.pop() {
            match item {
                QueueItem::Emit(meta) => {
                    submit_with_retry(transport.as_ref(), &meta);
                }
                QueueItem::Shutdown => break,
            }
        }
        done.store(true, Ordering::Release);
    })
}

fn spawn_db_writer(
    store_queue: Arc<BoundedQueue<StoreItem>>,
    hash_index: Arc<HashIndex>,
    store: Arc<Mutex<Box<dyn HashStore + Send>>>,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        // Set only after a failed flush, so a sustained storage outage
        // actually waits out the exponential backoff (1s/2s/4s/.../30s)
        // before the next `record_hash_batch` attempt, rather than
        // retrying on every incoming batch.
        let mut retry_not_before: Option<Instant> = None;
        while let Some(item) = store_queue.pop() {
            match item {
                StoreItem::Batch(hashes) => {
                    if let Some(not_before) = retry_not_before {
                        let now = Instant::now();
                        if now < not_before {
                            thread::sleep(not_before - now);
                        }
                    }
                    let mut guard = store.lock();
                    match hash_index.flush(guard.as_mut()) {
                        Ok(()) => {
                            debug!("flushed {} new hashes", hashes.len());
                            retry_not_before = None;
                        }
                        Err(e) => {
                            let backoff = hash_index.current_backoff();
                            warn!("hash index flush failed, retrying after backoff {backoff:?}: {e}");
                            retry_not_before = Some(Instant::now() + backoff);
                        }
                    }
                }
                StoreItem::Shutdown => break,
            }
        }
        done.store(true, Ordering::Release);
    })
}

/// Poll `done` flags until they are all set, the deadline elapses, or a
/// second termination signal arrives on `signal_fd` — in which case this
/// returns `true` ("escalated") immediately instead of waiting further.
fn wait_for_shutdown(
    done: &[&Arc<AtomicBool>],
    deadline: Duration,
    signal_fd: &nix::sys::signalfd::SignalFd,
) -> bool {
    let start = std::time::Instant::now();
    let poll_interval = Duration::from_millis(100);
    loop {
        if done.iter().all(|flag| flag.load(Ordering::Acquire)) {
            return false;
        }
        if start.elapsed() >= deadline {
            warn!("shutdown exceeded the {deadline:?} soft deadline");
            return true;
        }
        match signal_fd.read_signal() {
            Ok(Some(_)) => {
                warn!("second termination signal received, escalating shutdown");
                return true;
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(_) => thread::sleep(poll_interval),
        }
    }
}
