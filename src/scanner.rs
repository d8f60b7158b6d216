use crate::probe::{NetworkProber, ProbeSettings, Prober};
use crate::raw;
use crate::types::{ProtocolMode, ScanMethod, ScanReport, ScanResult, ScanTask};
use anyhow::{anyhow, Result};
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::Rng;
use std::any::Any;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard cap on concurrent probes regardless of configuration.
pub const MAX_WORKERS: usize = 5_000;
/// Largest number of tasks submitted ahead of a cancellation check.
pub const MAX_BATCH: usize = 4_096;
/// Pause between submitting batches.
pub const INTER_BATCH_PAUSE: Duration = Duration::from_millis(5);
/// The pre-probe delay is slept in this many pieces, checking for
/// cancellation between them.
pub const DELAY_CHUNKS: u32 = 5;

const MIN_SYSTEM_CEILING: usize = 64;
const WORKERS_PER_CPU: usize = 256;

/// Per-session options.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub protocol_mode: ProtocolMode,
    pub timeout: Duration,
    pub max_threads: usize,
    /// Shuffle the port order once before building tasks. Hosts keep their order.
    pub randomize_order: bool,
    /// Upper bound of a random delay slept before each probe.
    pub jitter: Option<Duration>,
    pub fragmented: bool,
    pub banner_grabbing: bool,
    pub show_open_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            protocol_mode: ProtocolMode::Tcp,
            timeout: Duration::from_millis(300),
            max_threads: 100,
            randomize_order: false,
            jitter: None,
            fragmented: false,
            banner_grabbing: false,
            show_open_only: false,
        }
    }
}

/// Receives session events. Called from worker tasks, so implementations
/// must hand off to their own thread if they need one.
pub trait ScanObserver: Send + Sync {
    /// Called after every completed task.
    fn on_progress(&self, _completed: u64, _total: u64) {}
    /// Called exactly once per session with the final aggregation.
    fn on_complete(&self, _report: &ScanReport) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ScanObserver for NoopObserver {}

/// Observer built from two closures.
pub struct CallbackObserver<P, C> {
    on_progress: P,
    on_complete: C,
}

impl<P, C> CallbackObserver<P, C>
where
    P: Fn(u64, u64) + Send + Sync,
    C: Fn(&ScanReport) + Send + Sync,
{
    pub fn new(on_progress: P, on_complete: C) -> Self {
        Self {
            on_progress,
            on_complete,
        }
    }
}

impl<P, C> ScanObserver for CallbackObserver<P, C>
where
    P: Fn(u64, u64) + Send + Sync,
    C: Fn(&ScanReport) + Send + Sync,
{
    fn on_progress(&self, completed: u64, total: u64) {
        (self.on_progress)(completed, total)
    }

    fn on_complete(&self, report: &ScanReport) {
        (self.on_complete)(report)
    }
}

/// Handle to a running session.
pub struct ScanHandle {
    session: Arc<Session>,
    join: JoinHandle<ScanReport>,
}

impl ScanHandle {
    /// Request cooperative cancellation. In-flight probes finish or time out
    /// on their own; queued ones never start.
    pub fn cancel(&self) {
        self.session.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.session.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancel.clone()
    }

    /// `(completed, total_scans)` at this instant.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.session.completed.load(Ordering::Acquire),
            self.session.total_scans,
        )
    }

    pub fn total_scans(&self) -> u64 {
        self.session.total_scans
    }

    /// Wait for the session to reach its terminal state.
    pub async fn wait(self) -> Result<ScanReport> {
        self.join
            .await
            .map_err(|e| anyhow!("scan orchestrator failed: {e}"))
    }
}

/// Cancel a running session.
pub fn cancel(handle: &ScanHandle) {
    handle.cancel();
}

/// Start a scan with the real network prober.
///
/// When fragmented probing is requested, raw-socket capability is checked
/// once here; if it is missing the whole session uses standard probes.
/// Must be called from within a tokio runtime.
pub fn run_scan(
    hosts: Vec<IpAddr>,
    ports: Vec<u16>,
    mut options: ScanOptions,
    observer: Arc<dyn ScanObserver>,
) -> ScanHandle {
    if options.fragmented {
        if let Err(e) = raw::check_raw_capability() {
            warn!(error = %e, "falling back to standard probing for this session");
            options.fragmented = false;
        }
    }
    let prober = Arc::new(NetworkProber::new(ProbeSettings {
        timeout: options.timeout,
        banner_grabbing: options.banner_grabbing,
    }));
    run_scan_with_prober(hosts, ports, options, prober, observer)
}

/// Start a scan that executes every task through `prober`.
pub fn run_scan_with_prober(
    hosts: Vec<IpAddr>,
    mut ports: Vec<u16>,
    options: ScanOptions,
    prober: Arc<dyn Prober>,
    observer: Arc<dyn ScanObserver>,
) -> ScanHandle {
    if options.randomize_order {
        ports.shuffle(&mut rand::thread_rng());
    }
    let method = if options.fragmented {
        ScanMethod::Fragmented
    } else {
        ScanMethod::Standard
    };
    let tasks = build_tasks(&hosts, &ports, options.protocol_mode, method);
    let total_scans = total_scans(hosts.len(), ports.len(), options.protocol_mode);
    debug_assert_eq!(tasks.len() as u64, total_scans);

    let session = Arc::new(Session {
        total_scans,
        completed: AtomicU64::new(0),
        open_count: AtomicU64::new(0),
        results: Mutex::new(Vec::new()),
        cancel: CancellationToken::new(),
        finalized: AtomicBool::new(false),
        report: OnceLock::new(),
        observer,
        started: Instant::now(),
        show_open_only: options.show_open_only,
    });

    let join = tokio::spawn(orchestrate(tasks, options, prober, session.clone()));
    ScanHandle { session, join }
}

/// Run a scan to completion.
pub async fn scan(hosts: Vec<IpAddr>, ports: Vec<u16>, options: ScanOptions) -> Result<ScanReport> {
    run_scan(hosts, ports, options, Arc::new(NoopObserver)).wait().await
}

/// Number of probes a session performs: hosts x ports x protocols.
pub fn total_scans(hosts: usize, ports: usize, mode: ProtocolMode) -> u64 {
    hosts as u64 * ports as u64 * mode.protocols().len() as u64
}

/// Cross product of hosts and ports; `Both` yields a TCP and a UDP task per pair.
pub fn build_tasks(
    hosts: &[IpAddr],
    ports: &[u16],
    mode: ProtocolMode,
    method: ScanMethod,
) -> Vec<ScanTask> {
    let mut tasks = Vec::with_capacity(total_scans(hosts.len(), ports.len(), mode) as usize);
    for &host in hosts {
        for &port in ports {
            for &protocol in mode.protocols() {
                tasks.push(ScanTask {
                    host,
                    port,
                    protocol,
                    method,
                });
            }
        }
    }
    tasks
}

/// Worker count: configured maximum clamped to the task count and the system ceiling.
pub fn worker_count(configured: usize, task_count: u64) -> usize {
    let task_count = usize::try_from(task_count).unwrap_or(usize::MAX);
    configured
        .min(task_count)
        .min(system_worker_ceiling())
        .clamp(1, MAX_WORKERS)
}

/// Tasks submitted per batch. Grows faster than `workers` so large pools stay
/// fed, while small pools check for cancellation often.
pub fn batch_size(workers: usize) -> usize {
    let factor = match workers {
        0..=8 => 2,
        9..=64 => 3,
        _ => 4,
    };
    workers.max(1).saturating_mul(factor).min(MAX_BATCH)
}

/// Generous ceiling for I/O-bound workers, from the open-file limit and CPU count.
pub fn system_worker_ceiling() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let by_cpu = cpus.saturating_mul(WORKERS_PER_CPU);
    let ceiling = match open_file_limit() {
        Some(nofile) => (nofile / 2).min(by_cpu),
        None => by_cpu,
    };
    ceiling.max(MIN_SYSTEM_CEILING)
}

#[cfg(unix)]
fn open_file_limit() -> Option<usize> {
    let (soft, _hard) = rlimit::Resource::NOFILE.get().ok()?;
    if soft == rlimit::INFINITY {
        return None;
    }
    usize::try_from(soft).ok()
}

#[cfg(not(unix))]
fn open_file_limit() -> Option<usize> {
    None
}

struct Session {
    total_scans: u64,
    completed: AtomicU64,
    open_count: AtomicU64,
    results: Mutex<Vec<ScanResult>>,
    cancel: CancellationToken,
    finalized: AtomicBool,
    report: OnceLock<ScanReport>,
    observer: Arc<dyn ScanObserver>,
    started: Instant,
    show_open_only: bool,
}

impl Session {
    async fn record(&self, result: ScanResult) {
        if result.is_open() {
            self.open_count.fetch_add(1, Ordering::Relaxed);
        }
        self.results.lock().await.push(result);
        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        self.observer.on_progress(done, self.total_scans);
        if done == self.total_scans {
            self.finalize().await;
        }
    }

    // One-shot: whichever of "last task done" or "orchestrator drained"
    // arrives first builds the report.
    async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        let results = self.results.lock().await.clone();
        let report = ScanReport {
            total_scans: self.total_scans,
            completed: self.completed.load(Ordering::Acquire),
            open_count: self.open_count.load(Ordering::Relaxed),
            cancelled: self.cancel.is_cancelled(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            show_open_only: self.show_open_only,
            results,
        };
        info!(
            completed = report.completed,
            total = report.total_scans,
            open = report.open_count,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "scan finished"
        );
        // Publish before notifying so a failing observer cannot lose the results.
        let report = self.report.get_or_init(|| report);
        let notify =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.observer.on_complete(report)));
        if let Err(panic) = notify {
            warn!(reason = %panic_message(panic.as_ref()), "completion observer panicked");
        }
    }
}

async fn orchestrate(
    tasks: Vec<ScanTask>,
    options: ScanOptions,
    prober: Arc<dyn Prober>,
    session: Arc<Session>,
) -> ScanReport {
    let workers = worker_count(options.max_threads, session.total_scans);
    let batch = batch_size(workers);
    info!(
        total = session.total_scans,
        workers,
        batch,
        protocol = ?options.protocol_mode,
        fragmented = options.fragmented,
        "scan started"
    );

    let sem = Arc::new(Semaphore::new(workers));
    let cancel = session.cancel.clone();

    for chunk in tasks.chunks(batch) {
        if cancel.is_cancelled() {
            break;
        }
        let mut set = JoinSet::new();
        for &task in chunk {
            set.spawn(run_task(
                task,
                options.jitter,
                sem.clone(),
                prober.clone(),
                session.clone(),
            ));
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "scan task aborted");
            }
            if cancel.is_cancelled() {
                // Tasks still waiting for a permit observe the token and exit.
                debug!(pending = set.len(), "cancellation observed, draining batch");
            }
        }

        if cancel.is_cancelled() {
            info!("scan cancelled, no further batches submitted");
            break;
        }
        time::sleep(INTER_BATCH_PAUSE).await;
    }

    session.finalize().await;
    session.report.get().cloned().unwrap_or_default()
}

/// Run one task. Returns false when cancellation stopped it before any
/// network work; such tasks are not counted.
async fn run_task(
    task: ScanTask,
    jitter: Option<Duration>,
    sem: Arc<Semaphore>,
    prober: Arc<dyn Prober>,
    session: Arc<Session>,
) -> bool {
    let cancel = &session.cancel;
    if cancel.is_cancelled() {
        return false;
    }

    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        permit = sem.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return false,
        },
    };
    if cancel.is_cancelled() {
        return false;
    }

    if let Some(max) = jitter {
        if !sleep_cancellable(random_delay(max), cancel).await {
            return false;
        }
    }
    if cancel.is_cancelled() {
        return false;
    }

    let result = match AssertUnwindSafe(prober.probe(&task)).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            debug!(
                target = %task.host,
                port = task.port,
                protocol = %task.protocol,
                error = %e,
                "probe failed"
            );
            ScanResult::error(&task, format!("{e:#}"))
        }
        Err(panic) => {
            warn!(target = %task.host, port = task.port, "probe panicked");
            let reason = panic_message(panic.as_ref());
            ScanResult::error(&task, format!("probe panicked: {reason}"))
        }
    };
    session.record(result).await;
    true
}

fn random_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Sleep `total` in `DELAY_CHUNKS` pieces, waking early on cancellation.
/// Returns false if cancelled.
async fn sleep_cancellable(total: Duration, cancel: &CancellationToken) -> bool {
    let chunk = total / DELAY_CHUNKS;
    for _ in 0..DELAY_CHUNKS {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = time::sleep(chunk) => {}
        }
    }
    !cancel.is_cancelled()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
