//! Continuous readout engine.
//!
//! The engine runs up to three threads:
//!
//! 1. The acquisition thread drains the hardware FIFO every interval and
//!    queues each non-empty drain, in arrival order, on an unbounded channel.
//! 2. The consumer thread (only with a data callback) takes chunks off the
//!    queue and hands them to the callback. It exits on a sentinel.
//! 3. The watchdog thread (only with an error callback) polls the hardware
//!    discard/error counters every few intervals.
//!
//! ```text
//!   HardwareFifo ──> acquisition ──[flume]──> consumer ──> on_data
//!                        │                        │
//!   ErrorCounters ──> watchdog ──────────────────┴──────> on_error
//! ```
//!
//! The FIFO is moved into the acquisition thread and handed back when the
//! thread is joined, so no other context can touch it while acquiring.

use crate::config::ConfigError;
use crate::decoder::{DecodeError, DecoderConfig, RawWordDecoder};
use crate::hardware::{ErrorCounters, HardwareFifo, NUM_COUNTERS};
use crate::types::{ErrorKind, RawWord, Record};
use flume::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors reported by the readout engine, either returned or passed to the
/// error callback.
#[derive(Error, Debug)]
pub enum ReadoutError {
    #[error("Readout is already running")]
    AlreadyRunning,

    #[error("Readout is not running")]
    NotRunning,

    #[error("Hardware FIFO is unavailable after an earlier acquisition failure")]
    FifoUnavailable,

    #[error("Invalid readout options: {0}")]
    InvalidOptions(String),

    #[error("No data received for {timeout:?}")]
    NoDataTimeout { timeout: Duration },

    #[error("Readout did not stop within {timeout:?}; forced termination")]
    StopTimeout { timeout: Duration },

    #[error("Hardware reported discard/error counts {counters:?}")]
    HardwareErrors { counters: [u32; NUM_COUNTERS] },

    #[error("Data callback failed: {0}")]
    Callback(String),

    #[error("Data callback panicked: {0}")]
    CallbackPanic(String),

    #[error("Online decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Readout thread '{0}' panicked")]
    ThreadPanic(String),

    #[error("Failed to spawn readout thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ReadoutError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ReadoutError::NoDataTimeout { .. } => Some(ErrorKind::NoDataTimeout),
            ReadoutError::StopTimeout { .. } => Some(ErrorKind::StopTimeout),
            ReadoutError::Decode(e) => e.kind(),
            _ => None,
        }
    }
}

/// Error type a data callback may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a data callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Receives every queued chunk on the consumer thread.
pub type DataCallback = Box<dyn FnMut(ReadoutChunk) -> CallbackResult + Send>;

/// Receives errors from any engine thread.
pub type ErrorCallback = Arc<dyn Fn(ReadoutError) + Send + Sync>;

/// The FIFO still held words after the drain.
pub const STATUS_BACKLOG: u32 = 0x1;

/// Online decoding of this chunk hit a fatal error.
pub const STATUS_DECODE_ERROR: u32 = 0x2;

/// Readout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutOptions {
    /// Period of the acquisition loop
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Report an error and end acquisition after this long without data
    #[serde(with = "humantime_serde")]
    pub no_data_timeout: Option<Duration>,
    /// Watchdog period as a multiple of `interval`
    pub watchdog_every: u32,
    /// Number of intervals averaged for the throughput estimate
    pub rate_window: usize,
    /// Clear the FIFO before acquisition starts
    pub reset_fifo_on_start: bool,
    /// Decode chunks on the acquisition thread and attach the records
    pub online_decoding: Option<DecoderConfig>,
}

impl Default for ReadoutOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            no_data_timeout: None,
            watchdog_every: 10,
            rate_window: 20,
            reset_fifo_on_start: false,
            online_decoding: None,
        }
    }
}

impl ReadoutOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "readout interval must be non-zero".to_string(),
            ));
        }
        if self.watchdog_every == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_every must be at least 1".to_string(),
            ));
        }
        if self.rate_window == 0 {
            return Err(ConfigError::Invalid(
                "rate_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One non-empty drain of the hardware FIFO.
#[derive(Debug, Clone)]
pub struct ReadoutChunk {
    pub data: Vec<RawWord>,
    /// End of the previous non-empty drain, or the start of acquisition
    pub interval_start: SystemTime,
    pub interval_stop: SystemTime,
    /// Bit set of `STATUS_*` flags
    pub status: u32,
    /// Records decoded on the acquisition thread, if online decoding is on
    pub records: Option<Vec<Record>>,
}

/// How a stop request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The acquisition loop exited within the timeout.
    Graceful,
    /// The timeout expired and the forced flag was raised.
    Forced,
}

/// Shared readout statistics, readable from any thread.
#[derive(Debug, Clone)]
pub struct ReadoutStats {
    records: Arc<AtomicU64>,
    /// Words per second as `f64` bits, NaN when unknown
    rate: Arc<AtomicU64>,
}

impl Default for ReadoutStats {
    fn default() -> Self {
        Self {
            records: Arc::new(AtomicU64::new(0)),
            rate: Arc::new(AtomicU64::new(f64::NAN.to_bits())),
        }
    }
}

impl ReadoutStats {
    /// Number of chunks read since the last start.
    pub fn record_count(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    /// Recent throughput in words per second.
    pub fn throughput(&self) -> Option<f64> {
        let rate = f64::from_bits(self.rate.load(Ordering::Acquire));
        (!rate.is_nan()).then_some(rate)
    }

    fn publish_rate(&self, rate: Option<f64>) {
        let bits = rate.unwrap_or(f64::NAN).to_bits();
        self.rate.store(bits, Ordering::Release);
    }

    fn reset(&self) {
        self.records.store(0, Ordering::Release);
        self.publish_rate(None);
    }
}

/// Fixed-length ring of per-interval word counts.
///
/// Owned by the acquisition thread; only the computed rate leaves it.
#[derive(Debug)]
struct RateRing {
    samples: VecDeque<(usize, Duration)>,
    capacity: usize,
}

impl RateRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, words: usize, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((words, elapsed));
    }

    fn rate(&self) -> Option<f64> {
        let seconds: f64 = self.samples.iter().map(|(_, d)| d.as_secs_f64()).sum();
        if seconds <= 0.0 {
            return None;
        }
        let words: usize = self.samples.iter().map(|(w, _)| w).sum();
        Some(words as f64 / seconds)
    }
}

enum Message {
    Data(ReadoutChunk),
    Stop,
}

/// Forwards an error to the callback, or logs it when there is none.
fn report(on_error: &Option<ErrorCallback>, err: ReadoutError) {
    match on_error {
        Some(callback) => callback(err),
        None => error!(error = %err, "Readout error"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawns `f(value)` on a new thread.
///
/// `value` travels through a channel rather than the closure, so it comes back
/// to the caller when the thread cannot be spawned.
fn spawn_handoff<T, R, G>(
    builder: thread::Builder,
    value: T,
    f: G,
) -> Result<JoinHandle<Option<R>>, (std::io::Error, Option<T>)>
where
    T: Send + 'static,
    R: Send + 'static,
    G: FnOnce(T) -> R + Send + 'static,
{
    let (tx, rx) = flume::bounded(1);
    let _ = tx.send(value);
    let thread_rx = rx.clone();
    match builder.spawn(move || thread_rx.recv().ok().map(f)) {
        Ok(handle) => Ok(handle),
        Err(e) => Err((e, rx.try_recv().ok())),
    }
}

struct Session<F> {
    stop_requested: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    acquiring: Arc<AtomicBool>,
    /// Dropping the sender wakes every sleeping engine thread
    wake: flume::Sender<()>,
    done: flume::Receiver<()>,
    queue: Option<flume::Sender<Message>>,
    /// Yields the FIFO back; `None` only if the thread never received it
    acquisition: JoinHandle<Option<F>>,
    consumer: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    on_error: Option<ErrorCallback>,
}

struct Acquisition<F> {
    fifo: F,
    options: ReadoutOptions,
    stats: ReadoutStats,
    stop_requested: Arc<AtomicBool>,
    force_stop: Arc<AtomicBool>,
    acquiring: Arc<AtomicBool>,
    wake: flume::Receiver<()>,
    done: flume::Sender<()>,
    queue: Option<flume::Sender<Message>>,
    on_error: Option<ErrorCallback>,
}

impl<F: HardwareFifo> Acquisition<F> {
    fn run(mut self) -> F {
        let mut ring = RateRing::new(self.options.rate_window);
        let mut decoder = self.options.online_decoding.map(RawWordDecoder::with_config);
        let mut last_tick = Instant::now();
        let mut last_data = Instant::now();
        let mut interval_start = SystemTime::now();

        loop {
            if self.force_stop.load(Ordering::Acquire) {
                warn!("Acquisition forced to stop");
                break;
            }
            let stopping = self.stop_requested.load(Ordering::Acquire);
            let tick = Instant::now();

            let data = self.fifo.read_chunk();
            ring.push(data.len(), tick.duration_since(last_tick));
            last_tick = tick;
            self.stats.publish_rate(ring.rate());

            if !data.is_empty() {
                last_data = tick;
                let interval_stop = SystemTime::now();
                let mut status = 0;
                if self.fifo.occupancy() > 0 {
                    status |= STATUS_BACKLOG;
                }

                let records = decoder.as_mut().map(|decoder| {
                    let mut records = Vec::new();
                    if let Err(e) = decoder.decode_into(&data, &mut records) {
                        status |= STATUS_DECODE_ERROR;
                        decoder.reset();
                        report(&self.on_error, ReadoutError::Decode(e));
                    }
                    records
                });

                self.stats.records.fetch_add(1, Ordering::AcqRel);
                if let Some(queue) = &self.queue {
                    let chunk = ReadoutChunk {
                        data,
                        interval_start,
                        interval_stop,
                        status,
                        records,
                    };
                    if queue.send(Message::Data(chunk)).is_err() {
                        warn!("Consumer queue closed; dropping chunk");
                    }
                }
                interval_start = interval_stop;
            } else if let Some(timeout) = self.options.no_data_timeout {
                if !stopping && last_data.elapsed() > timeout {
                    warn!(?timeout, "No data received");
                    report(&self.on_error, ReadoutError::NoDataTimeout { timeout });
                    break;
                }
            }

            if stopping {
                // Final drain until the FIFO is empty
                if self.fifo.occupancy() == 0 {
                    break;
                }
                continue;
            }

            let remaining = self.options.interval.saturating_sub(tick.elapsed());
            match self.wake.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Woken for shutdown; the flags decide what happens next
                    if !self.stop_requested.load(Ordering::Acquire)
                        && !self.force_stop.load(Ordering::Acquire)
                    {
                        thread::sleep(remaining);
                    }
                }
            }
        }

        self.acquiring.store(false, Ordering::Release);
        let _ = self.done.send(());
        debug!("Acquisition thread exiting");
        self.fifo
    }
}

fn consumer_loop(
    queue: flume::Receiver<Message>,
    mut on_data: DataCallback,
    on_error: Option<ErrorCallback>,
) {
    while let Ok(Message::Data(chunk)) = queue.recv() {
        match catch_unwind(AssertUnwindSafe(|| on_data(chunk))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Data callback failed");
                report(&on_error, ReadoutError::Callback(e.to_string()));
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(panic = %msg, "Data callback panicked");
                report(&on_error, ReadoutError::CallbackPanic(msg));
            }
        }
    }
    debug!("Consumer thread exiting");
}

fn watchdog_loop(
    counters: Arc<dyn ErrorCounters>,
    period: Duration,
    stop_requested: Arc<AtomicBool>,
    wake: flume::Receiver<()>,
    on_error: ErrorCallback,
) {
    loop {
        match wake.recv_timeout(period) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if stop_requested.load(Ordering::Acquire) {
            break;
        }
        let values = counters.counters();
        if values.iter().any(|&count| count != 0) {
            warn!(counters = ?values, "Hardware discard/error counters non-zero");
            on_error(ReadoutError::HardwareErrors { counters: values });
        }
    }
    debug!("Watchdog thread exiting");
}

/// Continuous readout of one hardware FIFO.
pub struct ReadoutEngine<F: HardwareFifo + 'static> {
    fifo: Option<F>,
    counters: Option<Arc<dyn ErrorCounters>>,
    stats: ReadoutStats,
    session: Option<Session<F>>,
}

impl<F: HardwareFifo + 'static> ReadoutEngine<F> {
    /// Creates an idle engine owning `fifo`.
    ///
    /// Without `counters` the watchdog never runs.
    pub fn new(fifo: F, counters: Option<Arc<dyn ErrorCounters>>) -> Self {
        Self {
            fifo: Some(fifo),
            counters,
            stats: ReadoutStats::default(),
            session: None,
        }
    }

    /// Starts acquisition.
    ///
    /// The consumer thread is only started with `on_data`, the watchdog only
    /// with `on_error` and attached counters.
    pub fn start(
        &mut self,
        on_data: Option<DataCallback>,
        on_error: Option<ErrorCallback>,
        options: ReadoutOptions,
    ) -> Result<(), ReadoutError> {
        if self.session.is_some() {
            return Err(ReadoutError::AlreadyRunning);
        }
        options
            .validate()
            .map_err(|e| ReadoutError::InvalidOptions(e.to_string()))?;
        if let Some(decoder) = &options.online_decoding {
            decoder
                .validate()
                .map_err(|e| ReadoutError::InvalidOptions(e.to_string()))?;
        }
        let mut fifo = self.fifo.take().ok_or(ReadoutError::FifoUnavailable)?;
        if options.reset_fifo_on_start {
            fifo.reset();
        }
        self.stats.reset();

        let stop_requested = Arc::new(AtomicBool::new(false));
        let force_stop = Arc::new(AtomicBool::new(false));
        let acquiring = Arc::new(AtomicBool::new(true));
        let (wake_tx, wake_rx) = flume::bounded::<()>(1);
        let (done_tx, done_rx) = flume::bounded::<()>(1);

        let (queue_tx, consumer) = match on_data {
            Some(on_data) => {
                let (tx, rx) = flume::unbounded();
                let errors = on_error.clone();
                let handle = thread::Builder::new()
                    .name("readout-consumer".to_string())
                    .spawn(move || consumer_loop(rx, on_data, errors));
                match handle {
                    Ok(handle) => (Some(tx), Some(handle)),
                    Err(e) => {
                        self.fifo = Some(fifo);
                        return Err(e.into());
                    }
                }
            }
            None => (None, None),
        };

        let watchdog = match (&on_error, &self.counters) {
            (Some(errors), Some(counters)) => {
                let period = options.interval * options.watchdog_every;
                let counters = Arc::clone(counters);
                let errors = Arc::clone(errors);
                let stop = Arc::clone(&stop_requested);
                let wake = wake_rx.clone();
                let spawned = thread::Builder::new()
                    .name("readout-watchdog".to_string())
                    .spawn(move || watchdog_loop(counters, period, stop, wake, errors));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        Self::teardown(queue_tx, consumer, None);
                        self.fifo = Some(fifo);
                        return Err(e.into());
                    }
                }
            }
            _ => None,
        };

        let acquisition = Acquisition {
            fifo,
            options: options.clone(),
            stats: self.stats.clone(),
            stop_requested: Arc::clone(&stop_requested),
            force_stop: Arc::clone(&force_stop),
            acquiring: Arc::clone(&acquiring),
            wake: wake_rx,
            done: done_tx,
            queue: queue_tx.clone(),
            on_error: on_error.clone(),
        };
        let acquisition = match spawn_handoff(
            thread::Builder::new().name("readout-acquisition".to_string()),
            acquisition,
            Acquisition::run,
        ) {
            Ok(handle) => handle,
            Err((e, returned)) => {
                stop_requested.store(true, Ordering::Release);
                drop(wake_tx);
                Self::teardown(queue_tx, consumer, watchdog);
                if let Some(acquisition) = returned {
                    self.fifo = Some(acquisition.fifo);
                }
                return Err(e.into());
            }
        };

        info!(
            interval = ?options.interval,
            consumer = consumer.is_some(),
            watchdog = watchdog.is_some(),
            "Readout started"
        );

        self.session = Some(Session {
            stop_requested,
            force_stop,
            acquiring,
            wake: wake_tx,
            done: done_rx,
            queue: queue_tx,
            acquisition,
            consumer,
            watchdog,
            on_error,
        });
        Ok(())
    }

    /// Stops acquisition and joins every engine thread.
    ///
    /// Waits up to `timeout` for the acquisition loop to finish its final
    /// drain. On expiry the loop is forced to exit, `StopTimeout` goes to the
    /// error callback, and the threads are still joined before returning.
    pub fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, ReadoutError> {
        let session = self.session.take().ok_or(ReadoutError::NotRunning)?;
        session.stop_requested.store(true, Ordering::Release);
        drop(session.wake);

        let outcome = match session.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => StopOutcome::Graceful,
            Err(RecvTimeoutError::Timeout) => {
                session.force_stop.store(true, Ordering::Release);
                warn!(?timeout, "Readout did not stop in time; forcing");
                report(&session.on_error, ReadoutError::StopTimeout { timeout });
                StopOutcome::Forced
            }
        };

        let mut result = Ok(outcome);
        match session.acquisition.join() {
            Ok(fifo) => self.fifo = fifo,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(panic = %msg, "Acquisition thread panicked");
                result = Err(ReadoutError::ThreadPanic("readout-acquisition".to_string()));
            }
        }
        Self::teardown(session.queue, session.consumer, session.watchdog);
        self.stats.publish_rate(None);

        info!(records = self.stats.record_count(), ?outcome, "Readout stopped");
        result
    }

    /// Sends the consumer sentinel and joins the helper threads.
    fn teardown(
        queue: Option<flume::Sender<Message>>,
        consumer: Option<JoinHandle<()>>,
        watchdog: Option<JoinHandle<()>>,
    ) {
        if let Some(queue) = queue {
            let _ = queue.send(Message::Stop);
        }
        if let Some(handle) = consumer {
            if handle.join().is_err() {
                error!("Consumer thread panicked");
            }
        }
        if let Some(handle) = watchdog {
            if handle.join().is_err() {
                error!("Watchdog thread panicked");
            }
        }
    }

    /// Whether a session is active, i.e. `start` succeeded without a `stop`.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the acquisition loop is still draining the FIFO.
    ///
    /// Turns false when the loop ends on its own, e.g. after a no-data
    /// timeout; `stop` is still required to end the session.
    pub fn is_acquiring(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.acquiring.load(Ordering::Acquire))
    }

    /// Number of chunks read since the last start.
    pub fn record_count(&self) -> u64 {
        self.stats.record_count()
    }

    /// Recent throughput in words per second, while running.
    pub fn throughput(&self) -> Option<f64> {
        self.stats.throughput()
    }

    /// Handle to the statistics for use from other threads.
    pub fn stats(&self) -> ReadoutStats {
        self.stats.clone()
    }

    /// The FIFO, when no session holds it.
    pub fn fifo(&self) -> Option<&F> {
        self.fifo.as_ref()
    }

    /// Releases the FIFO; fails while a session is active.
    pub fn into_fifo(mut self) -> Option<F> {
        if self.session.is_some() {
            return None;
        }
        self.fifo.take()
    }
}

impl<F: HardwareFifo + 'static> Drop for ReadoutEngine<F> {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.stop(Duration::from_secs(1)) {
                error!(error = %e, "Failed to stop readout on drop");
            }
        }
    }
}
