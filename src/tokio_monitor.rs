//! Passive monitor for a Modbus RTU bus reached through a serial-to-TCP gateway.
//!
//! The [`Monitor`] never polls the bus. It listens to the traffic the bus
//! master produces, re-frames the byte stream, correlates requests with their
//! responses and keeps a [`SlaveData`] record per slave. The only thing it
//! ever sends is a Write Single Register frame for [`Monitor::write_setpoint`].
//!
//! Two background loops run per monitor:
//! - the monitor loop owns the connection, reads, re-frames and updates the
//!   slave records, reconnecting whenever the connection fails or goes silent,
//! - the availability check periodically marks silent slaves unavailable.
//!
//! Both loops are supervised: a panicking loop is restarted after
//! [`MonitorConfig::error_backoff`].
//!
//! ```no_run
//! use rtu_monitor_lib::{tokio_common::MonitorConfig, tokio_monitor::Monitor};
//!
//! # async fn run() -> rtu_monitor_lib::tokio_common::Result<()> {
//! let monitor = Monitor::connect_tcp("192.168.1.50:502", MonitorConfig::default());
//! let mut updates = monitor.subscribe();
//! while updates.changed().await.is_ok() {
//!     for (id, data) in updates.borrow_and_update().iter() {
//!         println!("{id}: {:?} °C", data.temperature);
//!     }
//! }
//! monitor.close().await;
//! # Ok(())
//! # }
//! ```

use crate::correlator::Correlator;
use crate::protocol::{self as proto, Frame};
use crate::reframer::Reframer;
use crate::store::SlaveData;
use crate::tokio_common::{Connector, Error, MonitorConfig, Result, TcpConnector};
use log::{debug, error, info, trace, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_modbus::{Slave, SlaveId};

/// Bytes requested from the transport per read.
const READ_CHUNK_SIZE: usize = 1024;

/// `tokio::time::interval` rejects a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Immutable copy of all slave records, published on every change notification.
pub type Snapshot = Arc<BTreeMap<SlaveId, SlaveData>>;

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Rate limit for change notifications.
///
/// Changes arriving within `interval` of the last notification are
/// remembered and delivered by the next [`NotifyThrottle::poll`] that is
/// allowed through.
#[derive(Debug)]
struct NotifyThrottle {
    interval: Duration,
    last: Option<Instant>,
    dirty: bool,
}

impl NotifyThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            dirty: false,
        }
    }

    fn mark(&mut self) {
        self.dirty = true;
    }

    /// Returns `true` if a notification must be sent now.
    fn poll(&mut self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        self.dirty = false;
        true
    }
}

#[derive(Debug)]
struct State {
    correlator: Correlator,
    throttle: NotifyThrottle,
}

impl State {
    fn new(notify_interval: Duration) -> Self {
        Self {
            correlator: Correlator::new(),
            throttle: NotifyThrottle::new(notify_interval),
        }
    }

    /// Feeds `frames` in order. Returns `true` if subscribers must be notified.
    fn apply(&mut self, frames: &[Frame], now: Instant) -> bool {
        for frame in frames {
            trace!("Received {frame:?}");
            if self.correlator.handle_frame(frame, now) {
                self.throttle.mark();
            }
        }
        self.throttle.poll(now)
    }

    fn sweep(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.correlator.sweep(now, timeout) {
            self.throttle.mark();
        }
        self.throttle.poll(now)
    }

    fn snapshot(&self) -> Snapshot {
        Arc::new(self.correlator.store().all())
    }
}

struct Shared {
    config: MonitorConfig,
    state: Mutex<State>,
    writer: Mutex<Option<BoxedWriter>>,
    updates: watch::Sender<Snapshot>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn new(config: MonitorConfig) -> Self {
        Self {
            state: Mutex::new(State::new(config.notify_interval)),
            writer: Mutex::new(None),
            updates: watch::channel(Snapshot::default()).0,
            connected: watch::channel(false).0,
            shutdown: watch::channel(false).0,
            config,
        }
    }

    fn publish(&self, state: &State) {
        self.updates.send_replace(state.snapshot());
    }

    async fn attach(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
        self.connected.send_replace(true);
    }

    /// Drops the write half. Waits for a write in progress to finish.
    async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                debug!("Error while closing the connection: {err}");
            }
        }
        self.connected.send_replace(false);
    }

    /// Appends `data` to the re-framing buffer and handles every frame it yields.
    ///
    /// Returns `true` if any frame was emitted or any byte discarded.
    async fn process(&self, reframer: &mut Reframer, data: &[u8]) -> bool {
        reframer.extend(data);
        let mut worked = false;
        loop {
            let batch = reframer.process();
            worked |= !batch.frames.is_empty() || batch.discarded > 0;
            if batch.discarded > 0 {
                trace!("Discarded {} unframed bytes", batch.discarded);
            }
            {
                let mut state = self.state.lock().await;
                if state.apply(&batch.frames, Instant::now()) {
                    self.publish(&state);
                }
            }
            if !batch.exhausted {
                break;
            }
            tokio::task::yield_now().await;
        }
        worked
    }
}

/// Handle to a running monitor.
///
/// Cloning is cheap; all clones share the same connection and slave records.
/// The background loops keep running until [`Monitor::close`] is called.
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Monitor {
    /// Starts monitoring the gateway reached through `connector`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<C: Connector>(connector: C, config: MonitorConfig) -> Self {
        let shared = Arc::new(Shared::new(config));
        let connector = Arc::new(connector);
        info!("Starting Modbus RTU monitor for {connector}");

        let monitor_loop = tokio::spawn(supervise(
            "monitor loop",
            shared.config.error_backoff,
            shared.shutdown.subscribe(),
            {
                let shared = shared.clone();
                move || read_loop(shared.clone(), connector.clone())
            },
        ));
        let availability_check = tokio::spawn(supervise(
            "availability check",
            shared.config.error_backoff,
            shared.shutdown.subscribe(),
            {
                let shared = shared.clone();
                move || sweep_loop(shared.clone())
            },
        ));

        Self {
            shared,
            tasks: Arc::new(Mutex::new(vec![monitor_loop, availability_check])),
        }
    }

    /// Starts monitoring the serial-to-TCP gateway at `address` (`host:port`).
    pub fn connect_tcp(address: impl Into<String>, config: MonitorConfig) -> Self {
        let connector = TcpConnector::new(address, config.connect_timeout);
        Self::spawn(connector, config)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    /// Receives a new [`Snapshot`] whenever slave records change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.updates.subscribe()
    }

    /// Tracks whether a connection to the gateway is currently established.
    pub fn connection(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Current state of all slaves, including changes not yet notified.
    pub async fn snapshot(&self) -> Snapshot {
        self.shared.state.lock().await.snapshot()
    }

    pub async fn slave(&self, slave: SlaveId) -> Option<SlaveData> {
        let state = self.shared.state.lock().await;
        state.correlator.store().get(slave).cloned()
    }

    /// Sends a Write Single Register frame for the setpoint register of `slave`.
    ///
    /// The value is validated before the connection is looked at. No
    /// acknowledgement is awaited; the echo from the slave is ignored by the
    /// monitor loop.
    pub async fn write_setpoint(&self, slave: Slave, celsius: f32) -> Result<()> {
        let value = proto::setpoint_encode(celsius)?;
        if *self.shared.shutdown.borrow() {
            return Err(Error::Closed);
        }

        let mut writer = self.shared.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            warn!(
                "Cannot write setpoint to slave {}: not connected",
                slave.0
            );
            return Err(Error::NotConnected);
        };

        let frame = proto::build_write_single_register(slave, proto::SETPOINT_REG_ADDR, value);
        info!(
            "Writing setpoint to slave {}: {celsius:.1}°C (register {}, value {value})",
            slave.0,
            proto::SETPOINT_REG_ADDR
        );
        debug!(
            "Sending RTU frame {} ({} bytes)",
            hex::encode_upper(&frame),
            frame.len()
        );

        if let Err(err) = send(sink, &frame).await {
            error!("Failed to write setpoint to slave {}: {err}", slave.0);
            return Err(err.into());
        }
        info!("Setpoint for slave {} sent", slave.0);
        Ok(())
    }

    /// Stops both loops and closes the connection.
    ///
    /// A setpoint write already in progress completes first. Further writes
    /// fail with [`Error::Closed`].
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!("Monitor task ended abnormally: {err}");
            }
        }
        self.shared.detach().await;
        info!("Modbus RTU monitor closed");
    }
}

async fn send(sink: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    sink.write_all(frame).await?;
    sink.flush().await
}

/// Resolves once shutdown is signalled or the monitor is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs the task produced by `task` until it returns normally or shutdown is
/// signalled. A panicking task is started again after `backoff`.
async fn supervise<F, Fut>(
    name: &'static str,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match tokio::spawn(task()).await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                error!("Unexpected error in {name}, restarting in {backoff:?}");
            }
            Err(err) => {
                debug!("{name} cancelled: {err}");
                break;
            }
        }
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

async fn read_loop<C: Connector>(shared: Arc<Shared>, connector: Arc<C>) {
    let config = &shared.config;
    let mut shutdown = shared.shutdown.subscribe();
    let mut reframer = Reframer::new();
    let mut reader: Option<C::Reader> = None;
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if reader.is_none() {
            // Bytes from a previous connection can never complete a frame.
            reframer.clear();
            info!("Connecting to {connector}");
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                result = connector.connect() => match result {
                    Ok((source, sink)) => {
                        info!("Connected to Modbus gateway at {connector}");
                        reader = Some(source);
                        shared.attach(Box::new(sink)).await;
                    }
                    Err(err) => {
                        warn!(
                            "Connection to {connector} failed: {err} (retrying in {:?})",
                            config.reconnect_delay
                        );
                        tokio::select! {
                            _ = stopped(&mut shutdown) => break,
                            _ = tokio::time::sleep(config.reconnect_delay) => {}
                        }
                    }
                },
            }
            continue;
        }
        let Some(source) = reader.as_mut() else {
            continue;
        };

        let read = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            read = tokio::time::timeout(config.read_timeout, source.read(&mut chunk)) => read,
        };
        match read {
            Ok(Ok(0)) => warn!("Connection to {connector} closed by peer, reconnecting"),
            Ok(Ok(len)) => {
                let worked = shared.process(&mut reframer, &chunk[..len]).await;
                if worked && !config.batch_delay.is_zero() {
                    tokio::time::sleep(config.batch_delay).await;
                }
                continue;
            }
            Ok(Err(err)) => warn!("Connection error on {connector}: {err}, reconnecting"),
            Err(_) => warn!(
                "No data from {connector} for {:?}, presuming the connection dead",
                config.read_timeout
            ),
        }
        reader = None;
        shared.detach().await;
    }

    drop(reader);
    shared.detach().await;
    debug!("Monitor loop for {connector} stopped");
}

async fn sweep_loop(shared: Arc<Shared>) {
    let config = &shared.config;
    let mut shutdown = shared.shutdown.subscribe();
    let mut interval = tokio::time::interval(config.sweep_interval.max(MIN_SWEEP_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = interval.tick() => {}
        }
        let mut state = shared.state.lock().await;
        if state.sweep(Instant::now(), config.availability_timeout) {
            shared.publish(&state);
        }
    }
    debug!("Availability check stopped");
}
