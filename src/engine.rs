//! Polling and command dispatch
//!
//! [`PollingEngine`] owns the PLC and drives one `select!` loop over three
//! event sources: the sampling tick, operator commands forwarded by the
//! background listener, and shutdown. Every sample either uploads a fresh
//! parameter string or, when nothing moved past the dead-band, pings the
//! telemetry server to keep the session alive.
//!
//! Consecutive failures are counted per side in a [`FailureBudget`]; running
//! a budget down hands control to the injected [`ExhaustionPolicy`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::address_map::{AddressMap, Point, PointKind};
use crate::constants::{
    ANALOG_DEADBAND, COMMAND_QUEUE_DEPTH, COMMAND_SETTLE_PAUSE, DEFAULT_MAX_UPLOAD_INTERVAL,
    DEFAULT_POLL_PERIOD, INTER_READ_PAUSE, INTER_WRITE_PAUSE, LISTENER_ERROR_BACKOFF,
    PLC_FAILURE_CEILING, TELEMETRY_FAILURE_CEILING, WIALON_PARAM_TYPE_INT,
};
use crate::error::GatewayResult;
use crate::gateway::{GensetAction, PlcIo};
use crate::telemetry::{Command, TelemetryIo};

/// Prefix operators may put in front of write-map names.
const WRITE_NAME_PREFIX: &str = "W_";

/// Which side of the gateway a budget guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSide {
    Plc,
    Telemetry,
}

impl fmt::Display for BudgetSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plc => write!(f, "PLC"),
            Self::Telemetry => write!(f, "telemetry"),
        }
    }
}

/// What happens when a failure budget runs out.
pub trait ExhaustionPolicy: Send + Sync {
    fn on_exhausted(&self, side: BudgetSide);
}

/// Terminate the process with status 1 so a supervisor can restart it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl ExhaustionPolicy for ExitProcess {
    fn on_exhausted(&self, side: BudgetSide) {
        error!("{} failure budget exhausted, exiting", side);
        std::process::exit(1);
    }
}

/// Consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    side: BudgetSide,
    ceiling: u32,
    remaining: u32,
}

impl FailureBudget {
    pub fn new(side: BudgetSide, ceiling: u32) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            side,
            ceiling,
            remaining: ceiling,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn succeed(&mut self) {
        self.remaining = self.ceiling;
    }

    /// Count one failure. Returns `true` when this failure exhausted the
    /// budget; the budget is then refilled.
    pub fn fail(&mut self, policy: &dyn ExhaustionPolicy) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return false;
        }
        policy.on_exhausted(self.side);
        self.remaining = self.ceiling;
        true
    }
}

/// Values of the last upload.
#[derive(Debug, Clone, Default)]
pub struct ReadingSnapshot {
    digital: Vec<bool>,
    analog: Vec<f32>,
    has_sent: bool,
    uploaded_at: Option<Instant>,
}

impl ReadingSnapshot {
    pub fn has_sent(&self) -> bool {
        self.has_sent
    }

    /// Whether a sample differs enough from the last upload to report it.
    pub fn have_changed(&self, digital: &[bool], analog: &[f32]) -> bool {
        if !self.has_sent {
            return true;
        }
        if digital != self.digital.as_slice() || analog.len() != self.analog.len() {
            return true;
        }
        analog.iter().zip(&self.analog).any(|(&now, &last)| {
            if last == 0.0 {
                now != 0.0
            } else {
                ((now - last) / last).abs() > ANALOG_DEADBAND
            }
        })
    }

    /// Whether the last upload is older than `max_interval`.
    pub fn upload_due(&self, now: Instant, max_interval: Duration) -> bool {
        match self.uploaded_at {
            Some(at) => now.saturating_duration_since(at) > max_interval,
            None => true,
        }
    }

    pub fn update(&mut self, digital: &[bool], analog: &[f32], now: Instant) {
        self.digital = digital.to_vec();
        self.analog = analog.to_vec();
        self.has_sent = true;
        self.uploaded_at = Some(now);
    }
}

/// Build the `name:1:value` parameter list.
///
/// `digital` holds one value per `I`/`Q` point of `read_map`, in map order.
/// In `analog_map` a `"0"`-class slot is the low word of a pair whose high
/// word is the slot before it; any other slot not followed by a low word is
/// reported on its own.
pub fn format_payload(
    read_map: &AddressMap,
    digital: &[bool],
    analog_map: &AddressMap,
    analog: &[f32],
) -> String {
    let mut params = Vec::with_capacity(digital.len() + analog.len());

    let digital_points = read_map.iter().filter(|p| p.kind().is_some());
    for (point, &value) in digital_points.zip(digital) {
        params.push(format!(
            "{}:{}:{}",
            point.name,
            WIALON_PARAM_TYPE_INT,
            u8::from(value)
        ));
    }

    let mut high_word: Option<u32> = None;
    for (index, &value) in analog.iter().enumerate() {
        let Some(point) = analog_map.get(index) else {
            break;
        };
        let word = value as u32;
        if point.is_low_word() {
            let combined = (high_word.take().unwrap_or(0) << 16) | word;
            params.push(format!("{}:{}:{}", point.name, WIALON_PARAM_TYPE_INT, combined));
        } else if analog_map.get(index + 1).is_some_and(|next| next.is_low_word()) {
            high_word = Some(word);
        } else {
            params.push(format!("{}:{}:{}", point.name, WIALON_PARAM_TYPE_INT, word));
        }
    }

    params.join(",")
}

/// Point tables the engine works from.
#[derive(Debug, Clone, Default)]
pub struct PointMaps {
    /// Points sampled every cycle (`I` and `Q` classes).
    pub read: AddressMap,
    /// Coils operators may set with `W` commands.
    pub write: AddressMap,
    /// Input registers sampled every cycle.
    pub analog: AddressMap,
}

/// Timing and feature switches.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub period: Duration,
    pub max_upload_interval: Duration,
    pub genset_enabled: bool,
    pub read_pause: Duration,
    pub write_pause: Duration,
    pub settle_pause: Duration,
    pub queue_depth: usize,
    pub plc_failure_ceiling: u32,
    pub telemetry_failure_ceiling: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            period: DEFAULT_POLL_PERIOD,
            max_upload_interval: DEFAULT_MAX_UPLOAD_INTERVAL,
            genset_enabled: false,
            read_pause: INTER_READ_PAUSE,
            write_pause: INTER_WRITE_PAUSE,
            settle_pause: COMMAND_SETTLE_PAUSE,
            queue_depth: COMMAND_QUEUE_DEPTH,
            plc_failure_ceiling: PLC_FAILURE_CEILING,
            telemetry_failure_ceiling: TELEMETRY_FAILURE_CEILING,
        }
    }
}

/// Result of one sample cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    PlcFailed,
    Pinged,
    PingFailed,
    Uploaded,
    UploadFailed,
}

/// Read commands from the link until the channel closes.
pub fn spawn_listener<T: TelemetryIo>(link: Arc<T>, tx: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                _ = tx.closed() => break,
                result = link.read_command() => result,
            };
            match result {
                Ok(Command::Timeout) => {}
                Ok(command) => {
                    debug!("queued command {:?}", command);
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("reading command: {}", e);
                    if e.is_connection_fault() {
                        sleep(LISTENER_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        debug!("command listener stopped");
    })
}

/// The sampling and dispatch loop.
pub struct PollingEngine<P: PlcIo, T: TelemetryIo> {
    plc: P,
    link: Arc<T>,
    maps: PointMaps,
    input_addresses: Vec<u16>,
    coil_addresses: Vec<u16>,
    settings: EngineSettings,
    snapshot: ReadingSnapshot,
    plc_budget: FailureBudget,
    link_budget: FailureBudget,
    policy: Arc<dyn ExhaustionPolicy>,
}

impl<P: PlcIo, T: TelemetryIo> PollingEngine<P, T> {
    pub fn new(
        plc: P,
        link: Arc<T>,
        maps: PointMaps,
        settings: EngineSettings,
        policy: Arc<dyn ExhaustionPolicy>,
    ) -> Self {
        let addresses_of = |kind| {
            maps.read
                .points_of(kind)
                .map(|p: Point<'_>| p.address)
                .collect::<Vec<_>>()
        };
        let input_addresses = addresses_of(PointKind::DiscreteInput);
        let coil_addresses = addresses_of(PointKind::Coil);

        Self {
            plc,
            link,
            input_addresses,
            coil_addresses,
            plc_budget: FailureBudget::new(BudgetSide::Plc, settings.plc_failure_ceiling),
            link_budget: FailureBudget::new(BudgetSide::Telemetry, settings.telemetry_failure_ceiling),
            maps,
            settings,
            snapshot: ReadingSnapshot::default(),
            policy,
        }
    }

    pub fn snapshot(&self) -> &ReadingSnapshot {
        &self.snapshot
    }

    /// Run until `shutdown` completes, then stop the listener and close
    /// both sessions.
    pub async fn run<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::channel(self.settings.queue_depth.max(1));
        let listener = spawn_listener(Arc::clone(&self.link), tx);

        let mut ticker = interval_at(Instant::now() + self.settings.period, self.settings.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "polling every {:?}, uploading at least every {:?}",
            self.settings.period, self.settings.max_upload_interval
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.cycle(false).await;
                }
                Some(command) = rx.recv() => {
                    self.handle_command(command).await;
                }
            }
        }

        drop(rx);
        listener.abort();
        let _ = listener.await;
        if let Err(e) = self.plc.close().await {
            warn!("closing PLC connection: {}", e);
        }
        self.link.close().await;
    }

    /// Read inputs, coils and analogs; digital values come back in read-map order.
    async fn sample(&mut self) -> GatewayResult<(Vec<bool>, Vec<f32>)> {
        let inputs = self.plc.read_discrete_inputs(&self.input_addresses).await?;
        sleep(self.settings.read_pause).await;
        let coils = self.plc.read_coils(&self.coil_addresses).await?;
        sleep(self.settings.read_pause).await;
        let analog = self.plc.read_analog_inputs(self.maps.analog.addresses()).await?;
        sleep(self.settings.read_pause).await;

        let mut inputs = inputs.into_iter();
        let mut coils = coils.into_iter();
        let digital = self
            .maps
            .read
            .iter()
            .filter_map(|p| match p.kind()? {
                PointKind::DiscreteInput => inputs.next(),
                PointKind::Coil => coils.next(),
            })
            .collect();
        Ok((digital, analog))
    }

    /// One sample followed by an upload or a ping. `force` skips the dead-band.
    pub async fn cycle(&mut self, force: bool) -> CycleOutcome {
        let (digital, analog) = match self.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                error!("reading PLC: {}", e);
                self.plc_budget.fail(self.policy.as_ref());
                return CycleOutcome::PlcFailed;
            }
        };
        self.plc_budget.succeed();

        let now = Instant::now();
        let upload = force
            || self.snapshot.have_changed(&digital, &analog)
            || self.snapshot.upload_due(now, self.settings.max_upload_interval);

        if !upload {
            return match self.link.send_ping().await {
                Ok(()) => {
                    self.link_budget.succeed();
                    CycleOutcome::Pinged
                }
                Err(e) => {
                    error!("sending ping: {}", e);
                    self.link_budget.fail(self.policy.as_ref());
                    self.reopen_link().await;
                    CycleOutcome::PingFailed
                }
            };
        }

        let payload = format_payload(&self.maps.read, &digital, &self.maps.analog, &analog);
        match self.link.send_data(&payload).await {
            Ok(()) => {
                self.snapshot.update(&digital, &analog, now);
                CycleOutcome::Uploaded
            }
            Err(e) => {
                warn!("uploading: {}", e);
                self.reopen_link().await;
                CycleOutcome::UploadFailed
            }
        }
    }

    async fn reopen_link(&self) {
        if let Err(e) = self.link.open().await {
            warn!("re-opening telemetry link: {}", e);
        }
    }

    /// Apply one operator command, then force a fresh upload.
    pub async fn handle_command(&mut self, command: Command) -> Option<CycleOutcome> {
        let Command::Message { kind, value } = command else {
            return None;
        };

        match kind.to_ascii_uppercase().as_str() {
            "TIMEOUT" => return None,
            "W" => self.apply_writes(&value).await,
            "GS" => self.apply_genset(&value).await,
            other => warn!("unknown command kind {:?}: {:?}", other, value),
        }

        sleep(self.settings.settle_pause).await;
        Some(self.cycle(true).await)
    }

    /// Write-map entry for an operator-supplied name.
    fn resolve_write(&self, name: &str) -> Option<Point<'_>> {
        self.maps.write.find(name).or_else(|| {
            name.strip_prefix(WRITE_NAME_PREFIX)
                .and_then(|bare| self.maps.write.find(bare))
        })
    }

    async fn apply_writes(&mut self, assignments: &str) {
        for assignment in assignments.split(';') {
            let parts: Vec<&str> = assignment.split('=').map(str::trim).collect();
            let [name, state] = parts[..] else {
                warn!("malformed assignment {:?} in {:?}", assignment, assignments);
                continue;
            };
            let value = match state {
                "1" => true,
                "0" => false,
                _ => {
                    warn!("malformed value in {:?}", assignment);
                    continue;
                }
            };
            let Some(address) = self.resolve_write(name).map(|p| p.address) else {
                warn!("not found variable: {}", name);
                continue;
            };

            info!("command {}={} (coil {})", name, value, address);
            if let Err(e) = self.plc.write_coil(address, value).await {
                warn!("writing {}={} at {}: {}", name, value, address, e);
            }
            sleep(self.settings.write_pause).await;
        }
    }

    async fn apply_genset(&mut self, value: &str) {
        if !self.settings.genset_enabled {
            info!("generator commands disabled, ignoring {:?}", value);
            return;
        }
        let Some(action) = GensetAction::parse(value) else {
            warn!("unknown generator command {:?}", value);
            return;
        };
        info!("generator {:?}", action);
        if let Err(e) = self.plc.genset(action).await {
            warn!("generator {:?}: {}", action, e);
        }
    }
}
