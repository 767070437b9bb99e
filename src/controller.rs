use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info, warn};
use rand::Rng;

use crate::cli::RunOpts;
use crate::display::{DisplayMode, DisplaySink, TerminalDisplay, render_snapshot};
use crate::engine::{CommandEngine, CommandResult};
use crate::input::{RawModeGuard, spawn_keyboard};
use crate::payload::{
    AdvPayload, MAX_ADV_PAYLOAD, MarkerWindow, PAYLOAD_HEADER, Verdict, validate,
};
use crate::port::open_duplex;
use crate::proto::command::{
    AdvParameters, Command, FirmwareInfo, MAX_ADV_INTERVAL_MS, MIN_ADV_INTERVAL_MS,
    MIN_PROTOCOL_VERSION, Notification, units_from_ms,
};
use crate::proto::frame::Fields;
use crate::reader::spawn_reader;
use crate::report::{SessionReport, SessionSummary};
use crate::stats::{RoundAggregator, RoundRecord};

/// Experiment lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Unconfigured => "UNCONFIGURED",
            Phase::Running => "RUNNING",
            Phase::Stopping => "STOPPING",
            Phase::Stopped => "STOPPED",
            Phase::Failed => "FAILED",
        })
    }
}

/// Single-character operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCmd {
    ShowPayload,
    ShowParameters,
    SlowDown,
    SpeedUp,
    Quit,
}

/// Everything the control loop reacts to, merged into one queue so handling
/// stays strictly sequential.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Notify(Notification),
    PayloadTick,
    DisplayTick,
    Key(KeyCmd),
    TransportDown(String),
}

/// Validated run settings.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub device_name: String,
    pub payload_refresh: Duration,
    pub display_period: Duration,
    pub adv_interval_ms: u32,
    pub adv_interval_jump_ms: u32,
    pub round_window: Duration,
    pub payload_min: usize,
    pub payload_max: usize,
    pub timeout: Duration,
    pub retries: u32,
    pub out_prefix: String,
}

impl ExperimentConfig {
    pub fn from_opts(opts: &RunOpts) -> Result<Self> {
        if opts.name.is_empty()
            || opts
                .name
                .contains(|c: char| c == ',' || c == '=' || c.is_whitespace())
        {
            bail!("device name must be non-empty, without commas, equals signs or whitespace");
        }
        if opts.payload_min < PAYLOAD_HEADER
            || opts.payload_max > MAX_ADV_PAYLOAD
            || opts.payload_min > opts.payload_max
        {
            bail!(
                "payload size range must stay within {}..={} bytes",
                PAYLOAD_HEADER,
                MAX_ADV_PAYLOAD
            );
        }
        if !opts.payload_update_interval.is_finite() || opts.payload_update_interval <= 0.0 {
            bail!("payload update interval must be positive");
        }
        if !opts.display_refresh_rate.is_finite() || opts.display_refresh_rate <= 0.0 {
            bail!("display refresh rate must be positive");
        }
        if !opts.round_secs.is_finite() || opts.round_secs <= 0.0 {
            bail!("round window must be positive");
        }
        Ok(Self {
            device_name: opts.name.clone(),
            payload_refresh: Duration::from_secs_f64(opts.payload_update_interval),
            display_period: Duration::from_secs_f64(1.0 / opts.display_refresh_rate),
            adv_interval_ms: opts.adv_interval_ms,
            adv_interval_jump_ms: opts.adv_interval_jump,
            round_window: Duration::from_secs_f64(opts.round_secs),
            payload_min: opts.payload_min,
            payload_max: opts.payload_max,
            timeout: Duration::from_millis(opts.timeout_ms),
            retries: opts.retries,
            out_prefix: opts.out.clone(),
        })
    }
}

/// What the display renders and the key handlers mutate.
pub struct ExperimentState {
    pub phase: Phase,
    pub device_name: String,
    pub firmware: Option<FirmwareInfo>,
    pub adv_interval_ms: u32,
    pub mode: DisplayMode,
    pub payload: Option<AdvPayload>,
    pub params: Option<AdvParameters>,
    pub last_round: Option<RoundRecord>,
}

impl ExperimentState {
    pub fn new(device_name: String, adv_interval_ms: u32) -> Self {
        Self {
            phase: Phase::Unconfigured,
            device_name,
            firmware: None,
            adv_interval_ms,
            mode: DisplayMode::Payload,
            payload: None,
            params: None,
            last_round: None,
        }
    }
}

/// Next advertising interval after one keyboard step, clamped to the range
/// the firmware accepts.
pub fn next_interval(current_ms: u32, jump_ms: u32, up: bool) -> u32 {
    if up {
        current_ms.saturating_add(jump_ms).min(MAX_ADV_INTERVAL_MS)
    } else {
        current_ms.saturating_sub(jump_ms).max(MIN_ADV_INTERVAL_MS)
    }
}

/// One experiment over one module: owns the engine, the event queue and all
/// mutable state. Everything it does happens on the caller's thread.
struct Session<W: Write> {
    config: ExperimentConfig,
    engine: CommandEngine<W>,
    events: Receiver<ControlEvent>,
    display: Box<dyn DisplaySink>,
    report: SessionReport<Box<dyn Write>>,
    state: ExperimentState,
    markers: MarkerWindow,
    agg: RoundAggregator,
    fault: Option<String>,
}

impl<W: Write> Session<W> {
    fn new(
        config: ExperimentConfig,
        engine: CommandEngine<W>,
        events: Receiver<ControlEvent>,
        display: Box<dyn DisplaySink>,
        report: SessionReport<Box<dyn Write>>,
    ) -> Self {
        let state = ExperimentState::new(config.device_name.clone(), config.adv_interval_ms);
        let markers = MarkerWindow::new(1, config.payload_refresh);
        Self {
            config,
            engine,
            events,
            display,
            report,
            state,
            markers,
            agg: RoundAggregator::new(),
            fault: None,
        }
    }

    /// Configures the module and collects until told to stop. The summary
    /// logs are written even when the session ends on a fault.
    fn run(mut self) -> Result<SessionSummary> {
        if let Err(e) = self.configure() {
            self.state.phase = Phase::Failed;
            return Err(e);
        }
        info!(
            "experiment running: round window {:.1} s, payload refresh every {:.1} s",
            self.config.round_window.as_secs_f64(),
            self.config.payload_refresh.as_secs_f64()
        );
        while self.state.phase == Phase::Running {
            match self.events.recv_timeout(Duration::from_millis(50)) {
                Ok(ev) => {
                    if let Err(e) = self.handle(ev) {
                        error!("transport failure: {:#}", e);
                        self.fault = Some(format!("{:#}", e));
                        self.state.phase = Phase::Stopping;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.fault = Some("event sources disconnected".to_string());
                    self.state.phase = Phase::Stopping;
                }
            }
            if self.state.phase == Phase::Running
                && self.agg.window_elapsed(self.config.round_window)
            {
                if let Err(e) = self.seal_round() {
                    error!("persistence failure: {:#}", e);
                    self.fault = Some(format!("{:#}", e));
                    self.state.phase = Phase::Stopping;
                }
            }
        }
        self.shutdown()
    }

    /// Startup sequence. Any refusal or silence here is fatal: an experiment
    /// must not start half-configured.
    fn configure(&mut self) -> Result<()> {
        // Silence anything a previous run left advertising. An error code
        // only means the radio was already idle.
        match self
            .engine
            .execute(&Command::StopAdvertising)
            .context("stop advertising (preflight)")?
        {
            CommandResult::Timeout => bail!("module not answering (stop advertising preflight)"),
            _ => {}
        }

        let fields = self.require(Command::QueryFirmwareVersion, "query firmware version")?;
        let fw = FirmwareInfo::from_fields(&fields).context("parsing firmware version reply")?;
        if !fw.supports_extended_adv() {
            bail!(
                "firmware protocol {}.{} has no extended advertising support (need {}.{})",
                fw.protocol >> 8,
                fw.protocol & 0xFF,
                MIN_PROTOCOL_VERSION >> 8,
                MIN_PROTOCOL_VERSION & 0xFF
            );
        }
        info!("module firmware: {}", fw);
        self.state.firmware = Some(fw);

        self.require(
            Command::SetDeviceName {
                name: self.config.device_name.clone(),
            },
            "set device name",
        )?;

        let params = AdvParameters {
            interval_units: units_from_ms(self.config.adv_interval_ms),
            ..AdvParameters::default()
        };
        self.require(Command::SetAdvParameters(params), "set advertising parameters")?;

        let payload = self.build_payload(self.markers.current())?;
        self.require(
            Command::SetAdvData {
                append: false,
                data: payload.bytes().to_vec(),
            },
            "set initial advertising data",
        )?;
        self.state.payload = Some(payload);

        let fields = self.require(Command::GetAdvParameters, "read back advertising parameters")?;
        let cached =
            AdvParameters::from_fields(&fields).context("parsing advertising parameters reply")?;
        self.state.params = Some(cached);

        self.require(Command::StartAdvertising, "start advertising")?;
        self.state.phase = Phase::Running;
        Ok(())
    }

    /// One configuration step; anything but success aborts.
    fn require(&mut self, cmd: Command, step: &str) -> Result<Fields> {
        match self.engine.execute(&cmd).with_context(|| step.to_string())? {
            CommandResult::Ok(fields) => Ok(fields),
            CommandResult::DeviceError(code) => bail!("{}: device error 0x{:04X}", step, code),
            CommandResult::Timeout => bail!("{}: no response from module", step),
        }
    }

    fn handle(&mut self, ev: ControlEvent) -> Result<()> {
        match ev {
            ControlEvent::Notify(Notification::AdvReport { data, .. }) => {
                let verdict = validate(&data, &self.markers);
                if verdict != Verdict::Ok {
                    debug!("report failed validation: {:?}", verdict);
                }
                self.agg.record(verdict);
            }
            ControlEvent::Notify(Notification::Other { name }) => {
                debug!("ignoring {} event", name);
            }
            ControlEvent::PayloadTick => self.refresh_payload()?,
            ControlEvent::DisplayTick => {
                let text = render_snapshot(&self.state, &self.agg.live());
                if let Err(e) = self.display.render(&text) {
                    debug!("display render failed: {}", e);
                }
            }
            ControlEvent::Key(KeyCmd::ShowPayload) => self.state.mode = DisplayMode::Payload,
            ControlEvent::Key(KeyCmd::ShowParameters) => self.state.mode = DisplayMode::Parameters,
            ControlEvent::Key(KeyCmd::SlowDown) => self.step_interval(true)?,
            ControlEvent::Key(KeyCmd::SpeedUp) => self.step_interval(false)?,
            ControlEvent::Key(KeyCmd::Quit) => {
                info!("shutdown requested");
                self.state.phase = Phase::Stopping;
            }
            ControlEvent::TransportDown(reason) => {
                error!("transport failed: {}", reason);
                self.fault = Some(reason);
                self.state.phase = Phase::Stopping;
            }
        }
        Ok(())
    }

    fn build_payload(&self, marker: u32) -> Result<AdvPayload> {
        let size = rand::thread_rng().gen_range(self.config.payload_min..=self.config.payload_max);
        Ok(AdvPayload::generate(marker, size)?)
    }

    /// Pushes a fresh payload to the module. The marker window only advances
    /// once the module accepts the data, so reports for the payload still on
    /// air keep validating.
    fn refresh_payload(&mut self) -> Result<()> {
        let next = self.markers.current().wrapping_add(1);
        let payload = self.build_payload(next)?;
        let cmd = Command::SetAdvData {
            append: false,
            data: payload.bytes().to_vec(),
        };
        match self.engine.execute(&cmd)? {
            CommandResult::Ok(_) => {
                debug!("payload refreshed: marker {}, {} bytes", next, payload.size());
                self.markers.advance(next);
                self.state.payload = Some(payload);
            }
            CommandResult::DeviceError(code) => {
                warn!(
                    "payload refresh rejected: 0x{:04X}, keeping marker {}",
                    code,
                    self.markers.current()
                );
            }
            CommandResult::Timeout => {
                warn!(
                    "payload refresh timed out, keeping marker {}",
                    self.markers.current()
                );
            }
        }
        Ok(())
    }

    fn step_interval(&mut self, up: bool) -> Result<()> {
        let next = next_interval(self.state.adv_interval_ms, self.config.adv_interval_jump_ms, up);
        if next == self.state.adv_interval_ms {
            return Ok(());
        }
        self.apply_interval(next)
    }

    /// Parameters only take effect while advertising is stopped, so a retune
    /// is a stop/set/start triple. The restart always runs: a refused retune
    /// must not leave the radio silent.
    fn apply_interval(&mut self, ms: u32) -> Result<()> {
        if !self.engine.execute(&Command::StopAdvertising)?.is_ok() {
            warn!("stop before retune was refused");
        }
        let mut params = self.state.params.unwrap_or_default();
        params.interval_units = units_from_ms(ms);
        match self.engine.execute(&Command::SetAdvParameters(params))? {
            CommandResult::Ok(_) => {
                self.state.adv_interval_ms = ms;
                self.state.params = Some(params);
                info!(
                    "advertising interval now {} ms ({:.1} Hz)",
                    ms,
                    1000.0 / ms as f64
                );
            }
            CommandResult::DeviceError(code) => warn!("retune rejected: 0x{:04X}", code),
            CommandResult::Timeout => warn!("retune timed out"),
        }
        if !self.engine.execute(&Command::StartAdvertising)?.is_ok() {
            warn!("restart after retune was refused");
        }
        Ok(())
    }

    fn seal_round(&mut self) -> Result<()> {
        let rec = self.agg.seal();
        info!(
            "round {} sealed: {} packets, {} errors, {:.3} s, {:.3} p/s",
            rec.round, rec.packets, rec.errors, rec.duration_secs, rec.throughput
        );
        self.report.record_round(&rec)?;
        self.state.last_round = Some(rec);
        Ok(())
    }

    /// Stops the radio, seals whatever the open round collected and writes
    /// the summary log. Runs on every exit path after configuration.
    fn shutdown(mut self) -> Result<SessionSummary> {
        self.state.phase = Phase::Stopping;
        info!("stopping experiment");
        match self.engine.execute(&Command::StopAdvertising) {
            Ok(CommandResult::Ok(_)) => {}
            Ok(CommandResult::DeviceError(code)) => {
                warn!("stop advertising at shutdown: device error 0x{:04X}", code)
            }
            Ok(CommandResult::Timeout) => warn!("stop advertising at shutdown: no response"),
            Err(e) => warn!("stop advertising at shutdown: {:#}", e),
        }
        let rec = self.agg.seal();
        if rec.packets > 0 || rec.errors > 0 {
            info!(
                "partial round {} sealed: {} packets, {} errors",
                rec.round, rec.packets, rec.errors
            );
            self.report.record_round(&rec)?;
        }
        let summary = self.report.finish()?;
        self.state.phase = Phase::Stopped;
        match self.fault.take() {
            Some(reason) => Err(anyhow!("session ended by transport failure: {}", reason)),
            None => Ok(summary),
        }
    }
}

/// Periodic control event source. Sleeps in short slices so a stop request
/// never waits out a full period.
fn spawn_ticker(
    period: Duration,
    event: ControlEvent,
    tx: Sender<ControlEvent>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let slice = Duration::from_millis(50);
        loop {
            let mut slept = Duration::ZERO;
            while slept < period {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                let step = slice.min(period - slept);
                thread::sleep(step);
                slept += step;
            }
            if stop.load(Ordering::Relaxed) || tx.send(event.clone()).is_err() {
                return;
            }
        }
    })
}

/// Entry point for the `run` subcommand: wires the port, the worker threads
/// and the session together, then tears everything down in order.
pub fn run(opts: RunOpts) -> Result<()> {
    let config = ExperimentConfig::from_opts(&opts)?;
    let report = SessionReport::create(&config.out_prefix)?;
    let (read_half, write_half) = open_duplex(&opts.ser)?;
    info!(
        "starting experiment on {}: device name {}, adv interval {} ms",
        opts.ser.dev, config.device_name, config.adv_interval_ms
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (resp_tx, resp_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();

    let mut workers = Vec::new();
    workers.push(spawn_reader(
        read_half,
        resp_tx,
        event_tx.clone(),
        Arc::clone(&stop),
    ));
    workers.push(spawn_ticker(
        config.payload_refresh,
        ControlEvent::PayloadTick,
        event_tx.clone(),
        Arc::clone(&stop),
    ));
    workers.push(spawn_ticker(
        config.display_period,
        ControlEvent::DisplayTick,
        event_tx.clone(),
        Arc::clone(&stop),
    ));

    let raw = RawModeGuard::enable().context("enabling raw terminal mode")?;
    workers.push(spawn_keyboard(event_tx, Arc::clone(&stop)));

    let engine = CommandEngine::new(write_half, resp_rx, config.timeout, config.retries);
    let session = Session::new(
        config,
        engine,
        event_rx,
        Box::new(TerminalDisplay::new()),
        report,
    );
    let outcome = session.run();

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.join();
    }
    drop(raw);

    let summary = outcome?;
    println!(
        "experiment complete: {} rounds, {} packets, {:.3} s, {:.3} p/s, {} errors",
        summary.rounds,
        summary.packets,
        summary.duration_secs,
        summary.throughput(),
        summary.errors
    );
    Ok(())
}
