//! View processes.
//!
//! A [`ViewProcess`] owns one worker task that repeatedly waits for its
//! triggers, pulls the next cycle from its execution sequence, snapshots live
//! data and runs a [`SingleComputationCycle`]. Results are published as
//! [`ViewProcessEvent`]s on a broadcast channel.
//!
//! ```text
//! NotStarted ──start()──> Running <──pause()/resume()──> Paused
//!      │                     │                              │
//!      └──────────stop()─────┴──────────────────────────────┴──> Terminated
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vantage_traits::config::{
    CycleExecutionOptions, EngineConfig, ExecutionFlag, ExecutionFlags, ViewExecutionConfig,
};
use vantage_traits::market_data::{
    LiveDataEvent, LiveDataEventReceiver, LiveDataProvider, MarketDataProviderResolver,
    MarketDataSpecification,
};
use vantage_traits::{SnapshotId, UserPrincipal, ValueRequirement};

use crate::cache::ComputationCacheSource;
use crate::compiler::{CompiledView, ViewCompiler};
use crate::cycle::{CycleContext, CycleReference, CycleType, SingleComputationCycle};
use crate::error::{EngineError, EngineResult};
use crate::events::ViewProcessEvent;
use crate::function::FunctionRepository;
use crate::ids::ViewProcessId;
use crate::live_data::PrioritizedLiveDataProvider;
use crate::result::{ViewComputationResult, ViewDeltaResult};
use crate::sequence::{sequence_from_config, Clock, ExecutionSequence, RealTimeSequence, SystemClock};
use crate::trigger::{
    CombinedTrigger, Eligibility, FixedTimeTrigger, RecomputationPeriodTrigger,
    RunAsFastAsPossibleTrigger, SuccessiveDeltaLimitTrigger, ViewCycleTrigger,
};

// =============================================================================
// OPTIONS
// =============================================================================

/// How a view process executes.
pub struct ViewExecutionOptions {
    /// Cycles to run
    pub execution_sequence: Box<dyn ExecutionSequence>,
    /// Execution flags
    pub flags: ExecutionFlags,
    /// Force a full cycle after this many consecutive delta cycles
    pub max_successive_delta_cycles: Option<u32>,
    /// Persisted snapshot to run every cycle against
    pub market_data_snapshot_id: Option<String>,
    /// Defaults merged into every pulled cycle
    pub default_cycle_options: Option<CycleExecutionOptions>,
}

impl ViewExecutionOptions {
    /// Options with the given sequence and flags.
    pub fn new(execution_sequence: Box<dyn ExecutionSequence>, flags: ExecutionFlags) -> Self {
        Self {
            execution_sequence,
            flags,
            max_successive_delta_cycles: None,
            market_data_snapshot_id: None,
            default_cycle_options: None,
        }
    }

    /// Materialise serialised options.
    pub fn from_config(config: &ViewExecutionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            execution_sequence: sequence_from_config(&config.sequence, clock),
            flags: config.flags,
            max_successive_delta_cycles: config.max_successive_delta_cycles,
            market_data_snapshot_id: config.market_data_snapshot_id.clone(),
            default_cycle_options: config.default_cycle_options.clone(),
        }
    }

    /// Set the successive delta limit.
    pub fn with_max_successive_delta_cycles(mut self, max: u32) -> Self {
        self.max_successive_delta_cycles = Some(max);
        self
    }

    /// Run against a persisted snapshot.
    pub fn with_market_data_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.market_data_snapshot_id = Some(snapshot_id.into());
        self
    }

    /// Set the defaults merged into every cycle.
    pub fn with_default_cycle_options(mut self, defaults: CycleExecutionOptions) -> Self {
        self.default_cycle_options = Some(defaults);
        self
    }
}

impl std::fmt::Debug for ViewExecutionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewExecutionOptions")
            .field("flags", &self.flags)
            .field("max_successive_delta_cycles", &self.max_successive_delta_cycles)
            .field("market_data_snapshot_id", &self.market_data_snapshot_id)
            .field("default_cycle_options", &self.default_cycle_options)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle state of a view process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Built, not started
    NotStarted,
    /// Worker running
    Running,
    /// Worker parked between cycles
    Paused,
    /// Worker stopped; final
    Terminated,
}

/// Cycle counters of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStatistics {
    /// Cycles completed
    pub cycles_completed: u64,
    /// Cycles failed
    pub cycles_failed: u64,
    /// Duration of the last completed cycle
    pub last_duration: Option<Duration>,
    /// Total duration of completed cycles
    pub total_duration: Duration,
}

impl CycleStatistics {
    /// Mean duration of completed cycles.
    pub fn average_duration(&self) -> Option<Duration> {
        if self.cycles_completed == 0 {
            return None;
        }
        let count = u32::try_from(self.cycles_completed).unwrap_or(u32::MAX);
        Some(self.total_duration / count)
    }
}

/// State shared between the process handle and its worker.
struct ProcessControl {
    state: watch::Sender<ProcessState>,
    force_cycle: AtomicBool,
    cycle_requested: AtomicBool,
    wake: Notify,
    stats: RwLock<CycleStatistics>,
}

impl ProcessControl {
    fn new(cycle_requested: bool) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            state,
            force_cycle: AtomicBool::new(false),
            cycle_requested: AtomicBool::new(cycle_requested),
            wake: Notify::new(),
            stats: RwLock::new(CycleStatistics::default()),
        }
    }

    fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    fn is_terminated(&self) -> bool {
        self.state() == ProcessState::Terminated
    }

    fn transition(&self, from: ProcessState, to: ProcessState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// Returns false if already terminated.
    fn terminate(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s == ProcessState::Terminated {
                false
            } else {
                *s = ProcessState::Terminated;
                true
            }
        });
        self.wake.notify_one();
        changed
    }
}

// =============================================================================
// VIEW PROCESS
// =============================================================================

/// A running view: compiles once, then executes cycles until its sequence is
/// exhausted or it is stopped.
pub struct ViewProcess {
    id: ViewProcessId,
    view_name: String,
    control: Arc<ProcessControl>,
    events: broadcast::Sender<ViewProcessEvent>,
    worker: Mutex<Option<Worker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ViewProcess {
    /// Start building a process for `view_name`.
    pub fn builder(view_name: impl Into<String>) -> ViewProcessBuilder {
        ViewProcessBuilder::new(view_name)
    }

    /// Process id.
    pub fn id(&self) -> ViewProcessId {
        self.id
    }

    /// View name.
    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.control.state()
    }

    /// Watch lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.control.state.subscribe()
    }

    /// Subscribe to process events.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewProcessEvent> {
        self.events.subscribe()
    }

    /// Cycle counters so far.
    pub fn statistics(&self) -> CycleStatistics {
        *self.control.stats.read()
    }

    /// Compile the view and start the worker.
    ///
    /// Fails with [`EngineError::IllegalState`] unless the process has never
    /// been started, and with [`EngineError::Compilation`] if the initial
    /// compilation fails, in which case the process is terminated.
    pub async fn start(&self) -> EngineResult<()> {
        if self.state() != ProcessState::NotStarted {
            return Err(EngineError::IllegalState(format!(
                "view process {} already started",
                self.id
            )));
        }
        let mut worker = self.worker.lock().take().ok_or_else(|| {
            EngineError::IllegalState(format!("view process {} already started", self.id))
        })?;

        info!(process = %self.id, view = %self.view_name, "Starting view process");

        if let Err(e) = worker.initialise().await {
            error!(process = %self.id, error = %e, "View process failed to start");
            worker.release_market_data();
            self.control.terminate();
            return Err(e);
        }

        if !self.control.transition(ProcessState::NotStarted, ProcessState::Running) {
            worker.release_market_data();
            return Err(EngineError::Shutdown);
        }
        let handle = tokio::spawn(worker.run());
        *self.handle.lock() = Some(handle);

        info!(process = %self.id, "View process started");
        Ok(())
    }

    /// Park the worker before its next cycle.
    pub fn pause(&self) -> EngineResult<()> {
        if self.control.transition(ProcessState::Running, ProcessState::Paused) {
            debug!(process = %self.id, "View process paused");
            Ok(())
        } else {
            Err(EngineError::IllegalState(format!(
                "cannot pause view process in state {:?}",
                self.state()
            )))
        }
    }

    /// Resume a paused worker.
    pub fn resume(&self) -> EngineResult<()> {
        if self.control.transition(ProcessState::Paused, ProcessState::Running) {
            debug!(process = %self.id, "View process resumed");
            Ok(())
        } else {
            Err(EngineError::IllegalState(format!(
                "cannot resume view process in state {:?}",
                self.state()
            )))
        }
    }

    /// Run a cycle as soon as possible, regardless of the triggers.
    pub fn trigger_cycle(&self) {
        self.control.force_cycle.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    /// Run a cycle once the triggers allow one.
    pub fn request_cycle(&self) {
        self.control.cycle_requested.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    /// Stop the process and wait for the worker to exit. Idempotent.
    pub async fn stop(&self) {
        if self.control.terminate() {
            info!(process = %self.id, "Stopping view process");
        }
        // A worker never spawned reports its own termination here
        if let Some(mut worker) = self.worker.lock().take() {
            worker.release_market_data();
            worker.publish(ViewProcessEvent::ProcessTerminated { interrupted: true });
        }
        self.join().await;
    }

    /// Alias of [`stop`](Self::stop).
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    /// Wait for the worker to exit on its own.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(process = %self.id, error = %e, "View process worker panicked");
            }
        }
    }
}

impl Drop for ViewProcess {
    fn drop(&mut self) {
        self.control.terminate();
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for a [`ViewProcess`].
pub struct ViewProcessBuilder {
    view_name: String,
    compiler: Option<Arc<dyn ViewCompiler>>,
    resolver: Option<Arc<dyn MarketDataProviderResolver>>,
    functions: FunctionRepository,
    options: Option<ViewExecutionOptions>,
    config: Option<EngineConfig>,
    clock: Option<Arc<dyn Clock>>,
    user: Option<UserPrincipal>,
    cache_source: Option<Arc<ComputationCacheSource>>,
}

impl ViewProcessBuilder {
    /// Create a new builder.
    pub fn new(view_name: impl Into<String>) -> Self {
        Self {
            view_name: view_name.into(),
            compiler: None,
            resolver: None,
            functions: FunctionRepository::new(),
            options: None,
            config: None,
            clock: None,
            user: None,
            cache_source: None,
        }
    }

    /// Set the view compiler.
    pub fn with_compiler(mut self, compiler: Arc<dyn ViewCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Set the market data provider resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn MarketDataProviderResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the node functions.
    pub fn with_functions(mut self, functions: FunctionRepository) -> Self {
        self.functions = functions;
        self
    }

    /// Set the execution options.
    pub fn with_options(mut self, options: ViewExecutionOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the clock used for valuation times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Subscribe to live data as `user`.
    pub fn with_user(mut self, user: UserPrincipal) -> Self {
        self.user = Some(user);
        self
    }

    /// Share a cache source with other processes.
    pub fn with_cache_source(mut self, cache_source: Arc<ComputationCacheSource>) -> Self {
        self.cache_source = Some(cache_source);
        self
    }

    /// Build the process. Fails if the compiler or resolver is missing.
    pub fn build(self) -> EngineResult<ViewProcess> {
        let compiler = self
            .compiler
            .ok_or_else(|| EngineError::ConfigError("compiler not configured".into()))?;

        let resolver = self
            .resolver
            .ok_or_else(|| EngineError::ConfigError("market data resolver not configured".into()))?;

        let config = self.config.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let options = self.options.unwrap_or_else(|| {
            ViewExecutionOptions::new(
                Box::new(RealTimeSequence::new(clock.clone())),
                ExecutionFlags::triggers_enabled(),
            )
        });

        let id = ViewProcessId::new();
        let control = Arc::new(ProcessControl::new(
            !options.flags.contains(ExecutionFlag::WaitForInitialTrigger),
        ));
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let triggers = cycle_triggers(&options, &config);

        let worker = Worker {
            id,
            view_name: self.view_name.clone(),
            user: self.user.unwrap_or_else(UserPrincipal::system),
            config,
            options,
            compiler,
            resolver,
            functions: self.functions,
            clock,
            cache_source: self.cache_source.unwrap_or_default(),
            state_rx: control.state.subscribe(),
            control: control.clone(),
            events: events.clone(),
            triggers,
            expiry: FixedTimeTrigger::new(),
            market_data: None,
            live_rx: None,
            compiled: None,
            compilation_valid: false,
            subscribed: BTreeSet::new(),
            pending: BTreeSet::new(),
            previous: None,
            previous_result: None,
        };

        Ok(ViewProcess {
            id,
            view_name: self.view_name,
            control,
            events,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        })
    }
}

fn cycle_triggers(options: &ViewExecutionOptions, config: &EngineConfig) -> CombinedTrigger {
    let mut triggers = CombinedTrigger::new();
    if options.flags.contains(ExecutionFlag::RunAsFastAsPossible) {
        triggers.add(RunAsFastAsPossibleTrigger);
    }
    if options.flags.contains(ExecutionFlag::TriggerOnTimeElapsed) {
        triggers.add(RecomputationPeriodTrigger::new(
            config.min_recomputation_period(),
            config.max_recomputation_period(),
            Instant::now(),
        ));
    }
    if let Some(max) = options.max_successive_delta_cycles {
        triggers.add(SuccessiveDeltaLimitTrigger::new(max));
    }
    triggers
}

// =============================================================================
// WORKER
// =============================================================================

/// Provider currently serving the process.
struct MarketDataSource {
    specs: Vec<MarketDataSpecification>,
    provider: Arc<dyn LiveDataProvider>,
}

/// Snapshot released when dropped.
struct SnapshotLease {
    provider: Arc<dyn LiveDataProvider>,
    id: SnapshotId,
}

impl SnapshotLease {
    fn take(provider: Arc<dyn LiveDataProvider>) -> EngineResult<Self> {
        let id = provider
            .snapshot()
            .map_err(|e| EngineError::MarketDataError(e.to_string()))?;
        Ok(Self { provider, id })
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        self.provider.release_snapshot(self.id);
    }
}

/// A cycle the triggers allow, with the instant it became due.
struct CycleDue {
    at: Instant,
    hint: Option<CycleType>,
}

enum Wake {
    Notified,
    Timer,
    Live(Option<LiveDataEvent>),
    StateChanged,
}

async fn next_live_event(rx: &mut Option<LiveDataEventReceiver>) -> Option<LiveDataEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Worker {
    id: ViewProcessId,
    view_name: String,
    user: UserPrincipal,
    config: EngineConfig,
    options: ViewExecutionOptions,
    compiler: Arc<dyn ViewCompiler>,
    resolver: Arc<dyn MarketDataProviderResolver>,
    functions: FunctionRepository,
    clock: Arc<dyn Clock>,
    cache_source: Arc<ComputationCacheSource>,
    control: Arc<ProcessControl>,
    state_rx: watch::Receiver<ProcessState>,
    events: broadcast::Sender<ViewProcessEvent>,
    triggers: CombinedTrigger,
    expiry: FixedTimeTrigger,
    market_data: Option<MarketDataSource>,
    live_rx: Option<LiveDataEventReceiver>,
    compiled: Option<Arc<CompiledView>>,
    compilation_valid: bool,
    subscribed: BTreeSet<ValueRequirement>,
    pending: BTreeSet<ValueRequirement>,
    previous: Option<CycleReference>,
    previous_result: Option<Arc<ViewComputationResult>>,
}

impl Worker {
    fn publish(&self, event: ViewProcessEvent) {
        debug!(process = %self.id, event = event.kind(), "Publishing view process event");
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn flag(&self, flag: ExecutionFlag) -> bool {
        self.options.flags.contains(flag)
    }

    fn is_terminated(&self) -> bool {
        *self.state_rx.borrow() == ProcessState::Terminated
    }

    /// Specs the first cycle is expected to use.
    fn initial_market_data_specs(&self) -> Vec<MarketDataSpecification> {
        if let Some(id) = &self.options.market_data_snapshot_id {
            return vec![MarketDataSpecification::user_snapshot(id.clone())];
        }
        self.options
            .default_cycle_options
            .as_ref()
            .map(|d| d.market_data_specs.clone())
            .unwrap_or_default()
    }

    /// Compile the view and subscribe to its market data.
    async fn initialise(&mut self) -> EngineResult<()> {
        let valuation_time = self
            .options
            .default_cycle_options
            .as_ref()
            .and_then(|d| d.valuation_time)
            .unwrap_or_else(|| self.clock.now());
        self.compile(valuation_time).await?;

        let specs = self.initial_market_data_specs();
        if !specs.is_empty() {
            self.ensure_market_data(&specs)?;
            self.update_subscriptions();
        }
        Ok(())
    }

    async fn run(mut self) {
        let interrupted = loop {
            // A forced trigger must not keep the worker from observing stop()
            tokio::task::yield_now().await;
            let Some(due) = self.wait_for_next_cycle().await else {
                break true;
            };
            if self.is_terminated() {
                break true;
            }

            let Some(options) = self
                .options
                .execution_sequence
                .next(self.options.default_cycle_options.as_ref())
            else {
                info!(process = %self.id, "No more cycles in execution sequence");
                self.publish(ViewProcessEvent::ProcessCompleted);
                break false;
            };
            debug!(process = %self.id, valuation_time = ?options.valuation_time, "Next cycle pulled");

            match self.run_cycle(options.clone(), due.hint).await {
                Ok(Some(cycle_type)) => {
                    self.triggers.cycle_triggered(due.at, cycle_type);
                    self.expiry.cycle_triggered(due.at, cycle_type);
                }
                Ok(None) => self.abandon_cycle(due.at),
                Err(EngineError::Shutdown) => break true,
                Err(e) => {
                    self.abandon_cycle(due.at);
                    warn!(process = %self.id, error = %e, "View cycle execution failed");
                    self.control.stats.write().cycles_failed += 1;
                    self.publish(ViewProcessEvent::CycleExecutionFailed {
                        options,
                        error: e.to_string(),
                    });
                }
            }

            if self.options.execution_sequence.is_empty() {
                info!(process = %self.id, "Execution sequence completed");
                self.publish(ViewProcessEvent::ProcessCompleted);
                break false;
            }
        };

        self.release_market_data();
        if let Some(mut previous) = self.previous.take() {
            let _ = previous.unlock();
        }
        self.control.terminate();
        self.publish(ViewProcessEvent::ProcessTerminated { interrupted });
        info!(process = %self.id, "View process worker shutting down");
    }

    fn abandon_cycle(&mut self, at: Instant) {
        self.triggers.cycle_abandoned(at);
        self.expiry.cycle_abandoned(at);
    }

    /// Block until a cycle may run, or return `None` once terminated.
    async fn wait_for_next_cycle(&mut self) -> Option<CycleDue> {
        loop {
            let state = *self.state_rx.borrow_and_update();
            match state {
                ProcessState::Terminated => return None,
                ProcessState::Paused => {
                    if self.state_rx.changed().await.is_err() {
                        return None;
                    }
                    continue;
                }
                _ => {}
            }

            let now = Instant::now();
            let result = self.triggers.query(now).combine(self.expiry.query(now));
            let forced = self.control.force_cycle.load(Ordering::SeqCst);
            let requested = self.control.cycle_requested.load(Ordering::SeqCst);
            let go = forced
                || match result.eligibility {
                    Eligibility::Force => true,
                    Eligibility::Eligible => requested,
                    Eligibility::Ineligible => false,
                };

            if go {
                self.control.force_cycle.store(false, Ordering::SeqCst);
                self.control.cycle_requested.store(false, Ordering::SeqCst);
                debug!(process = %self.id, hint = ?result.cycle_type, forced, "Eligible for cycle");
                return Some(CycleDue {
                    at: now,
                    hint: result.cycle_type,
                });
            }

            let wake = tokio::select! {
                _ = self.control.wake.notified() => Wake::Notified,
                _ = sleep_until_opt(result.next_state_change) => Wake::Timer,
                event = next_live_event(&mut self.live_rx) => Wake::Live(event),
                _ = self.state_rx.changed() => Wake::StateChanged,
            };
            self.on_wake(wake);
        }
    }

    fn on_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Live(Some(event)) => self.on_live_event(event),
            Wake::Live(None) => {
                debug!(process = %self.id, "Live data channel closed");
                self.live_rx = None;
            }
            Wake::Notified | Wake::Timer | Wake::StateChanged => {}
        }
    }

    fn on_live_event(&mut self, event: LiveDataEvent) {
        match event {
            LiveDataEvent::SubscriptionSucceeded { requirement } => {
                self.pending.remove(&requirement);
            }
            LiveDataEvent::SubscriptionFailed { requirement, reason } => {
                warn!(process = %self.id, requirement = %requirement, reason = %reason, "Market data subscription failed");
                self.pending.remove(&requirement);
                self.subscribed.remove(&requirement);
            }
            LiveDataEvent::SubscriptionStopped { requirement } => {
                self.pending.remove(&requirement);
                self.subscribed.remove(&requirement);
            }
            LiveDataEvent::ValueChanged { requirement } => {
                let used = self
                    .compiled
                    .as_ref()
                    .is_some_and(|view| view.requires(&requirement));
                if used && self.flag(ExecutionFlag::TriggerOnMarketDataChange) {
                    self.control.cycle_requested.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn drain_live_events(&mut self) {
        let mut drained = Vec::new();
        if let Some(rx) = self.live_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                drained.push(event);
            }
        }
        for event in drained {
            self.on_live_event(event);
        }
    }

    /// Run one cycle. Returns the type of the executed cycle, or `None` when
    /// the cycle only compiled.
    async fn run_cycle(
        &mut self,
        mut options: CycleExecutionOptions,
        hint: Option<CycleType>,
    ) -> EngineResult<Option<CycleType>> {
        if let Some(id) = &self.options.market_data_snapshot_id {
            options.market_data_specs = vec![MarketDataSpecification::user_snapshot(id.clone())];
        }
        if options.market_data_specs.is_empty() {
            return Err(EngineError::CycleExecution(
                "no market data specifications for cycle".into(),
            ));
        }

        let replaced = self.ensure_market_data(&options.market_data_specs)?;

        let compile_time = options.valuation_time.unwrap_or_else(|| self.clock.now());
        let needs_compile = !self.compilation_valid
            || self
                .compiled
                .as_ref()
                .map_or(true, |view| !view.is_valid_at(compile_time));
        if needs_compile {
            self.compile(compile_time).await?;
        }
        self.update_subscriptions();

        if self.flag(ExecutionFlag::AwaitMarketData) {
            self.await_market_data().await?;
        }

        if self.flag(ExecutionFlag::CompileOnly) {
            debug!(process = %self.id, "Compile only, cycle not executed");
            return Ok(None);
        }

        let provider = self
            .market_data
            .as_ref()
            .map(|md| md.provider.clone())
            .ok_or_else(|| EngineError::Internal("no market data provider".into()))?;
        let lease = SnapshotLease::take(provider.clone())?;

        let valuation_time = options
            .valuation_time
            .or_else(|| provider.snapshot_time(lease.id))
            .unwrap_or_else(|| self.clock.now());

        let full = self.previous.is_none()
            || replaced
            || self.flag(ExecutionFlag::Batch)
            || hint == Some(CycleType::Full);
        let cycle_type = if full { CycleType::Full } else { CycleType::Delta };

        let view = self
            .compiled
            .clone()
            .ok_or_else(|| EngineError::Internal("view not compiled".into()))?;
        let mut cycle = SingleComputationCycle::new(
            self.id,
            view,
            valuation_time,
            cycle_type,
            &self.cache_source,
        );
        self.publish(ViewProcessEvent::CycleStarted {
            cycle_id: cycle.id(),
            valuation_time,
            cycle_type,
        });

        let control = self.control.clone();
        let cancelled = move || control.is_terminated();
        let ctx = CycleContext {
            provider: provider.as_ref(),
            snapshot: lease.id,
            functions: &self.functions,
            suppress_without_market_data: self.flag(ExecutionFlag::Batch),
            cancelled: &cancelled,
        };
        let previous = self.previous.as_ref().map(|r| r.get()).transpose()?;
        let executed = cycle.execute(previous.map(|c| &**c), &ctx);
        drop(lease);
        if let Err(e) = executed {
            self.cache_source.release_caches(cycle.id());
            return Err(e);
        }
        if self.is_terminated() {
            self.cache_source.release_caches(cycle.id());
            return Err(EngineError::Shutdown);
        }

        let full_result = Arc::new(cycle.to_result());
        let delta = Arc::new(ViewDeltaResult::between(
            &full_result,
            self.previous_result.as_deref(),
        ));
        self.record_cycle(&cycle);
        self.publish(ViewProcessEvent::CycleCompleted {
            full: full_result.clone(),
            delta,
        });
        self.previous_result = Some(full_result);

        // The previous cycle is only released once the new one has read it
        let reference = CycleReference::new(Arc::new(cycle), self.cache_source.clone());
        if let Some(mut old) = self.previous.replace(reference) {
            old.unlock()?;
        }
        Ok(Some(cycle_type))
    }

    fn record_cycle(&self, cycle: &SingleComputationCycle) {
        let mut stats = self.control.stats.write();
        stats.cycles_completed += 1;
        stats.last_duration = Some(cycle.duration());
        stats.total_duration += cycle.duration();
        info!(
            process = %self.id,
            cycle = %cycle.id(),
            cycle_type = %cycle.cycle_type(),
            duration_ms = cycle.duration().as_millis() as u64,
            average_ms = stats.average_duration().map_or(0, |d| d.as_millis() as u64),
            cycles = stats.cycles_completed,
            "Cycle completed"
        );
    }

    /// Resolve a provider for `specs` unless the current one already serves
    /// them. Returns true if the provider was replaced.
    fn ensure_market_data(&mut self, specs: &[MarketDataSpecification]) -> EngineResult<bool> {
        if let Some(current) = &self.market_data {
            if current.specs == specs {
                return Ok(false);
            }
        }

        let mut providers = specs
            .iter()
            .map(|spec| {
                self.resolver
                    .resolve(spec)
                    .map_err(|e| EngineError::MarketDataError(format!("{}: {}", spec, e)))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        let provider: Arc<dyn LiveDataProvider> = if providers.len() == 1 {
            providers.remove(0)
        } else {
            Arc::new(PrioritizedLiveDataProvider::new(providers))
        };

        let replacing = self.market_data.is_some();
        if replacing {
            info!(process = %self.id, "Replacing market data provider between cycles");
        }
        self.release_market_data();

        let (tx, rx) = mpsc::unbounded_channel();
        provider.add_listener(tx);
        self.live_rx = Some(rx);
        debug!(process = %self.id, provider = provider.name(), "Market data provider attached");
        self.market_data = Some(MarketDataSource {
            specs: specs.to_vec(),
            provider,
        });
        Ok(replacing)
    }

    fn release_market_data(&mut self) {
        if let Some(current) = self.market_data.take() {
            current.provider.unsubscribe_all(&self.user);
        }
        self.live_rx = None;
        self.subscribed.clear();
        self.pending.clear();
    }

    async fn compile(&mut self, valuation_time: DateTime<Utc>) -> EngineResult<()> {
        let view = match self.compiler.compile(valuation_time).await {
            Ok(view) => view,
            Err(e) => {
                self.publish(ViewProcessEvent::ViewDefinitionCompilationFailed {
                    valuation_time,
                    error: e.to_string(),
                });
                return Err(EngineError::Compilation(e.to_string()));
            }
        };

        match view.valid_to {
            Some(valid_to) => {
                let remaining = (valid_to - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                self.expiry.set(Instant::now() + remaining);
            }
            None => self.expiry.clear(),
        }

        let requirements = view.market_data_requirements();
        info!(
            process = %self.id,
            view = %self.view_name,
            graphs = view.graphs.len(),
            requirements = requirements.len(),
            "View compiled"
        );
        self.publish(ViewProcessEvent::ViewDefinitionCompiled {
            view_name: view.view_name.clone(),
            valuation_time,
            graph_count: view.graphs.len(),
            market_data_requirements: requirements,
        });
        self.compiled = Some(Arc::new(view));
        self.compilation_valid = true;
        Ok(())
    }

    /// Subscribe to requirements of the compiled view not yet subscribed.
    fn update_subscriptions(&mut self) {
        let (Some(view), Some(md)) = (&self.compiled, &self.market_data) else {
            return;
        };
        let missing: Vec<ValueRequirement> = view
            .market_data_requirements()
            .into_iter()
            .filter(|r| !self.subscribed.contains(r))
            .collect();
        if missing.is_empty() {
            return;
        }
        debug!(process = %self.id, count = missing.len(), "Subscribing to market data");
        self.pending.extend(missing.iter().cloned());
        self.subscribed.extend(missing.iter().cloned());
        md.provider.subscribe(&self.user, &missing);
        self.drain_live_events();
    }

    /// Wait until every subscription has an outcome, bounded by the market
    /// data timeout.
    async fn await_market_data(&mut self) -> EngineResult<()> {
        let deadline = Instant::now() + self.config.market_data_timeout();
        while !self.pending.is_empty() {
            let wake = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Wake::Timer,
                event = next_live_event(&mut self.live_rx) => Wake::Live(event),
                _ = self.state_rx.changed() => Wake::StateChanged,
            };
            match wake {
                Wake::Timer => {
                    warn!(process = %self.id, pending = self.pending.len(), "Timed out waiting for market data subscriptions");
                    break;
                }
                Wake::StateChanged if self.is_terminated() => return Err(EngineError::Shutdown),
                other => self.on_wake(other),
            }
        }
        Ok(())
    }
}
