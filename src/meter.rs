use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use embedded_io::{Read, ReadReady, Write};
use fugit::MillisDurationU32;
use log::{debug, info};

use crate::{
    clock::{Clock, Instant, after},
    config::MeterConfig,
    engine::{Bus, CancelToken, Transaction, TransactionEngine, sleep_until},
    error::{ConfigError, Result, TransactionError},
    registers::{self, MeasurementRequest},
    registry::{ObserverId, ObserverRegistry, Reading},
    scheduler::{PollPlan, PollReport, PollScheduler},
};

/// How long [`Pzem6l24::run`] waits before trying again when it could not tell when the next
/// cycle is due.
const IDLE_RETRY: MillisDurationU32 = MillisDurationU32::from_ticks(10);

/// You can create a Pzem6l24 using any interface which implements [embedded_io::Read],
/// [embedded_io::Write] & [embedded_io::ReadReady].
///
/// The client polls the configured measurements on a fixed interval and hands every decoded value
/// to the observers subscribed to it. All methods take `&self`, so one client can be shared
/// between a thread running [`run`](Self::run) and threads subscribing or reading on demand.
pub struct Pzem6l24<S, C> {
    config: MeterConfig,
    engine: Mutex<TransactionEngine<S, C>>,
    scheduler: Mutex<PollScheduler>,
    registry: ObserverRegistry,
    clock: C,
    cancel: CancelToken,
}

impl<S, C> Pzem6l24<S, C>
where
    S: Read + Write + ReadReady,
    C: Clock + Clone,
{
    /// Create a client for the meter described by `config`.
    ///
    /// No I/O happens until the first poll or read.
    pub fn new(stream: S, clock: C, config: MeterConfig) -> Result<Self> {
        let plan = PollPlan::build(config.requests())?;
        let cancel = CancelToken::new();
        let engine = TransactionEngine::new(stream, clock.clone(), *config.retry(), cancel.clone());
        let scheduler = PollScheduler::new(plan, config.address().get(), config.poll_interval());

        Ok(Self {
            config,
            engine: Mutex::new(engine),
            scheduler: Mutex::new(scheduler),
            registry: ObserverRegistry::new(),
            clock,
            cancel,
        })
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Token that stops [`run`](Self::run) and any transaction in flight.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Call `callback` with every new value of `request`.
    ///
    /// Only polled measurements can be subscribed to. Callbacks run on the polling thread and may
    /// unsubscribe, including themselves.
    pub fn subscribe(
        &self,
        request: MeasurementRequest,
        callback: impl FnMut(&Reading) + Send + 'static,
    ) -> Result<ObserverId> {
        registers::lookup(request)?;
        if !self.config.polls(request) {
            return Err(ConfigError::NotPolled(request).into());
        }
        Ok(self.registry.register(request, callback))
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.registry.unregister(id)
    }

    /// The most recent polled value of `request`, if any cycle has produced one.
    pub fn latest(&self, request: MeasurementRequest) -> Option<Reading> {
        self.registry.latest(request)
    }

    /// Run one poll cycle now, whether or not it is due.
    pub fn poll(&self) -> PollReport {
        self.scheduler()
            .poll(&self.engine, &self.registry, &self.clock)
    }

    /// Run a poll cycle if one is due.
    ///
    /// Returns `None` if nothing was due, or if another thread is in the middle of a cycle.
    pub fn tick(&self) -> Option<PollReport> {
        let mut scheduler = match self.scheduler.try_lock() {
            Ok(scheduler) => scheduler,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Poll cycle still running, skipping tick");
                return None;
            }
        };
        scheduler.tick(&self.engine, &self.registry, &self.clock)
    }

    /// Poll on the configured interval until cancelled through
    /// [`cancel_token`](Self::cancel_token).
    pub fn run(&self) {
        info!(
            "Polling meter {} every {} ms",
            self.config.address(),
            self.config.poll_interval().ticks()
        );
        while !self.cancel.is_cancelled() {
            self.tick();
            let due = self
                .next_due()
                .unwrap_or_else(|| after(self.clock.now(), IDLE_RETRY));
            if !sleep_until(&self.clock, due, &self.cancel) {
                break;
            }
        }
        info!("Stopped polling meter {}", self.config.address());
    }

    /// Read one measurement straight from the meter, outside the poll cycle.
    ///
    /// The measurement does not need to be part of the configuration. The value is returned
    /// without being cached or passed to observers. A poll cycle in progress finishes its current
    /// transaction first.
    pub fn read(&self, request: MeasurementRequest) -> Result<f64> {
        let spec = registers::lookup(request)?;
        if spec.count == 0 {
            return Ok(spec.decode(&[]));
        }

        let mut transaction =
            Transaction::read_input_registers(self.config.address().get(), spec.start, spec.count)
                .map_err(TransactionError::from)?;
        let words = self.engine.execute(&mut transaction)?;
        Ok(spec.decode(&words))
    }

    /// Log the configuration and the resulting poll plan.
    pub fn log_config(&self) {
        let retry = self.config.retry();
        info!("PZEM-6L24:");
        info!("  Address: {}", self.config.address());
        info!("  Poll interval: {} ms", self.config.poll_interval().ticks());
        info!(
            "  Retries: {} attempts, {} ms timeout, {} ms backoff",
            retry.attempts,
            retry.timeout.ticks(),
            retry.backoff.ticks()
        );
        for request in self.config.requests() {
            info!("  Measurement: {}", request);
        }
        let scheduler = self.scheduler();
        for batch in scheduler.plan().batches() {
            info!(
                "  Read: {} registers at 0x{:04X}",
                batch.count(),
                batch.start()
            );
        }
    }

    fn next_due(&self) -> Option<Instant> {
        match self.scheduler.try_lock() {
            Ok(scheduler) => scheduler.next_due(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().next_due(),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn scheduler(&self) -> MutexGuard<'_, PollScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S, C> Pzem6l24<S, C>
where
    S: Read + Write + ReadReady,
    C: Clock,
{
    /// Give the byte stream back.
    pub fn into_inner(self) -> S {
        self.engine
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_inner()
    }
}
