//! Periodic polling of the configured measurements.
//!
//! The measurements are resolved to registers once, when the [`PollPlan`] is built. Adjacent and
//! overlapping register ranges share one read, so every cycle issues as few transactions as the
//! register layout allows.

use core::cmp::max;

use fugit::MillisDurationU32;
use log::{debug, error, warn};

use crate::clock::{Clock, Instant, after};
use crate::codec::{MAX_READ_QUANTITY, RegisterWords};
use crate::engine::{Bus, Transaction};
use crate::error::{ConfigError, TransactionError};
use crate::registers::{self, MeasurementRequest, RegisterSpec};
use crate::registry::{ObserverRegistry, Reading};

/// A contiguous register range read in one transaction, and the measurements decoded from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    start: u16,
    count: u16,
    members: Vec<(MeasurementRequest, RegisterSpec)>,
}

impl Batch {
    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn members(&self) -> &[(MeasurementRequest, RegisterSpec)] {
        &self.members
    }

    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    /// The words belonging to `spec`, out of those read for this whole batch.
    fn words_for<'w>(&self, spec: &RegisterSpec, words: &'w [u16]) -> &'w [u16] {
        let offset = usize::from(spec.start - self.start);
        words.get(offset..).unwrap_or(&[])
    }
}

/// The transactions one poll cycle performs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollPlan {
    batches: Vec<Batch>,
    /// Measurements that need no registers.
    constants: Vec<(MeasurementRequest, RegisterSpec)>,
}

impl PollPlan {
    /// Resolve `requests` against the register map and coalesce them.
    pub fn build(requests: &[MeasurementRequest]) -> Result<Self, ConfigError> {
        let specs = requests
            .iter()
            .map(|request| Ok((*request, registers::lookup(*request)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self::coalesce(specs))
    }

    /// Merge register ranges that touch or overlap, as long as the merged read stays within the
    /// Modbus quantity limit.
    pub fn coalesce(specs: impl IntoIterator<Item = (MeasurementRequest, RegisterSpec)>) -> Self {
        let (mut ranged, constants): (Vec<_>, Vec<_>) =
            specs.into_iter().partition(|(_, spec)| spec.count > 0);
        ranged.sort_by_key(|(_, spec)| (spec.start, spec.count));

        let mut batches: Vec<Batch> = Vec::new();
        for (request, spec) in ranged {
            if let Some(batch) = batches.last_mut() {
                let merged_end = max(batch.end(), spec.end());
                if u32::from(spec.start) <= batch.end()
                    && merged_end - u32::from(batch.start) <= u32::from(MAX_READ_QUANTITY)
                {
                    batch.count = (merged_end - u32::from(batch.start)) as u16;
                    batch.members.push((request, spec));
                    continue;
                }
            }
            batches.push(Batch {
                start: spec.start,
                count: spec.count,
                members: vec![(request, spec)],
            });
        }

        Self { batches, constants }
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn transaction_count(&self) -> usize {
        self.batches.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub cycle: u64,
    pub transactions: usize,
    pub failed_transactions: usize,
    pub published: usize,
    /// Measurements with no fresh value this cycle.
    pub unavailable: Vec<MeasurementRequest>,
}

/// Runs a [`PollPlan`] on a fixed period.
#[derive(Debug)]
pub struct PollScheduler {
    plan: PollPlan,
    address: u8,
    interval: MillisDurationU32,
    state: PollState,
    next_due: Option<Instant>,
    cycle: u64,
    skipped_ticks: u64,
}

impl PollScheduler {
    pub fn new(plan: PollPlan, address: u8, interval: MillisDurationU32) -> Self {
        Self {
            plan,
            address,
            interval,
            state: PollState::Idle,
            next_due: None,
            cycle: 0,
            skipped_ticks: 0,
        }
    }

    pub fn plan(&self) -> &PollPlan {
        &self.plan
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// When the next cycle should start. `None` until the first cycle has run.
    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Number of cycles started so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Ticks dropped because a cycle was still running when they came due.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due.is_none_or(|due| now >= due)
    }

    /// Poll if a cycle is due, then schedule the next one.
    pub fn tick<B: Bus, C: Clock>(
        &mut self,
        bus: &B,
        registry: &ObserverRegistry,
        clock: &C,
    ) -> Option<PollReport> {
        let started = clock.now();
        if !self.is_due(started) {
            return None;
        }

        let report = self.poll(bus, registry, clock);
        self.schedule_next(started, clock.now());
        Some(report)
    }

    /// Run one cycle now, regardless of the schedule.
    ///
    /// Batches run one after another. A failed batch only costs the measurements it covers.
    pub fn poll<B: Bus, C: Clock>(
        &mut self,
        bus: &B,
        registry: &ObserverRegistry,
        clock: &C,
    ) -> PollReport {
        self.state = PollState::Polling;
        self.cycle += 1;
        let mut report = PollReport {
            cycle: self.cycle,
            ..Default::default()
        };

        let timestamp = clock.now();
        for (request, spec) in &self.plan.constants {
            self.publish(registry, &mut report, *request, spec.decode(&[]), timestamp);
        }

        let mut batches = self.plan.batches.iter();
        for batch in batches.by_ref() {
            report.transactions += 1;
            match execute_batch(self.address, batch, bus) {
                Ok(words) => {
                    let timestamp = clock.now();
                    for (request, spec) in &batch.members {
                        let value = spec.decode(batch.words_for(spec, &words));
                        self.publish(registry, &mut report, *request, value, timestamp);
                    }
                }
                Err(TransactionError::Cancelled) => {
                    debug!("Poll cycle {} cancelled", self.cycle);
                    report.failed_transactions += 1;
                    mark_unavailable(&mut report, batch);
                    break;
                }
                Err(err) => {
                    if err == TransactionError::BusBusy {
                        error!(
                            "Bus busy during poll cycle {}, transactions are not serialized",
                            self.cycle
                        );
                    } else {
                        warn!(
                            "Reading {} registers at 0x{:04X} failed: {}",
                            batch.count, batch.start, err
                        );
                    }
                    report.failed_transactions += 1;
                    mark_unavailable(&mut report, batch);
                }
            }
        }
        // Anything left over was skipped by a cancellation.
        for batch in batches {
            mark_unavailable(&mut report, batch);
        }

        self.state = PollState::Idle;
        debug!(
            "Poll cycle {}: {} published, {} of {} transactions failed",
            report.cycle, report.published, report.failed_transactions, report.transactions
        );
        report
    }

    fn publish(
        &self,
        registry: &ObserverRegistry,
        report: &mut PollReport,
        request: MeasurementRequest,
        value: f64,
        timestamp: Instant,
    ) {
        if value.is_nan() {
            report.unavailable.push(request);
            return;
        }
        registry.publish(Reading {
            request,
            value,
            sequence: self.cycle,
            timestamp,
        });
        report.published += 1;
    }

    /// Next cycle is one interval after this one started. Ticks that came due while the cycle
    /// was still running are dropped rather than run back to back.
    fn schedule_next(&mut self, started: Instant, finished: Instant) {
        let mut due = after(started, self.interval);
        let mut skipped = 0;
        while due < finished {
            due = after(due, self.interval);
            skipped += 1;
        }
        if skipped > 0 {
            warn!(
                "Poll cycle {} overran the {} ms interval, skipping {} tick(s)",
                self.cycle,
                self.interval.ticks(),
                skipped
            );
            self.skipped_ticks += skipped;
        }
        self.next_due = Some(due);
    }
}

fn execute_batch<B: Bus>(
    address: u8,
    batch: &Batch,
    bus: &B,
) -> Result<RegisterWords, TransactionError> {
    let mut transaction = Transaction::read_input_registers(address, batch.start, batch.count)?;
    bus.execute(&mut transaction)
}

fn mark_unavailable(report: &mut PollReport, batch: &Batch) {
    report
        .unavailable
        .extend(batch.members.iter().map(|(request, _)| *request));
}
