// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of migrator.
//
// migrator is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// migrator is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with migrator.  If not,
// see <http://www.gnu.org/licenses/>.

//! # validator
//!
//! Scan a *base* store & a *target* store & report every discrepancy between them as an
//! [InconsistentEvent].
//!
//! A [Validator] runs two passes concurrently:
//!
//! - base to target: read a batch of base rows, look up the same IDs in the target, and report
//!   rows that are absent from the target or that differ
//! - target to base: read a batch of target rows, ask the base which of those IDs it has, and
//!   report the ones it doesn't
//!
//! A *full* validation scans the base ordered by ID from the start; an *incremental* one scans only
//! rows updated strictly after a watermark, ordered by update time. Either can run once over the
//! data (a zero sleep interval) or tail it, sleeping between exhausted scans until cancelled.
//!
//! Reads are bounded by a per-batch deadline. A failed or stalled read is logged & retried after
//! an exponential backoff; the scan only gives up on errors that retrying can't fix.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::{StreamExt, stream};
use itertools::Itertools;
use opentelemetry::KeyValue;
use snafu::{Backtrace, prelude::*};
use tokio_util::sync::CancellationToken;
use tower::{
    retry::backoff::{Backoff, ExponentialBackoffMaker, InvalidBackoff, MakeBackoff},
    util::rng::HasherRng,
};
use tracing::{debug, error, info, warn};

use crate::{
    counter_add,
    entities::Entity,
    events::{self, Direction, EventType, InconsistentEvent, Producer},
    metrics::{self, Instruments, Sort},
    store::{self, Store, TimeoutSnafu},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid backoff parameters: {source}"))]
    Backoff {
        source: InvalidBackoff,
        backtrace: Backtrace,
    },
    #[snafu(display("The batch size must be positive"))]
    BatchSize { backtrace: Backtrace },
    #[snafu(display("Unrecoverable error reading {store}: {source}"))]
    Read { store: String, source: store::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("validator.batches", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("validator.read.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("validator.events.emitted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("validator.publish.failures", Sort::IntegralCounter) }

/// Which rows of the base store a validation considers
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Every row, ordered by ID
    Full,
    /// Rows updated after the watermark, ordered by update time
    Incremental,
}

/// Bounds on the delay between retries of a failed read
#[derive(Clone, Copy, Debug)]
pub struct BackoffParameters {
    pub min: Duration,
    pub max: Duration,
    /// Percentage of each delay to randomize, in [0, 100]
    pub jitter: f64,
}

impl Default for BackoffParameters {
    fn default() -> Self {
        BackoffParameters {
            min: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 10.0,
        }
    }
}

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Events from one batch published at once
const MAX_CONCURRENT_PUBLISHES: usize = 16;

/// Bidirectional consistency checker between two stores of `T`
///
/// Build one with [new](Validator::new) & the builder-style setters, then call
/// [validate](Validator::validate).
pub struct Validator<T: Entity> {
    base: Arc<dyn Store<T>>,
    target: Arc<dyn Store<T>>,
    producer: Arc<dyn Producer>,
    direction: Direction,
    mode: Mode,
    utime: i64,
    sleep_interval: Duration,
    batch_size: usize,
    batch_timeout: Duration,
    publish_timeout: Duration,
    backoff: BackoffParameters,
    instruments: Arc<Instruments>,
}

/// The outcome of one deadline- & cancellation-bounded read
enum Step<R> {
    Cancelled,
    Read(store::Result<R>),
}

impl<T: Entity> Validator<T> {
    /// A full, run-once validation of `target` against `base`; events are tagged with `direction`
    pub fn new(
        base: Arc<dyn Store<T>>,
        target: Arc<dyn Store<T>>,
        producer: Arc<dyn Producer>,
        direction: Direction,
        instruments: Arc<Instruments>,
    ) -> Validator<T> {
        Validator {
            base,
            target,
            producer,
            direction,
            mode: Mode::Full,
            utime: 0,
            sleep_interval: Duration::ZERO,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            backoff: BackoffParameters::default(),
            instruments,
        }
    }
    pub fn full(mut self) -> Self {
        self.mode = Mode::Full;
        self
    }
    pub fn incr(mut self) -> Self {
        self.mode = Mode::Incremental;
        self
    }
    /// Set the incremental watermark; only rows updated strictly after it are scanned
    pub fn utime(mut self, utime: i64) -> Self {
        self.utime = utime;
        self
    }
    /// How long to sleep once the data is exhausted; zero means "stop"
    pub fn sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
    pub fn backoff(mut self, backoff: BackoffParameters) -> Self {
        self.backoff = backoff;
        self
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Run both passes until each is exhausted (or, when tailing, until `token` is cancelled)
    ///
    /// Cancellation isn't an error. An unrecoverable error in either pass abandons the other.
    #[tracing::instrument(skip_all, fields(direction = %self.direction, mode = ?self.mode))]
    pub async fn validate(&self, token: CancellationToken) -> Result<()> {
        ensure!(self.batch_size > 0, BatchSizeSnafu);
        let maker = ExponentialBackoffMaker::new(
            self.backoff.min,
            self.backoff.max,
            self.backoff.jitter,
            HasherRng::new(),
        )
        .context(BackoffSnafu)?;
        info!("Validation starting");
        tokio::try_join!(
            self.base_to_target(&token, maker.clone()),
            self.target_to_base(&token, maker)
        )?;
        info!("Validation complete");
        Ok(())
    }

    /// Await `read`, unless `token` is cancelled first or the batch deadline passes
    async fn read<R>(
        &self,
        token: &CancellationToken,
        store: &str,
        read: impl Future<Output = store::Result<R>>,
    ) -> Step<R> {
        tokio::select! {
            _ = token.cancelled() => Step::Cancelled,
            result = tokio::time::timeout(self.batch_timeout, read) => Step::Read(match result {
                Ok(result) => result,
                Err(_) => TimeoutSnafu { store, elapsed: self.batch_timeout }.fail(),
            }),
        }
    }

    /// Sleep for `duration`; false if `token` was cancelled in the meantime
    async fn pause(token: &CancellationToken, duration: impl Future<Output = ()>) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = duration => true,
        }
    }

    /// Classify a failed read: Ok(()) to back off & retry, Err to give up
    fn on_read_failure(&self, pass: &'static str, store: &str, err: store::Error) -> Result<()> {
        counter_add!(
            self.instruments,
            "validator.read.failures",
            1,
            &[KeyValue::new("pass", pass)]
        );
        if err.is_transient() {
            warn!(pass, store, "Read failed; backing off: {}", err);
            Ok(())
        } else {
            error!(pass, store, "Read failed: {}", err);
            Err(err).context(ReadSnafu { store })
        }
    }

    async fn from_base(&self, offset: usize) -> store::Result<Vec<T>> {
        match self.mode {
            Mode::Full => self.base.find_ordered_by_id(offset, self.batch_size).await,
            Mode::Incremental => {
                self.base
                    .find_updated_since(self.utime, offset, self.batch_size)
                    .await
            }
        }
    }

    async fn base_to_target(
        &self,
        token: &CancellationToken,
        mut maker: ExponentialBackoffMaker<HasherRng>,
    ) -> Result<()> {
        let mut backoff = maker.make_backoff();
        let mut offset = 0usize;
        loop {
            let bases = match self.read(token, self.base.name(), self.from_base(offset)).await {
                Step::Cancelled => return Ok(()),
                Step::Read(Ok(bases)) => bases,
                Step::Read(Err(err)) => {
                    self.on_read_failure("base-to-target", self.base.name(), err)?;
                    if !Self::pause(token, backoff.next_backoff()).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff = maker.make_backoff();

            if bases.is_empty() {
                if self.sleep_interval.is_zero() {
                    debug!("Base exhausted at offset {}", offset);
                    return Ok(());
                }
                if !Self::pause(token, tokio::time::sleep(self.sleep_interval)).await {
                    return Ok(());
                }
                continue;
            }

            let ids = bases.iter().map(Entity::id).collect::<Vec<_>>();
            match self
                .read(token, self.target.name(), self.target.find_by_ids(&ids))
                .await
            {
                Step::Cancelled => return Ok(()),
                Step::Read(Ok(targets)) if targets.is_empty() => {
                    self.notify_all(&ids, EventType::TargetMissing).await
                }
                Step::Read(Ok(targets)) => {
                    let targets = targets
                        .into_iter()
                        .map(|t| (t.id(), t))
                        .collect::<HashMap<_, _>>();
                    let drifted = bases
                        .iter()
                        .filter(|base| {
                            targets
                                .get(&base.id())
                                .is_none_or(|target| !base.compare_to(target))
                        })
                        .map(Entity::id)
                        .collect::<Vec<_>>();
                    self.notify_all(&drifted, EventType::Neq).await
                }
                Step::Read(Err(err)) => {
                    // This batch goes unchecked; the next pass will catch anything it hid
                    self.on_read_failure("base-to-target", self.target.name(), err)?;
                }
            }
            counter_add!(
                self.instruments,
                "validator.batches",
                1,
                &[KeyValue::new("pass", "base-to-target")]
            );
            offset += bases.len();
        }
    }

    async fn target_to_base(
        &self,
        token: &CancellationToken,
        mut maker: ExponentialBackoffMaker<HasherRng>,
    ) -> Result<()> {
        let mut backoff = maker.make_backoff();
        let mut offset = 0usize;
        loop {
            let targets = match self
                .read(
                    token,
                    self.target.name(),
                    self.target.find_ordered_by_id(offset, self.batch_size),
                )
                .await
            {
                Step::Cancelled => return Ok(()),
                Step::Read(Ok(targets)) => targets,
                Step::Read(Err(err)) => {
                    self.on_read_failure("target-to-base", self.target.name(), err)?;
                    if !Self::pause(token, backoff.next_backoff()).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            backoff = maker.make_backoff();

            if targets.is_empty() {
                if self.sleep_interval.is_zero() {
                    debug!("Target exhausted at offset {}", offset);
                    return Ok(());
                }
                if !Self::pause(token, tokio::time::sleep(self.sleep_interval)).await {
                    return Ok(());
                }
                continue;
            }

            let ids = targets.iter().map(Entity::id).collect::<Vec<_>>();
            match self
                .read(token, self.base.name(), self.base.find_ids(&ids))
                .await
            {
                Step::Cancelled => return Ok(()),
                Step::Read(Ok(present)) => {
                    let missing = ids
                        .iter()
                        .filter(|id| !present.contains(id))
                        .copied()
                        .collect::<Vec<_>>();
                    self.notify_all(&missing, EventType::BaseMissing).await
                }
                Step::Read(Err(err)) => {
                    self.on_read_failure("target-to-base", self.base.name(), err)?;
                }
            }
            counter_add!(
                self.instruments,
                "validator.batches",
                1,
                &[KeyValue::new("pass", "target-to-base")]
            );
            offset += targets.len();
        }
    }

    async fn notify_all(&self, ids: &[i64], kind: EventType) {
        if !ids.is_empty() {
            debug!(%kind, "Inconsistent IDs: {}", ids.iter().join(", "));
        }
        stream::iter(ids)
            .for_each_concurrent(MAX_CONCURRENT_PUBLISHES, |id| self.notify(*id, kind))
            .await;
    }

    /// Publish one event; failures are logged, never propagated
    async fn notify(&self, id: i64, kind: EventType) {
        let event = InconsistentEvent::new(id, self.direction, kind);
        let result = match tokio::time::timeout(self.publish_timeout, self.producer.produce(&event))
            .await
        {
            Ok(result) => result,
            Err(_) => events::PublishTimeoutSnafu {
                id,
                elapsed: self.publish_timeout,
            }
            .fail(),
        };
        match result {
            Ok(()) => {
                counter_add!(
                    self.instruments,
                    "validator.events.emitted",
                    1,
                    &[KeyValue::new("type", kind.as_str())]
                );
            }
            Err(err) => {
                error!(id, direction = %self.direction, kind = %kind, "Failed to publish: {}", err);
                counter_add!(self.instruments, "validator.publish.failures", 1, &[]);
            }
        }
    }
}
