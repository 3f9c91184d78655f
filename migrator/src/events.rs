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

//! # Inconsistency events
//!
//! The validator reports each discrepancy it finds between base & target as an
//! [InconsistentEvent]; the fixer consumes them & repairs the target. The two sides are decoupled
//! by a message bus: anything implementing [Producer] on the one side & [Receiver] on the other.
//! Two buses are provided: [MemoryBus](memory::MemoryBus), for single-process deployments & tests,
//! and [TableQueue](table::TableQueue), a durable queue living in a MySQL table.
//!
//! # Delivery
//!
//! Delivery is at-least-once. A consumer [take](Receiver::take)s a message along with a "cookie"
//! identifying it, hands it to a [Handler], and then either [ack](Receiver::ack)s it (the handler
//! succeeded) or [nack](Receiver::nack)s it (the handler failed or timed-out, so the message should
//! be redelivered, after a delay that grows with each failed attempt so that a dead store isn't
//! hammered). Handlers must therefore be idempotent, which repair naturally is. A message that
//! can't even be decoded will never succeed, so it is logged & acknowledged rather than redelivered
//! forever.
//!
//! [Processor] drives that loop in the background with bounded concurrency.

use std::{
    collections::HashMap, fmt::Display, future::Future, pin::Pin, sync::Arc, task::Poll,
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, prelude::*};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
    sql,
};

pub mod memory;
pub mod table;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Handler {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize an inconsistency event: {source}"))]
    De {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Event processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timed-out publishing event {id} after {elapsed:?}"))]
    #[snafu(visibility(pub(crate)))]
    PublishTimeout {
        id: i64,
        elapsed: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize an inconsistency event: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the event processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Event queue {queue}: {source}"))]
    Queue {
        queue: String,
        #[snafu(source(from(sql::Error, Box::new)))]
        source: Box<sql::Error>,
    },
    #[snafu(display("Tried to settle an unknown task"))]
    TaskId { backtrace: Backtrace },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Handler {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      InconsistentEvent                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Which store was the *base* (the source of truth) when an inconsistency was found
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Direction {
    #[serde(rename = "SRC")]
    Src,
    #[serde(rename = "DST")]
    Dst,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Src => "SRC",
            Direction::Dst => "DST",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Present in both, but different
    Neq,
    /// Present in base, absent from target
    TargetMissing,
    /// Present in target, absent from base
    BaseMissing,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Neq => "neq",
            EventType::TargetMissing => "target_missing",
            EventType::BaseMissing => "base_missing",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One detected discrepancy between base & target; serialized to JSON on the wire
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct InconsistentEvent {
    pub id: i64,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: EventType,
}

impl InconsistentEvent {
    pub fn new(id: i64, direction: Direction, kind: EventType) -> InconsistentEvent {
        InconsistentEvent {
            id,
            direction,
            kind,
        }
    }
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context(SerSnafu)
    }
    pub fn from_json(buf: &[u8]) -> Result<InconsistentEvent> {
        serde_json::from_slice(buf).context(DeSnafu)
    }
}

impl Display for InconsistentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.direction, self.kind, self.id)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 Producers, Receivers & Handlers                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Publish [InconsistentEvent]s to some bus
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, event: &InconsistentEvent) -> Result<()>;
}

/// Draw raw messages from some bus, then settle them
///
/// `take()` moves a serialized event out of the bus along with a cookie identifying it; the
/// message is invisible to other consumers until it's either acknowledged (gone for good) or
/// negatively-acknowledged (eligible for redelivery).
#[async_trait]
pub trait Receiver: Send + Sync {
    type Cookie: Send + 'static;
    async fn take(&self) -> Result<Option<(Vec<u8>, Self::Cookie)>>;
    async fn ack(&self, cookie: Self::Cookie) -> Result<()>;
    /// Release a message for redelivery no sooner than `redelivery` allows
    async fn nack(&self, cookie: Self::Cookie, redelivery: &Redelivery) -> Result<()>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<T: Receiver> Receiver for Arc<T> {
    type Cookie = T::Cookie;
    async fn take(&self) -> Result<Option<(Vec<u8>, Self::Cookie)>> {
        self.as_ref().take().await
    }
    async fn ack(&self, cookie: Self::Cookie) -> Result<()> {
        self.as_ref().ack(cookie).await
    }
    async fn nack(&self, cookie: Self::Cookie, redelivery: &Redelivery) -> Result<()> {
        self.as_ref().nack(cookie, redelivery).await
    }
}

/// How long to hold back a message that failed
///
/// The n-th failed delivery of a message is held back for `min * 2^(n-1)`, up to `max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Redelivery {
    pub min: Duration,
    pub max: Duration,
}

impl Redelivery {
    pub fn immediate() -> Redelivery {
        Redelivery {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }
    /// The delay following the failure of delivery number `attempts` (counting from one)
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(31));
        self.min.saturating_mul(factor).min(self.max)
    }
}

/// Something that can act on an [InconsistentEvent]
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: InconsistentEvent) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Processor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Processor] manages the ongoing consumption of inconsistency events. Await it to learn how
/// processing ended, or call `shutdown()` to stop it.
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the processing task to shut down & wait up to `timeout` for it to exit
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
}

/// Configuration parameters for consuming events
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Deadline for a single handler invocation; an event whose handler exceeds it is redelivered
    #[serde(rename = "handler-timeout")]
    pub handler_timeout: Duration,
    /// The maximum number of events to handle concurrently
    #[serde(rename = "max-concurrent-events")]
    pub max_concurrent_events: usize,
    /// Amount of time to sleep when the bus is empty
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight events on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight handlers without attempting to pick-up new events
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
    /// Delay before the first redelivery of a failed event; doubles with each further failure
    #[serde(rename = "retry-min")]
    pub retry_min: Duration,
    /// Upper bound on the redelivery delay
    #[serde(rename = "retry-max")]
    pub retry_max: Duration,
}

impl Config {
    pub fn redelivery(&self) -> Redelivery {
        Redelivery {
            min: self.retry_min,
            max: self.retry_max,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(1),
            max_concurrent_events: 16,
            sleep_duration: Duration::from_millis(250),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
            retry_min: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
        }
    }
}

inventory::submit! { metrics::Registration::new("events.consumer.completed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("events.consumer.redeliveries", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("events.consumer.poison", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("events.consumer.inflight", Sort::IntegralGauge) }

type Outcome = std::result::Result<Result<()>, tokio::time::error::Elapsed>;

/// Acknowledge or negatively-acknowledge one finished handler invocation
async fn settle<R: Receiver>(
    receiver: &R,
    inflight: &mut HashMap<Id, (InconsistentEvent, R::Cookie)>,
    joined: std::result::Result<(Id, Outcome), JoinError>,
    redelivery: &Redelivery,
    instruments: &Instruments,
) -> Result<()> {
    let (id, outcome) = match joined {
        Ok((id, outcome)) => (id, outcome),
        // A panicking handler is just one more failure; the event goes back on the bus
        Err(err) => {
            let id = err.id();
            (id, Ok(Err(JoinSnafu.into_error(err))))
        }
    };
    let (event, cookie) = inflight.remove(&id).context(TaskIdSnafu)?;
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{}", err)),
        Err(elapsed) => Some(format!("{}", elapsed)),
    };
    match failure {
        None => {
            debug!(id = event.id, direction = %event.direction, kind = %event.kind, "Event handled");
            if let Err(err) = receiver.ack(cookie).await {
                error!(id = event.id, direction = %event.direction, kind = %event.kind,
                       "Failed to acknowledge a handled event: {}", err);
            }
            counter_add!(instruments, "events.consumer.completed", 1, &[]);
        }
        Some(reason) => {
            error!(id = event.id, direction = %event.direction, kind = %event.kind,
                   "Failed to handle event ({}); releasing it for redelivery", reason);
            if let Err(err) = receiver.nack(cookie, redelivery).await {
                error!(id = event.id, direction = %event.direction, kind = %event.kind,
                       "Failed to release a failed event: {}", err);
            }
            counter_add!(
                instruments,
                "events.consumer.redeliveries",
                1,
                &[KeyValue::new("kind", event.kind.as_str())]
            );
        }
    }
    Ok(())
}

/// Consume events from `receiver`, handing each to `handler`, until `shutdown` is signalled
async fn process<R: Receiver>(
    receiver: R,
    handler: Arc<dyn Handler>,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let redelivery = config.redelivery();
    let mut inflight: HashMap<Id, (InconsistentEvent, R::Cookie)> = HashMap::new();
    let mut futures: JoinSet<Outcome> = JoinSet::new();
    let mut done = false;
    while !done {
        let mut took = false;
        if futures.len() < config.max_concurrent_events {
            match receiver.take().await {
                Ok(Some((buf, cookie))) => {
                    took = true;
                    match InconsistentEvent::from_json(&buf) {
                        Ok(event) => {
                            let handler = handler.clone();
                            let id = futures
                                .spawn(tokio::time::timeout(config.handler_timeout, async move {
                                    handler.handle(event).await
                                }))
                                .id();
                            inflight.insert(id, (event, cookie));
                        }
                        Err(err) => {
                            // Poison; redelivering it would never help
                            error!(
                                "Discarding an undecodable event ({}): {}",
                                err,
                                String::from_utf8_lossy(&buf)
                            );
                            counter_add!(instruments, "events.consumer.poison", 1, &[]);
                            if let Err(err) = receiver.ack(cookie).await {
                                error!("Failed to acknowledge an undecodable event: {}", err);
                            }
                        }
                    }
                }
                Ok(None) => (),
                Err(err) => warn!("Failed to take an event: {}", err),
            }
        }

        gauge_setu!(
            instruments,
            "events.consumer.inflight",
            futures.len() as u64,
            &[]
        );

        // There may be more where that came from; settle whatever's finished & go straight back
        // for the next one while there's room
        if took && futures.len() < config.max_concurrent_events {
            while let Some(joined) = futures.try_join_next_with_id() {
                settle(&receiver, &mut inflight, joined, &redelivery, &instruments).await?;
            }
            if shutdown.notified().now_or_never().is_some() {
                done = true;
            }
            continue;
        }

        if !futures.is_empty() {
            tokio::select! {
                result = futures.join_next_with_id() => {
                    if let Some(joined) = result {
                        settle(&receiver, &mut inflight, joined, &redelivery, &instruments).await?;
                    }
                },
                // Don't let one long-running handler keep us from picking-up new events
                _ = tokio::time::sleep(config.pickup_timeout), if !took => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        } else if !took {
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }
    }

    // Give any in-flight handlers a chance to complete
    info!("Event processor shutting down with {} in flight", futures.len());
    tokio::time::timeout(config.shutdown_timeout, async {
        while let Some(joined) = futures.join_next_with_id().await {
            settle(&receiver, &mut inflight, joined, &redelivery, &instruments).await?;
        }
        Ok::<(), Error>(())
    })
    .await
    .context(ShutdownTimeoutSnafu)??;

    Ok(())
}

/// Start consuming events from `receiver` in the background
pub fn new<R: Receiver + 'static>(
    receiver: R,
    handler: Arc<dyn Handler>,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        handler,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Processor {
        processor,
        shutdown,
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use memory::MemoryBus;

    #[test]
    fn wire_format() {
        let event = InconsistentEvent::new(17, Direction::Dst, EventType::TargetMissing);
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            serde_json::json!({"id": 17, "direction": "DST", "type": "target_missing"})
        );
        let back =
            InconsistentEvent::from_json(br#"{"id":3,"direction":"SRC","type":"neq"}"#).unwrap();
        assert_eq!(back, InconsistentEvent::new(3, Direction::Src, EventType::Neq));
        assert!(InconsistentEvent::from_json(br#"{"id":3,"direction":"src","type":"neq"}"#).is_err());
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("not this time"))]
    struct Flaky;

    /// Fails the first `failures` times it sees any given event, then records it
    struct Recorder {
        failures: usize,
        seen: Mutex<HashMap<i64, usize>>,
        handled: Mutex<Vec<InconsistentEvent>>,
    }

    impl Recorder {
        fn new(failures: usize) -> Recorder {
            Recorder {
                failures,
                seen: Mutex::new(HashMap::new()),
                handled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, event: InconsistentEvent) -> Result<()> {
            let attempts = {
                let mut seen = self.seen.lock().unwrap();
                let n = seen.entry(event.id).or_default();
                *n += 1;
                *n
            };
            if attempts <= self.failures {
                return Err(Error::new(Flaky));
            }
            self.handled.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn quick() -> Config {
        Config {
            sleep_duration: Duration::from_millis(10),
            pickup_timeout: Duration::from_millis(10),
            retry_min: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_for(bus: &MemoryBus) {
        for _ in 0..200 {
            if bus.is_drained().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("the bus never drained");
    }

    #[tokio::test]
    async fn handled_events_are_acknowledged() {
        let bus = Arc::new(MemoryBus::new());
        let handler = Arc::new(Recorder::new(0));
        let processor = new(
            bus.clone(),
            handler.clone(),
            Some(quick()),
            Arc::new(Instruments::new("migrator-test")),
        );
        for id in 1..=5 {
            bus.produce(&InconsistentEvent::new(id, Direction::Src, EventType::Neq))
                .await
                .unwrap();
        }
        wait_for(&bus).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        let mut ids = handler
            .handled
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failures_are_redelivered() {
        let bus = Arc::new(MemoryBus::new());
        let handler = Arc::new(Recorder::new(2));
        let processor = new(
            bus.clone(),
            handler.clone(),
            Some(quick()),
            Arc::new(Instruments::new("migrator-test")),
        );
        bus.produce(&InconsistentEvent::new(9, Direction::Dst, EventType::BaseMissing))
            .await
            .unwrap();
        wait_for(&bus).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handler.seen.lock().unwrap()[&9], 3);
        assert_eq!(handler.handled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poison_is_discarded() {
        let bus = Arc::new(MemoryBus::new());
        let handler = Arc::new(Recorder::new(0));
        let processor = new(
            bus.clone(),
            handler.clone(),
            Some(quick()),
            Arc::new(Instruments::new("migrator-test")),
        );
        bus.publish_raw(b"{\"id\": \"not a number\"}".to_vec()).await;
        bus.produce(&InconsistentEvent::new(1, Direction::Src, EventType::Neq))
            .await
            .unwrap();
        wait_for(&bus).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handler.handled.lock().unwrap().len(), 1);
    }

    struct Slow;

    #[async_trait]
    impl Handler for Slow {
        async fn handle(&self, _event: InconsistentEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn timeouts_release_the_event() {
        let bus = Arc::new(MemoryBus::new());
        let processor = new(
            bus.clone(),
            Arc::new(Slow),
            Some(Config {
                handler_timeout: Duration::from_millis(20),
                max_concurrent_events: 1,
                ..quick()
            }),
            Arc::new(Instruments::new("migrator-test")),
        );
        bus.produce(&InconsistentEvent::new(1, Direction::Src, EventType::Neq))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bus.redeliveries().await >= 1);
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    /// Sleeps on every event, tracking how many it's working on at once
    #[derive(Default)]
    struct Busy {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Busy {
        async fn handle(&self, _event: InconsistentEvent) -> Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_are_handled_concurrently() {
        let bus = Arc::new(MemoryBus::new());
        for id in 1..=8 {
            bus.produce(&InconsistentEvent::new(id, Direction::Src, EventType::Neq))
                .await
                .unwrap();
        }
        let handler = Arc::new(Busy::default());
        let processor = new(
            bus.clone(),
            handler.clone(),
            Some(Config {
                max_concurrent_events: 4,
                ..quick()
            }),
            Arc::new(Instruments::new("migrator-test")),
        );
        wait_for(&bus).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        let peak = handler.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "handled one event at a time");
        assert!(peak <= 4, "{} events in flight", peak);
    }

    #[test]
    fn redelivery_delays() {
        let redelivery = Redelivery {
            min: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(redelivery.delay(1), Duration::from_millis(100));
        assert_eq!(redelivery.delay(2), Duration::from_millis(200));
        assert_eq!(redelivery.delay(4), Duration::from_millis(800));
        assert_eq!(redelivery.delay(5), Duration::from_secs(1));
        assert_eq!(redelivery.delay(u32::MAX), Duration::from_secs(1));
        assert_eq!(Redelivery::immediate().delay(7), Duration::ZERO);
    }

    #[tokio::test]
    async fn failing_events_are_paced() {
        let bus = Arc::new(MemoryBus::new());
        let handler = Arc::new(Recorder::new(usize::MAX));
        let processor = new(
            bus.clone(),
            handler.clone(),
            Some(Config {
                retry_min: Duration::from_millis(50),
                retry_max: Duration::from_millis(200),
                ..quick()
            }),
            Arc::new(Instruments::new("migrator-test")),
        );
        bus.produce(&InconsistentEvent::new(4, Direction::Src, EventType::Neq))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        // Delivered at roughly 0, 50, 150 & 350ms
        let attempts = handler.seen.lock().unwrap()[&4];
        assert!((2..=6).contains(&attempts), "{} attempts", attempts);
    }
}
