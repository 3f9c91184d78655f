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

//! # scheduler
//!
//! The operator's control plane over a migration: which [Pattern] the dual-write connection is
//! using, and which validation sessions are running.
//!
//! A [Scheduler] owns at most one full & one incremental validation session. Starting a session
//! cancels its predecessor of the same kind; stopping one just cancels it. The direction of each
//! new session follows the pattern in force when it starts: while the source is primary we check
//! the destination against the source, & vice versa.
//!
//! [make_router] exposes all of this over HTTP. Every route answers 200 with an [ApiResult] body.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use migrator_shared::{ApiResult, IncrStartReq, Pattern, SessionStatus, StatusRsp};

use crate::{
    counter_add,
    dual_write::PatternControl,
    entities::Entity,
    events::{Direction, Producer},
    metrics::{self, Instruments, Sort},
    sql,
    store::Store,
    validator::{self, BackoffParameters, Validator},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to switch to {pattern}; still on {prior}: {source}"))]
    Propagate {
        pattern: Pattern,
        prior: Pattern,
        source: sql::Error,
    },
    #[snafu(display("The scheduler has been shut down"))]
    ShutDown { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("scheduler.pattern.switches", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("scheduler.sessions.started", Sort::IntegralCounter) }

/// Tuning applied to every validator the scheduler builds
#[derive(Clone, Debug, Deserialize)]
pub struct ValidatorConfig {
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
    #[serde(rename = "batch-timeout")]
    pub batch_timeout: Duration,
    #[serde(rename = "publish-timeout")]
    pub publish_timeout: Duration,
    #[serde(rename = "backoff-min")]
    pub backoff_min: Duration,
    #[serde(rename = "backoff-max")]
    pub backoff_max: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let backoff = BackoffParameters::default();
        ValidatorConfig {
            batch_size: validator::DEFAULT_BATCH_SIZE,
            batch_timeout: validator::DEFAULT_BATCH_TIMEOUT,
            publish_timeout: validator::DEFAULT_PUBLISH_TIMEOUT,
            backoff_min: backoff.min,
            backoff_max: backoff.max,
        }
    }
}

/// The base store for validations launched under `pattern`
pub fn direction(pattern: Pattern) -> Direction {
    if pattern.source_is_primary() {
        Direction::Src
    } else {
        Direction::Dst
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Kind {
    Full,
    Incremental,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Full => "full",
            Kind::Incremental => "incremental",
        }
    }
}

/// One launched validation
struct Session {
    id: u64,
    direction: Direction,
    started: DateTime<Utc>,
    token: CancellationToken,
    running: Arc<AtomicBool>,
}

impl Session {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            session: self.id,
            direction: self.direction.to_string(),
            started: self.started.timestamp(),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

struct SchedulerState {
    pattern: Pattern,
    full: Option<Session>,
    incr: Option<Session>,
    shut_down: bool,
}

pub struct Scheduler<T: Entity> {
    src: Arc<dyn Store<T>>,
    dst: Arc<dyn Store<T>>,
    control: Arc<dyn PatternControl>,
    producer: Arc<dyn Producer>,
    config: ValidatorConfig,
    instruments: Arc<Instruments>,
    sessions: AtomicU64,
    state: Mutex<SchedulerState>,
}

impl<T: Entity> Scheduler<T> {
    /// The scheduler adopts `control`'s current pattern as its own
    pub fn new(
        src: Arc<dyn Store<T>>,
        dst: Arc<dyn Store<T>>,
        control: Arc<dyn PatternControl>,
        producer: Arc<dyn Producer>,
        config: ValidatorConfig,
        instruments: Arc<Instruments>,
    ) -> Scheduler<T> {
        let pattern = control.pattern();
        Scheduler {
            src,
            dst,
            control,
            producer,
            config,
            instruments,
            sessions: AtomicU64::new(0),
            state: Mutex::new(SchedulerState {
                pattern,
                full: None,
                incr: None,
                shut_down: false,
            }),
        }
    }

    pub async fn pattern(&self) -> Pattern {
        self.state.lock().await.pattern
    }

    /// Switch patterns; should the connection refuse, the scheduler stays on the prior pattern
    pub async fn switch_pattern(&self, pattern: Pattern) -> Result<()> {
        let mut state = self.state.lock().await;
        let prior = state.pattern;
        state.pattern = pattern;
        if let Err(source) = self.control.update_pattern(pattern) {
            state.pattern = prior;
            return Err(source).context(PropagateSnafu { pattern, prior });
        }
        counter_add!(
            self.instruments,
            "scheduler.pattern.switches",
            1,
            &[opentelemetry::KeyValue::new("pattern", pattern.as_str())]
        );
        info!("Switched pattern from {} to {}", prior, pattern);
        Ok(())
    }

    fn validator(&self, pattern: Pattern) -> Validator<T> {
        let direction = direction(pattern);
        let (base, target) = match direction {
            Direction::Src => (self.src.clone(), self.dst.clone()),
            Direction::Dst => (self.dst.clone(), self.src.clone()),
        };
        Validator::new(
            base,
            target,
            self.producer.clone(),
            direction,
            self.instruments.clone(),
        )
        .batch_size(self.config.batch_size)
        .batch_timeout(self.config.batch_timeout)
        .publish_timeout(self.config.publish_timeout)
        .backoff(BackoffParameters {
            min: self.config.backoff_min,
            max: self.config.backoff_max,
            ..Default::default()
        })
    }

    fn launch(&self, kind: Kind, validator: Validator<T>) -> Session {
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let direction = validator.direction();
        let token = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let span = info_span!("validation", session = id, kind = kind.as_str(), %direction);
        tokio::spawn({
            let token = token.clone();
            let running = running.clone();
            async move {
                match validator.validate(token).await {
                    Ok(()) => info!("Validation session exited"),
                    Err(err) => warn!("Validation session failed: {}", err),
                }
                running.store(false, Ordering::SeqCst);
            }
            .instrument(span)
        });
        counter_add!(
            self.instruments,
            "scheduler.sessions.started",
            1,
            &[opentelemetry::KeyValue::new("kind", kind.as_str())]
        );
        Session {
            id,
            direction,
            started: Utc::now(),
            token,
            running,
        }
    }

    /// Start a full validation, cancelling any full validation already in progress
    pub async fn start_full(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        ensure!(!state.shut_down, ShutDownSnafu);
        let validator = self.validator(state.pattern).full();
        if let Some(prior) = state.full.take() {
            prior.token.cancel();
        }
        let session = self.launch(Kind::Full, validator);
        let id = session.id;
        state.full = Some(session);
        Ok(id)
    }

    pub async fn stop_full(&self) {
        if let Some(session) = self.state.lock().await.full.as_ref() {
            session.token.cancel();
        }
    }

    /// Start tailing rows updated after `utime`, sleeping `interval` whenever caught up
    pub async fn start_incr(&self, utime: i64, interval: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        ensure!(!state.shut_down, ShutDownSnafu);
        let validator = self
            .validator(state.pattern)
            .incr()
            .utime(utime)
            .sleep_interval(interval);
        if let Some(prior) = state.incr.take() {
            prior.token.cancel();
        }
        let session = self.launch(Kind::Incremental, validator);
        let id = session.id;
        state.incr = Some(session);
        Ok(id)
    }

    pub async fn stop_incr(&self) {
        if let Some(session) = self.state.lock().await.incr.as_ref() {
            session.token.cancel();
        }
    }

    pub async fn status(&self) -> StatusRsp {
        let state = self.state.lock().await;
        StatusRsp {
            pattern: state.pattern,
            full: state.full.as_ref().map(Session::status),
            incr: state.incr.as_ref().map(Session::status),
        }
    }

    /// Cancel both sessions & refuse to start new ones
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shut_down = true;
        for session in [state.full.as_ref(), state.incr.as_ref()].into_iter().flatten() {
            session.token.cancel();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         HTTP handlers                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn switch_to<T: Entity>(scheduler: &Scheduler<T>, pattern: Pattern) -> Json<ApiResult> {
    match scheduler.switch_pattern(pattern).await {
        Ok(()) => Json(ApiResult::ok()),
        Err(err) => {
            error!("{}", err);
            Json(ApiResult::nok())
        }
    }
}

async fn src_only<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    switch_to(&scheduler, Pattern::SrcOnly).await
}

async fn src_first<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    switch_to(&scheduler, Pattern::SrcFirst).await
}

async fn dst_first<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    switch_to(&scheduler, Pattern::DstFirst).await
}

async fn dst_only<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    switch_to(&scheduler, Pattern::DstOnly).await
}

async fn pattern<T: Entity>(
    State(scheduler): State<Arc<Scheduler<T>>>,
    Path(name): Path<String>,
) -> Json<ApiResult> {
    match name.parse::<Pattern>() {
        Ok(pattern) => switch_to(&scheduler, pattern).await,
        Err(err) => {
            warn!("{}", err);
            Json(ApiResult::unknown_pattern(&name))
        }
    }
}

async fn full_start<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    match scheduler.start_full().await {
        Ok(session) => {
            info!(session, "Started full validation");
            Json(ApiResult::ok())
        }
        Err(err) => {
            error!("Failed to start full validation: {}", err);
            Json(ApiResult::system_fail())
        }
    }
}

async fn full_stop<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    scheduler.stop_full().await;
    Json(ApiResult::ok())
}

async fn incr_start<T: Entity>(
    State(scheduler): State<Arc<Scheduler<T>>>,
    req: std::result::Result<Json<IncrStartReq>, JsonRejection>,
) -> Json<ApiResult> {
    let req = match req {
        Ok(Json(req)) if req.interval >= 0 => req,
        Ok(Json(req)) => {
            warn!("Negative incremental validation interval: {}", req.interval);
            return Json(ApiResult::system_error());
        }
        Err(err) => {
            warn!("Bad incremental validation request: {}", err);
            return Json(ApiResult::system_error());
        }
    };
    match scheduler
        .start_incr(req.utime, Duration::from_millis(req.interval as u64))
        .await
    {
        Ok(session) => {
            info!(session, utime = req.utime, "Started incremental validation");
            Json(ApiResult::ok())
        }
        Err(err) => {
            error!("Failed to start incremental validation: {}", err);
            Json(ApiResult::system_fail())
        }
    }
}

async fn incr_stop<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    scheduler.stop_incr().await;
    Json(ApiResult::ok())
}

async fn status<T: Entity>(State(scheduler): State<Arc<Scheduler<T>>>) -> Json<ApiResult> {
    match serde_json::to_value(scheduler.status().await) {
        Ok(data) => Json(ApiResult::ok_with(data)),
        Err(err) => {
            error!("Failed to serialize scheduler status: {}", err);
            Json(ApiResult::system_fail())
        }
    }
}

/// Build the control-plane routes; callers typically nest them under `/migrator`
pub fn make_router<T: Entity>(scheduler: Arc<Scheduler<T>>) -> Router {
    Router::new()
        .route("/src_only", post(src_only::<T>))
        .route("/src_first", post(src_first::<T>))
        .route("/dst_first", post(dst_first::<T>))
        .route("/dst_only", post(dst_only::<T>))
        .route("/pattern/{name}", post(pattern::<T>))
        .route("/full/start", post(full_start::<T>))
        .route("/full/stop", post(full_stop::<T>))
        .route("/incr/start", post(incr_start::<T>))
        .route("/incr/stop", post(incr_stop::<T>))
        .route("/status", get(status::<T>))
        .with_state(scheduler)
}
