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

//! # End-to-end tests
//!
//! Validate, publish, consume & repair, entirely in memory; then drive the control plane through
//! its router.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use migrator::{
    dual_write::{PatternCell, PatternControl},
    entities::Interactive,
    events::{self, Direction, EventType, memory::MemoryBus},
    fixer::FixerConsumer,
    memory::MemoryStore,
    metrics::Instruments,
    scheduler::{Scheduler, ValidatorConfig, make_router},
    sql,
    validator::Validator,
};
use migrator_shared::{
    ApiResult, Pattern, StatusRsp,
    api::{CODE_SYSTEM_ERROR, CODE_UNKNOWN_PATTERN},
};

fn interactive(id: i64, like_cnt: i64) -> Interactive {
    Interactive {
        id,
        biz_id: id * 10,
        biz: "article".to_owned(),
        read_cnt: 1000 + id,
        like_cnt,
        collect_cnt: 7,
        utime: 1_700_000_000_000 + id,
        ctime: 1_690_000_000_000,
    }
}

fn instruments() -> Arc<Instruments> {
    Arc::new(Instruments::new("migrator-e2e"))
}

/// Wait (up to a couple of seconds) for the fixer to leave `dst` agreeing with `src`
async fn converge(
    src: &MemoryStore<Interactive>,
    dst: &MemoryStore<Interactive>,
    bus: &MemoryBus,
) -> bool {
    for _ in 0..200 {
        if bus.is_drained().await && src.all().await == dst.all().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Validate `dst` against `src`, then let a fixer consumer repair whatever was found
async fn validate_and_repair(
    src: Arc<MemoryStore<Interactive>>,
    dst: Arc<MemoryStore<Interactive>>,
) -> Vec<events::InconsistentEvent> {
    let bus = Arc::new(MemoryBus::new());
    let instruments = instruments();
    Validator::<Interactive>::new(
        src.clone(),
        dst.clone(),
        bus.clone(),
        Direction::Src,
        instruments.clone(),
    )
    .full()
    .batch_size(3)
    .validate(CancellationToken::new())
    .await
    .unwrap();

    let published = bus.drain().await;
    for event in &published {
        bus.publish_raw(event.to_json().unwrap()).await;
    }

    let consumer = FixerConsumer::<Interactive>::new(src.clone(), dst.clone(), instruments.clone())
        .await
        .unwrap();
    let processor = events::new(bus.clone(), Arc::new(consumer), None, instruments);
    assert!(converge(&src, &dst, &bus).await);
    processor.shutdown(Duration::from_secs(1)).await.unwrap();
    published
}

#[tokio::test]
async fn missing_rows_are_created() {
    let src = Arc::new(MemoryStore::with_rows(
        "src",
        (1..=8).map(|id| interactive(id, id)),
    ));
    let dst = Arc::new(MemoryStore::new("dst"));

    let published = validate_and_repair(src.clone(), dst.clone()).await;

    assert_eq!(published.len(), 8);
    assert!(
        published
            .iter()
            .all(|ev| ev.kind == EventType::TargetMissing && ev.direction == Direction::Src)
    );
    assert_eq!(dst.all().await, src.all().await);
}

#[tokio::test]
async fn mismatched_rows_are_overwritten() {
    let src = Arc::new(MemoryStore::with_rows(
        "src",
        (1..=6).map(|id| interactive(id, id)),
    ));
    // Row 4 has drifted, row 5 never made it, & row 99 exists only in the destination
    let dst = Arc::new(MemoryStore::with_rows(
        "dst",
        (1..=6)
            .filter(|id| *id != 5)
            .map(|id| interactive(id, if id == 4 { 400 } else { id }))
            .chain(std::iter::once(interactive(99, 1))),
    ));

    let mut published = validate_and_repair(src.clone(), dst.clone()).await;
    published.sort_by_key(|ev| ev.id);

    assert_eq!(
        published
            .iter()
            .map(|ev| (ev.id, ev.kind))
            .collect::<Vec<_>>(),
        vec![
            (4, EventType::Neq),
            (5, EventType::Neq),
            (99, EventType::BaseMissing)
        ]
    );
    assert_eq!(dst.get(4).await.unwrap().like_cnt, 4);
    assert!(dst.get(99).await.is_none());
    assert_eq!(dst.all().await, src.all().await);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         control plane                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Stands in for the dual-write connection
#[derive(Default)]
struct Control(PatternCell);

impl PatternControl for Control {
    fn pattern(&self) -> Pattern {
        self.0.load()
    }
    fn update_pattern(&self, pattern: Pattern) -> sql::Result<()> {
        self.0.store(pattern);
        Ok(())
    }
}

struct ControlPlane {
    control: Arc<Control>,
    scheduler: Arc<Scheduler<Interactive>>,
    router: axum::Router,
}

fn control_plane() -> ControlPlane {
    let src = Arc::new(MemoryStore::with_rows(
        "src",
        (1..=4).map(|id| interactive(id, id)),
    ));
    let dst = Arc::new(MemoryStore::new("dst"));
    let control = Arc::new(Control::default());
    let scheduler = Arc::new(Scheduler::<Interactive>::new(
        src,
        dst,
        control.clone(),
        Arc::new(MemoryBus::new()),
        ValidatorConfig::default(),
        instruments(),
    ));
    let router = make_router(scheduler.clone());
    ControlPlane {
        control,
        scheduler,
        router,
    }
}

async fn send(router: &axum::Router, method: &str, uri: &str, body: Option<&str>) -> ApiResult {
    let mut req = Request::builder().method(method).uri(uri);
    if body.is_some() {
        req = req.header(CONTENT_TYPE, "application/json");
    }
    let rsp = router
        .clone()
        .oneshot(
            req.body(body.map(|b| Body::from(b.to_owned())).unwrap_or_default())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rsp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice::<ApiResult>(&bytes).unwrap()
}

#[tokio::test]
async fn pattern_routes() {
    let plane = control_plane();
    for (uri, pattern) in [
        ("/src_first", Pattern::SrcFirst),
        ("/dst_first", Pattern::DstFirst),
        ("/dst_only", Pattern::DstOnly),
        ("/src_only", Pattern::SrcOnly),
        ("/pattern/dst_first", Pattern::DstFirst),
    ] {
        assert_eq!(send(&plane.router, "POST", uri, None).await, ApiResult::ok());
        assert_eq!(plane.control.pattern(), pattern);
        assert_eq!(plane.scheduler.pattern().await, pattern);
    }

    let rsp = send(&plane.router, "POST", "/pattern/sideways", None).await;
    assert_eq!(rsp.code, CODE_UNKNOWN_PATTERN);
    assert_eq!(rsp.msg, "unknown pattern");
    assert_eq!(plane.control.pattern(), Pattern::DstFirst);
}

#[tokio::test]
async fn session_routes() {
    let plane = control_plane();

    assert_eq!(
        send(&plane.router, "POST", "/full/start", None).await,
        ApiResult::ok()
    );
    assert_eq!(
        send(
            &plane.router,
            "POST",
            "/incr/start",
            Some(r#"{"utime": 0, "interval": 50}"#)
        )
        .await,
        ApiResult::ok()
    );

    let rsp = send(&plane.router, "GET", "/status", None).await;
    assert!(rsp.is_ok());
    let status: StatusRsp = serde_json::from_value(rsp.data).unwrap();
    assert_eq!(status.pattern, Pattern::SrcOnly);
    assert_eq!(status.full.unwrap().direction, "SRC");
    assert!(status.incr.unwrap().running);

    assert_eq!(
        send(&plane.router, "POST", "/incr/stop", None).await,
        ApiResult::ok()
    );
    assert_eq!(
        send(&plane.router, "POST", "/full/stop", None).await,
        ApiResult::ok()
    );
    // Stopping twice is harmless
    assert_eq!(
        send(&plane.router, "POST", "/full/stop", None).await,
        ApiResult::ok()
    );
}

#[tokio::test]
async fn malformed_incremental_requests() {
    let plane = control_plane();
    for body in [r#"{"utime": "yesterday"}"#, "not json", r#"{"utime": 0, "interval": -5}"#] {
        let rsp = send(&plane.router, "POST", "/incr/start", Some(body)).await;
        assert_eq!(rsp.code, CODE_SYSTEM_ERROR);
        assert_eq!(rsp.msg, "system error");
    }
    assert!(plane.scheduler.status().await.incr.is_none());
}
