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

//! # dual_write
//!
//! A [ConnPool] facade over a source & a destination pool, routing each statement according to a
//! runtime-switchable [Pattern].
//!
//! Writes always go to the *primary* store for the current pattern first; if that fails the
//! statement fails & the other store is never touched. If the pattern is one of the two "dual"
//! patterns, a successful primary write is followed by a best-effort write to the *secondary*
//! store, whose failure is logged (and counted) but never surfaced to the caller. Reads are served
//! by the primary alone.
//!
//! The pattern lives in a [PatternCell], an atomic that's read once per statement (or once per
//! transaction, at `begin_tx` time). The cell is injected, not global, so that the scheduler that
//! flips it & the pool that reads it agree on which cell they mean.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use snafu::prelude::*;
use tracing::{debug, error, info};

use migrator_shared::Pattern;

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
    sql::{
        ConnPool, Error, ExecResult, PatternSnafu, PrepareUnsupportedSnafu, Prepared, Result, Row,
        Tx, TxOptions, Value,
    },
};

inventory::submit! { metrics::Registration::new("dual_write.secondary.failures", Sort::IntegralCounter) }

/// A shareable, lock-free holder for the current [Pattern]
#[derive(Clone, Debug, Default)]
pub struct PatternCell(Arc<AtomicU8>);

impl PatternCell {
    pub fn new(pattern: Pattern) -> PatternCell {
        PatternCell(Arc::new(AtomicU8::new(pattern.into())))
    }
    pub fn load(&self) -> Pattern {
        // Only valid codes are ever stored
        Pattern::try_from(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }
    pub fn store(&self, pattern: Pattern) {
        self.0.store(pattern.into(), Ordering::Release)
    }
}

/// Something whose routing pattern can be inspected & changed
///
/// The scheduler drives pattern switches through this trait; a failed `update_pattern` leaves the
/// previous pattern in force.
pub trait PatternControl: Send + Sync {
    fn pattern(&self) -> Pattern;
    fn update_pattern(&self, pattern: Pattern) -> Result<()>;
}

/// Pick the (primary, secondary) pools for `pattern`
fn legs<'a>(
    pattern: Pattern,
    src: &'a Arc<dyn ConnPool>,
    dst: &'a Arc<dyn ConnPool>,
) -> (&'a Arc<dyn ConnPool>, Option<&'a Arc<dyn ConnPool>>) {
    match pattern {
        Pattern::SrcOnly => (src, None),
        Pattern::SrcFirst => (src, Some(dst)),
        Pattern::DstFirst => (dst, Some(src)),
        Pattern::DstOnly => (dst, None),
    }
}

fn secondary_failed(
    instruments: &Instruments,
    pattern: Pattern,
    pool: &str,
    op: &'static str,
    query: Option<&str>,
    err: &Error,
) {
    error!(
        %pattern,
        pool,
        op,
        query = query.unwrap_or_default(),
        "Secondary {} failed (ignored): {}",
        op,
        err
    );
    counter_add!(
        instruments,
        "dual_write.secondary.failures",
        1,
        &[KeyValue::new("op", op)]
    );
}

/// A [ConnPool] that mirrors writes across two stores
pub struct DualWritePool {
    src: Arc<dyn ConnPool>,
    dst: Arc<dyn ConnPool>,
    pattern: PatternCell,
    instruments: Arc<Instruments>,
}

impl DualWritePool {
    pub fn new(
        src: Arc<dyn ConnPool>,
        dst: Arc<dyn ConnPool>,
        pattern: PatternCell,
        instruments: Arc<Instruments>,
    ) -> DualWritePool {
        DualWritePool {
            src,
            dst,
            pattern,
            instruments,
        }
    }
    pub fn pattern_cell(&self) -> &PatternCell {
        &self.pattern
    }
    /// Switch patterns by wire name; an unrecognized name leaves the pattern unchanged
    pub fn update_pattern_by_name(&self, name: &str) -> Result<Pattern> {
        let pattern = name.parse::<Pattern>().context(PatternSnafu)?;
        self.update_pattern(pattern)?;
        Ok(pattern)
    }
    fn primary(&self) -> &Arc<dyn ConnPool> {
        legs(self.pattern.load(), &self.src, &self.dst).0
    }
}

impl PatternControl for DualWritePool {
    fn pattern(&self) -> Pattern {
        self.pattern.load()
    }
    fn update_pattern(&self, pattern: Pattern) -> Result<()> {
        let prior = self.pattern.load();
        self.pattern.store(pattern);
        info!("Dual-write pattern {} => {}", prior, pattern);
        Ok(())
    }
}

#[async_trait]
impl ConnPool for DualWritePool {
    fn name(&self) -> &str {
        "dual-write"
    }
    async fn begin_tx(&self, opts: TxOptions) -> Result<Box<dyn Tx>> {
        let pattern = self.pattern.load();
        let (primary, secondary) = legs(pattern, &self.src, &self.dst);
        let primary = primary.begin_tx(opts).await?;
        let secondary = match secondary {
            Some(pool) => match pool.begin_tx(opts).await {
                Ok(tx) => Some(tx),
                Err(err) => {
                    secondary_failed(&self.instruments, pattern, pool.name(), "begin", None, &err);
                    None
                }
            },
            None => None,
        };
        debug!(%pattern, dual = secondary.is_some(), "Began dual-write transaction");
        Ok(Box::new(DualWriteTx {
            pattern,
            primary,
            secondary,
            instruments: self.instruments.clone(),
        }))
    }
    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let pattern = self.pattern.load();
        let (primary, secondary) = legs(pattern, &self.src, &self.dst);
        let result = primary.exec(query, args).await?;
        if let Some(pool) = secondary {
            if let Err(err) = pool.exec(query, args).await {
                secondary_failed(
                    &self.instruments,
                    pattern,
                    pool.name(),
                    "exec",
                    Some(query),
                    &err,
                );
            }
        }
        Ok(result)
    }
    async fn query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.primary().query(query, args).await
    }
    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.primary().query_row(query, args).await
    }
    async fn prepare(&self, _query: &str) -> Result<Prepared> {
        PrepareUnsupportedSnafu { pool: self.name() }.fail()
    }
}

/// A transaction spanning (up to) two stores, routed by the pattern in force when it began
pub struct DualWriteTx {
    pattern: Pattern,
    primary: Box<dyn Tx>,
    // None for the single-store patterns, or when the secondary failed to begin
    secondary: Option<Box<dyn Tx>>,
    instruments: Arc<Instruments>,
}

impl DualWriteTx {
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }
}

#[async_trait]
impl Tx for DualWriteTx {
    fn name(&self) -> &str {
        "dual-write"
    }
    async fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let result = self.primary.exec(query, args).await?;
        if let Some(tx) = self.secondary.as_mut() {
            if let Err(err) = tx.exec(query, args).await {
                secondary_failed(
                    &self.instruments,
                    self.pattern,
                    tx.name(),
                    "exec",
                    Some(query),
                    &err,
                );
            }
        }
        Ok(result)
    }
    async fn query(&mut self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.primary.query(query, args).await
    }
    async fn query_row(&mut self, query: &str, args: &[Value]) -> Result<Option<Row>> {
        self.primary.query_row(query, args).await
    }
    async fn prepare(&mut self, _query: &str) -> Result<Prepared> {
        PrepareUnsupportedSnafu { pool: self.name() }.fail()
    }
    async fn commit(self: Box<Self>) -> Result<()> {
        let DualWriteTx {
            pattern,
            primary,
            secondary,
            instruments,
        } = *self;
        primary.commit().await?;
        if let Some(tx) = secondary {
            let pool = tx.name().to_owned();
            if let Err(err) = tx.commit().await {
                secondary_failed(&instruments, pattern, &pool, "commit", None, &err);
            }
        }
        Ok(())
    }
    async fn rollback(self: Box<Self>) -> Result<()> {
        let DualWriteTx {
            pattern,
            primary,
            secondary,
            instruments,
        } = *self;
        primary.rollback().await?;
        if let Some(tx) = secondary {
            let pool = tx.name().to_owned();
            if let Err(err) = tx.rollback().await {
                secondary_failed(&instruments, pattern, &pool, "rollback", None, &err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::sql::fake::FakePool;

    fn fixture(pattern: Pattern) -> (FakePool, FakePool, DualWritePool) {
        let src = FakePool::new("src");
        let dst = FakePool::new("dst");
        let pool = DualWritePool::new(
            Arc::new(src.clone()),
            Arc::new(dst.clone()),
            PatternCell::new(pattern),
            Arc::new(Instruments::new("migrator-test")),
        );
        (src, dst, pool)
    }

    const UPDATE: &str = "UPDATE interactives SET like_cnt = like_cnt + 1 WHERE id = ?";

    #[tokio::test]
    async fn writes_follow_the_pattern() {
        let expected = [
            (Pattern::SrcOnly, 1, 0),
            (Pattern::SrcFirst, 1, 1),
            (Pattern::DstFirst, 1, 1),
            (Pattern::DstOnly, 0, 1),
        ];
        for (pattern, src_execs, dst_execs) in expected {
            let (src, dst, pool) = fixture(pattern);
            let result = pool.exec(UPDATE, &[Value::Int(1)]).await.unwrap();
            assert_eq!(result.rows_affected, 1);
            assert_eq!(src.counts().execs(), src_execs, "{}", pattern);
            assert_eq!(dst.counts().execs(), dst_execs, "{}", pattern);
        }
    }

    #[tokio::test]
    async fn primary_failure_aborts() {
        let (src, dst, pool) = fixture(Pattern::SrcFirst);
        src.faults().exec.store(true, Ordering::SeqCst);
        assert!(pool.exec(UPDATE, &[Value::Int(1)]).await.is_err());
        assert_eq!(dst.counts().execs(), 0);

        let (src, dst, pool) = fixture(Pattern::DstFirst);
        dst.faults().exec.store(true, Ordering::SeqCst);
        assert!(pool.exec(UPDATE, &[Value::Int(1)]).await.is_err());
        assert_eq!(src.counts().execs(), 0);
    }

    #[tokio::test]
    async fn secondary_failure_is_swallowed() {
        let (src, dst, pool) = fixture(Pattern::SrcFirst);
        dst.faults().exec.store(true, Ordering::SeqCst);
        assert!(pool.exec(UPDATE, &[Value::Int(1)]).await.is_ok());
        assert_eq!(src.statements().len(), 1);
        assert_eq!(dst.counts().execs(), 1);
        assert!(dst.statements().is_empty());
    }

    #[tokio::test]
    async fn reads_touch_one_store() {
        for pattern in Pattern::ALL {
            let (src, dst, pool) = fixture(pattern);
            pool.query("SELECT 1", &[]).await.unwrap();
            pool.query_row("SELECT 1", &[]).await.unwrap();
            let (hit, missed) = if pattern.source_is_primary() {
                (&src, &dst)
            } else {
                (&dst, &src)
            };
            assert_eq!(hit.counts().queries(), 2, "{}", pattern);
            assert_eq!(missed.counts().queries(), 0, "{}", pattern);
        }
    }

    #[tokio::test]
    async fn transactions_snapshot_the_pattern() {
        let (src, dst, pool) = fixture(Pattern::SrcFirst);
        let mut tx = pool.begin_tx(TxOptions::default()).await.unwrap();
        pool.update_pattern(Pattern::DstOnly).unwrap();
        tx.exec(UPDATE, &[Value::Int(7)]).await.unwrap();
        tx.query("SELECT 1", &[]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(src.counts().execs(), 1);
        assert_eq!(dst.counts().execs(), 1);
        assert_eq!(src.counts().queries(), 1);
        assert_eq!(dst.counts().queries(), 0);
        assert_eq!(src.counts().commits(), 1);
        assert_eq!(dst.counts().commits(), 1);

        // Statements issued after the switch see the new pattern
        pool.exec(UPDATE, &[Value::Int(7)]).await.unwrap();
        assert_eq!(src.counts().execs(), 1);
        assert_eq!(dst.counts().execs(), 2);
    }

    #[tokio::test]
    async fn secondary_begin_failure_degrades() {
        let (src, dst, pool) = fixture(Pattern::DstFirst);
        src.faults().begin.store(true, Ordering::SeqCst);
        let mut tx = pool.begin_tx(TxOptions::default()).await.unwrap();
        tx.exec(UPDATE, &[Value::Int(7)]).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(dst.counts().execs(), 1);
        assert_eq!(dst.counts().rollbacks(), 1);
        assert_eq!(src.counts().execs(), 0);
        assert_eq!(src.counts().rollbacks(), 0);

        // ...but a primary begin failure is fatal
        dst.faults().begin.store(true, Ordering::SeqCst);
        assert!(pool.begin_tx(TxOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn commit_failures() {
        let (src, dst, pool) = fixture(Pattern::SrcFirst);
        dst.faults().commit.store(true, Ordering::SeqCst);
        let tx = pool.begin_tx(TxOptions::default()).await.unwrap();
        assert!(tx.commit().await.is_ok());

        src.faults().commit.store(true, Ordering::SeqCst);
        let tx = pool.begin_tx(TxOptions::default()).await.unwrap();
        assert!(tx.commit().await.is_err());
        // The secondary is never asked to commit if the primary couldn't
        assert_eq!(dst.counts().commits(), 1);
    }

    #[tokio::test]
    async fn prepare_is_unsupported() {
        let (_, _, pool) = fixture(Pattern::SrcFirst);
        assert!(matches!(
            pool.prepare("SELECT 1").await,
            Err(Error::PrepareUnsupported { .. })
        ));
        let mut tx = pool.begin_tx(TxOptions::default()).await.unwrap();
        assert!(matches!(
            tx.prepare("SELECT 1").await,
            Err(Error::PrepareUnsupported { .. })
        ));
    }

    #[tokio::test]
    async fn switch_by_name() {
        let (_, _, pool) = fixture(Pattern::SrcFirst);
        assert_eq!(
            pool.update_pattern_by_name("dst_first").unwrap(),
            Pattern::DstFirst
        );
        assert!(matches!(
            pool.update_pattern_by_name("everywhere"),
            Err(Error::Pattern { .. })
        ));
        assert_eq!(pool.pattern(), Pattern::DstFirst);
    }
}
