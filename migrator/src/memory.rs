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

//! # memory
//!
//! An in-memory [Store], with knobs for injecting latency & failures, and counters recording how
//! often it was read. Used by the test suites & handy for exercising the daemon without MySQL.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    entities::Entity,
    sql::{Row, Value},
    store::{DecodeSnafu, Result, Store, UnavailableSnafu},
};

use snafu::prelude::*;

pub struct MemoryStore<T> {
    name: String,
    rows: RwLock<BTreeMap<i64, T>>,
    latency_ms: AtomicU64,
    failing: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<T: Entity> MemoryStore<T> {
    pub fn new(name: &str) -> MemoryStore<T> {
        MemoryStore {
            name: name.to_owned(),
            rows: RwLock::new(BTreeMap::new()),
            latency_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
    pub fn with_rows(name: &str, rows: impl IntoIterator<Item = T>) -> MemoryStore<T> {
        MemoryStore {
            rows: RwLock::new(rows.into_iter().map(|t| (t.id(), t)).collect()),
            ..MemoryStore::new(name)
        }
    }
    /// Insert or replace, bypassing the counters & injected faults
    pub async fn put(&self, entity: T) {
        self.rows.write().await.insert(entity.id(), entity);
    }
    pub async fn remove(&self, id: i64) -> Option<T> {
        self.rows.write().await.remove(&id)
    }
    pub async fn get(&self, id: i64) -> Option<T> {
        self.rows.read().await.get(&id).cloned()
    }
    /// Every entity, ordered by ID
    pub async fn all(&self) -> Vec<T> {
        self.rows.read().await.values().cloned().collect()
    }
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
    /// Delay every subsequent store operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
    /// While set, every store operation fails with a transient error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
    /// Number of read operations attempted so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
    async fn enter(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        ensure!(
            !self.failing.load(Ordering::SeqCst),
            UnavailableSnafu { store: &self.name }
        );
        Ok(())
    }
}

#[async_trait]
impl<T: Entity> Store<T> for MemoryStore<T> {
    fn name(&self) -> &str {
        &self.name
    }
    async fn columns(&self) -> Result<Vec<String>> {
        self.enter(&self.reads).await?;
        Ok(T::COLUMNS.iter().map(|c| c.to_string()).collect())
    }
    async fn find_ordered_by_id(&self, offset: usize, limit: usize) -> Result<Vec<T>> {
        self.enter(&self.reads).await?;
        Ok(self
            .rows
            .read()
            .await
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
    async fn find_updated_since(&self, utime: i64, offset: usize, limit: usize) -> Result<Vec<T>> {
        self.enter(&self.reads).await?;
        let mut found = self
            .rows
            .read()
            .await
            .values()
            .filter(|t| t.update_time() > utime)
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by_key(|t| (t.update_time(), t.id()));
        Ok(found.into_iter().skip(offset).take(limit).collect())
    }
    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<T>> {
        self.enter(&self.reads).await?;
        let rows = self.rows.read().await;
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }
    async fn find_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        self.enter(&self.reads).await?;
        let rows = self.rows.read().await;
        Ok(ids
            .iter()
            .filter(|id| rows.contains_key(id))
            .copied()
            .collect())
    }
    async fn find_by_id(&self, id: i64) -> Result<Option<T>> {
        self.enter(&self.reads).await?;
        Ok(self.rows.read().await.get(&id).cloned())
    }
    async fn upsert(&self, entity: &T, columns: &[String]) -> Result<()> {
        self.enter(&self.writes).await?;
        let mut rows = self.rows.write().await;
        let incoming = entity.to_row();
        // Columns not named keep their current values (or the incoming ones, on insert)
        let current = rows
            .get(&entity.id())
            .map(Entity::to_row)
            .unwrap_or_else(|| incoming.clone());
        let mut merged = Row::new();
        for (column, value) in current.iter() {
            if columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                merged.push(column, incoming.get(column).cloned().unwrap_or(Value::Null));
            } else {
                merged.push(column, value.clone());
            }
        }
        let merged = T::from_row(&merged).context(DecodeSnafu { table: T::TABLE })?;
        rows.insert(merged.id(), merged);
        Ok(())
    }
    async fn delete(&self, id: i64) -> Result<u64> {
        self.enter(&self.writes).await?;
        Ok(self.rows.write().await.remove(&id).map_or(0, |_| 1))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{entities::Interactive, store::Error};

    fn intr(id: i64, utime: i64) -> Interactive {
        Interactive {
            id,
            biz_id: id * 10,
            biz: "article".to_owned(),
            utime,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn batch_reads() {
        let store = MemoryStore::with_rows("src", [intr(3, 30), intr(1, 50), intr(2, 10)]);
        let ids = |v: Vec<Interactive>| v.into_iter().map(|i| i.id).collect::<Vec<_>>();
        assert_eq!(ids(store.find_ordered_by_id(0, 2).await.unwrap()), [1, 2]);
        assert_eq!(ids(store.find_ordered_by_id(2, 2).await.unwrap()), [3]);
        assert!(store.find_ordered_by_id(3, 2).await.unwrap().is_empty());
        // Strictly after the watermark, in update-time order
        assert_eq!(ids(store.find_updated_since(10, 0, 10).await.unwrap()), [3, 1]);
        assert_eq!(ids(store.find_updated_since(30, 0, 10).await.unwrap()), [1]);
        assert_eq!(store.find_ids(&[5, 2, 1]).await.unwrap(), [2, 1]);
        assert_eq!(store.reads(), 6);
    }

    #[tokio::test]
    async fn partial_upsert() {
        let store = MemoryStore::with_rows("dst", [intr(1, 10)]);
        let mut incoming = intr(1, 20);
        incoming.like_cnt = 7;
        store
            .upsert(&incoming, &["id".to_owned(), "like_cnt".to_owned()])
            .await
            .unwrap();
        let stored = store.get(1).await.unwrap();
        assert_eq!(stored.like_cnt, 7);
        assert_eq!(stored.utime, 10);

        let columns = Interactive::COLUMNS
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        store.upsert(&intr(2, 5), &columns).await.unwrap();
        assert!(store.get(2).await.unwrap().compare_to(&intr(2, 5)));
        assert_eq!(store.delete(2).await.unwrap(), 1);
        assert_eq!(store.delete(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fault_injection() {
        let store = MemoryStore::with_rows("src", [intr(1, 10)]);
        store.set_failing(true);
        let err = store.find_by_id(1).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        assert!(err.is_transient());
        store.set_failing(false);
        assert!(store.find_by_id(1).await.unwrap().is_some());
    }
}
