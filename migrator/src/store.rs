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

//! # store
//!
//! The entity-level view of a table: the batch reads the validator needs, the point reads & upserts
//! the fixer needs. [Store] is the abstraction; [SqlStore] implements it over any [ConnPool]
//! (including a [DualWritePool]), and [MemoryStore] implements it in memory for tests.
//!
//! [DualWritePool]: crate::dual_write::DualWritePool
//! [MemoryStore]: crate::memory::MemoryStore

use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use itertools::Itertools;
use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::{
    entities::Entity,
    sql::{self, ConnPool, Value, placeholders},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to decode a row of {table}: {source}"))]
    #[snafu(visibility(pub(crate)))]
    Decode {
        table: &'static str,
        #[snafu(source(from(sql::Error, Box::new)))]
        source: Box<sql::Error>,
    },
    #[snafu(display("Table {table} has no columns in {store}"))]
    NoColumns {
        store: String,
        table: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("{store}: {source}"))]
    Sql {
        store: String,
        #[snafu(source(from(sql::Error, Box::new)))]
        source: Box<sql::Error>,
    },
    #[snafu(display("{store} timed out after {elapsed:?}"))]
    #[snafu(visibility(pub(crate)))]
    Timeout {
        store: String,
        elapsed: std::time::Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("{store} is unavailable"))]
    #[snafu(visibility(pub(crate)))]
    Unavailable { store: String, backtrace: Backtrace },
}

impl Error {
    /// True if retrying the same operation later might succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Sql { .. } | Error::Timeout { .. } | Error::Unavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          trait Store                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Batch & point access to one table of `T`
#[async_trait]
pub trait Store<T: Entity>: Send + Sync {
    fn name(&self) -> &str;
    /// The table's columns, as the store itself reports them
    async fn columns(&self) -> Result<Vec<String>>;
    /// Up to `limit` entities ordered by ID, skipping the first `offset`
    async fn find_ordered_by_id(&self, offset: usize, limit: usize) -> Result<Vec<T>>;
    /// Up to `limit` entities updated strictly after `utime`, ordered by update time
    async fn find_updated_since(&self, utime: i64, offset: usize, limit: usize) -> Result<Vec<T>>;
    /// Those of `ids` that are present, in no particular order
    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<T>>;
    /// The subset of `ids` that are present; cheaper than [find_by_ids](Store::find_by_ids)
    async fn find_ids(&self, ids: &[i64]) -> Result<Vec<i64>>;
    async fn find_by_id(&self, id: i64) -> Result<Option<T>>;
    /// Insert `entity`, or overwrite `columns` of the existing row with the same ID
    async fn upsert(&self, entity: &T, columns: &[String]) -> Result<()>;
    /// Delete by ID; returns the number of rows removed
    async fn delete(&self, id: i64) -> Result<u64>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            SqlStore                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Build `INSERT ... ON DUPLICATE KEY UPDATE` for `columns` of `table`
fn upsert_statement(table: &str, columns: &[&str]) -> String {
    let updates = columns
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case("id"))
        .map(|c| format!("`{c}` = VALUES(`{c}`)"))
        .join(", ");
    format!(
        "INSERT INTO `{}` ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
        table,
        columns.iter().map(|c| format!("`{c}`")).join(", "),
        placeholders(columns.len()),
        if updates.is_empty() {
            "`id` = `id`".to_owned()
        } else {
            updates
        }
    )
}

/// A [Store] speaking SQL over some [ConnPool]
pub struct SqlStore<T> {
    pool: Arc<dyn ConnPool>,
    select: String,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> SqlStore<T> {
    pub fn new(pool: Arc<dyn ConnPool>) -> SqlStore<T> {
        SqlStore {
            pool,
            select: format!(
                "SELECT {} FROM `{}`",
                T::COLUMNS.iter().map(|c| format!("`{c}`")).join(", "),
                T::TABLE
            ),
            _entity: PhantomData,
        }
    }
    async fn load(&self, query: &str, args: &[Value]) -> Result<Vec<T>> {
        self.pool
            .query(query, args)
            .await
            .context(SqlSnafu {
                store: self.pool.name(),
            })?
            .iter()
            .map(|row| T::from_row(row).context(DecodeSnafu { table: T::TABLE }))
            .collect()
    }
}

#[async_trait]
impl<T: Entity> Store<T> for SqlStore<T> {
    fn name(&self) -> &str {
        self.pool.name()
    }
    async fn columns(&self) -> Result<Vec<String>> {
        let columns = self
            .pool
            .query(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                &[T::TABLE.into()],
            )
            .await
            .context(SqlSnafu {
                store: self.pool.name(),
            })?
            .iter()
            .map(|row| {
                row.get_string("COLUMN_NAME")
                    .context(DecodeSnafu { table: T::TABLE })
            })
            .collect::<Result<Vec<String>>>()?;
        ensure!(
            !columns.is_empty(),
            NoColumnsSnafu {
                store: self.pool.name(),
                table: T::TABLE
            }
        );
        Ok(columns)
    }
    async fn find_ordered_by_id(&self, offset: usize, limit: usize) -> Result<Vec<T>> {
        self.load(
            &format!("{} ORDER BY `id` LIMIT ? OFFSET ?", self.select),
            &[(limit as u64).into(), (offset as u64).into()],
        )
        .await
    }
    async fn find_updated_since(&self, utime: i64, offset: usize, limit: usize) -> Result<Vec<T>> {
        self.load(
            &format!(
                "{} WHERE `{utime_col}` > ? ORDER BY `{utime_col}`, `id` LIMIT ? OFFSET ?",
                self.select,
                utime_col = T::UTIME_COLUMN
            ),
            &[utime.into(), (limit as u64).into(), (offset as u64).into()],
        )
        .await
    }
    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load(
            &format!(
                "{} WHERE `id` IN ({})",
                self.select,
                placeholders(ids.len())
            ),
            &ids.iter().map(|id| Value::Int(*id)).collect::<Vec<_>>(),
        )
        .await
    }
    async fn find_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.pool
            .query(
                &format!(
                    "SELECT `id` FROM `{}` WHERE `id` IN ({})",
                    T::TABLE,
                    placeholders(ids.len())
                ),
                &ids.iter().map(|id| Value::Int(*id)).collect::<Vec<_>>(),
            )
            .await
            .context(SqlSnafu {
                store: self.pool.name(),
            })?
            .iter()
            .map(|row| row.get_i64("id").context(DecodeSnafu { table: T::TABLE }))
            .collect()
    }
    async fn find_by_id(&self, id: i64) -> Result<Option<T>> {
        self.pool
            .query_row(&format!("{} WHERE `id` = ?", self.select), &[id.into()])
            .await
            .context(SqlSnafu {
                store: self.pool.name(),
            })?
            .map(|row| T::from_row(&row).context(DecodeSnafu { table: T::TABLE }))
            .transpose()
    }
    async fn upsert(&self, entity: &T, columns: &[String]) -> Result<()> {
        let row = entity.to_row();
        // Columns the table has but the entity doesn't map keep their server-side values
        let (names, args): (Vec<&str>, Vec<Value>) = columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.as_str(), v.clone())))
            .unzip();
        let stmt = upsert_statement(T::TABLE, &names);
        debug!(id = entity.id(), "{}", stmt);
        self.pool.exec(&stmt, &args).await.context(SqlSnafu {
            store: self.pool.name(),
        })?;
        Ok(())
    }
    async fn delete(&self, id: i64) -> Result<u64> {
        Ok(self
            .pool
            .exec(
                &format!("DELETE FROM `{}` WHERE `id` = ?", T::TABLE),
                &[id.into()],
            )
            .await
            .context(SqlSnafu {
                store: self.pool.name(),
            })?
            .rows_affected)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{entities::Interactive, sql::Row, sql::fake::FakePool};

    fn row(id: i64, like_cnt: i64) -> Row {
        Interactive {
            id,
            like_cnt,
            biz: "article".to_owned(),
            ..Default::default()
        }
        .to_row()
    }

    #[test]
    fn upsert_statements() {
        assert_eq!(
            upsert_statement("interactives", &["id", "biz", "like_cnt"]),
            "INSERT INTO `interactives` (`id`, `biz`, `like_cnt`) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE `biz` = VALUES(`biz`), `like_cnt` = VALUES(`like_cnt`)"
        );
        assert_eq!(
            upsert_statement("t", &["id"]),
            "INSERT INTO `t` (`id`) VALUES (?) ON DUPLICATE KEY UPDATE `id` = `id`"
        );
    }

    #[tokio::test]
    async fn reads() {
        let pool = FakePool::new("src");
        let store = SqlStore::<Interactive>::new(Arc::new(pool.clone()));

        pool.push_result(vec![row(1, 5), row(2, 6)]);
        let found = store.find_ordered_by_id(0, 2).await.unwrap();
        assert_eq!(found.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);

        pool.push_result(vec![row(2, 6)]);
        let found = store.find_updated_since(100, 4, 10).await.unwrap();
        assert_eq!(found.len(), 1);

        // No round-trip for an empty ID set
        assert!(store.find_by_ids(&[]).await.unwrap().is_empty());
        assert!(store.find_ids(&[]).await.unwrap().is_empty());

        pool.push_result(vec![Row::new().with("id", 2i64)]);
        assert_eq!(store.find_ids(&[1, 2]).await.unwrap(), vec![2]);

        assert!(store.find_by_id(9).await.unwrap().is_none());

        let statements = pool.statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[0].0.ends_with("ORDER BY `id` LIMIT ? OFFSET ?"));
        assert_eq!(statements[0].1, vec![Value::UInt(2), Value::UInt(0)]);
        assert!(statements[1].0.contains("WHERE `utime` > ?"));
        assert_eq!(
            statements[1].1,
            vec![Value::Int(100), Value::UInt(10), Value::UInt(4)]
        );
        assert!(statements[2].0.ends_with("WHERE `id` IN (?, ?)"));
    }

    #[tokio::test]
    async fn writes() {
        let pool = FakePool::new("dst");
        let store = SqlStore::<Interactive>::new(Arc::new(pool.clone()));

        let intr = Interactive {
            id: 4,
            like_cnt: 9,
            ..Default::default()
        };
        // An introspected column the entity doesn't know about is skipped
        let columns = ["id", "like_cnt", "extra"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        store.upsert(&intr, &columns).await.unwrap();
        assert_eq!(store.delete(4).await.unwrap(), 1);

        let statements = pool.statements();
        assert_eq!(
            statements[0].0,
            upsert_statement("interactives", &["id", "like_cnt"])
        );
        assert_eq!(statements[0].1, vec![Value::Int(4), Value::Int(9)]);
        assert_eq!(statements[1].0, "DELETE FROM `interactives` WHERE `id` = ?");
    }

    #[tokio::test]
    async fn introspection() {
        let pool = FakePool::new("src");
        let store = SqlStore::<Interactive>::new(Arc::new(pool.clone()));
        pool.push_result(
            Interactive::COLUMNS
                .iter()
                .map(|c| Row::new().with("COLUMN_NAME", *c))
                .collect(),
        );
        assert_eq!(store.columns().await.unwrap(), Interactive::COLUMNS);
        // No such table
        assert!(matches!(
            store.columns().await,
            Err(Error::NoColumns { .. })
        ));
    }
}
