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

//! A durable event queue kept in a MySQL table.
//!
//! Each event is one row. A consumer claims a row by writing a fresh lease (an owner token & an
//! expiry time) over any row that's neither done nor currently leased, then reads back the row
//! carrying its token. On success the row is marked done; on failure the lease is replaced by a
//! retry time, pushed further out with each failed attempt, after which the next `take()` (from
//! this process or any other) can pick it up. Should a consumer die while holding a lease, the
//! lease eventually expires & the row becomes eligible again.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use snafu::prelude::*;
use tracing::debug;
use uuid::Uuid;

use crate::sql::{ConnPool, Value};

use super::{InconsistentEvent, Producer, QueueSnafu, Receiver, Redelivery, Result};

pub const DEFAULT_TABLE: &str = "migrator_events";

/// Identifies one leased row
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lease {
    pub id: i64,
    pub owner: Uuid,
    /// Deliveries so far, this one included
    pub attempts: u32,
}

pub struct TableQueue {
    pool: Arc<dyn ConnPool>,
    table: String,
    lease: Duration,
}

impl TableQueue {
    pub fn new(pool: Arc<dyn ConnPool>, table: &str, lease: Duration) -> TableQueue {
        TableQueue {
            pool,
            table: table.to_owned(),
            lease,
        }
    }
    /// Create the backing table if it doesn't already exist
    pub async fn create_table(&self) -> Result<()> {
        self.pool
            .exec(
                &format!(
                    "CREATE TABLE IF NOT EXISTS `{}` (
  `id` BIGINT NOT NULL AUTO_INCREMENT,
  `payload` VARBINARY(1024) NOT NULL,
  `created` BIGINT NOT NULL,
  `lease_owner` CHAR(36) NULL,
  `lease_expires` BIGINT NOT NULL DEFAULT 0,
  `attempts` INT NOT NULL DEFAULT 0,
  `done` TINYINT NOT NULL DEFAULT 0,
  PRIMARY KEY (`id`),
  KEY `idx_pending` (`done`, `lease_expires`)
)",
                    self.table
                ),
                &[],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        Ok(())
    }
    /// Number of rows not yet marked done
    pub async fn outstanding(&self) -> Result<i64> {
        let row = self
            .pool
            .query_row(
                &format!("SELECT COUNT(*) AS `n` FROM `{}` WHERE `done` = 0", self.table),
                &[],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        match row {
            Some(row) => row.get_i64("n").context(QueueSnafu { queue: &self.table }),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl Producer for TableQueue {
    async fn produce(&self, event: &InconsistentEvent) -> Result<()> {
        self.pool
            .exec(
                &format!(
                    "INSERT INTO `{}` (`payload`, `created`) VALUES (?, ?)",
                    self.table
                ),
                &[
                    Value::Bytes(event.to_json()?),
                    Utc::now().timestamp_millis().into(),
                ],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        Ok(())
    }
}

#[async_trait]
impl Receiver for TableQueue {
    type Cookie = Lease;
    async fn take(&self) -> Result<Option<(Vec<u8>, Self::Cookie)>> {
        let owner = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        let claimed = self
            .pool
            .exec(
                &format!(
                    "UPDATE `{}` SET `lease_owner` = ?, `lease_expires` = ?, `attempts` = `attempts` + 1 \
                     WHERE `done` = 0 AND `lease_expires` < ? ORDER BY `id` LIMIT 1",
                    self.table
                ),
                &[
                    owner.to_string().into(),
                    (now + self.lease.as_millis() as i64).into(),
                    now.into(),
                ],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        if claimed.rows_affected == 0 {
            return Ok(None);
        }
        let row = self
            .pool
            .query_row(
                &format!(
                    "SELECT `id`, `payload`, `attempts` FROM `{}` WHERE `lease_owner` = ? AND `done` = 0",
                    self.table
                ),
                &[owner.to_string().into()],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        // Our lease may already have been superseded; nothing to do but try again later
        let Some(row) = row else {
            debug!(%owner, "Lost a freshly-claimed lease");
            return Ok(None);
        };
        let id = row.get_i64("id").context(QueueSnafu { queue: &self.table })?;
        let payload = row
            .get_bytes("payload")
            .context(QueueSnafu { queue: &self.table })?;
        let attempts = row
            .get_i64("attempts")
            .context(QueueSnafu { queue: &self.table })?;
        Ok(Some((
            payload,
            Lease {
                id,
                owner,
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            },
        )))
    }
    async fn ack(&self, cookie: Self::Cookie) -> Result<()> {
        self.pool
            .exec(
                &format!(
                    "UPDATE `{}` SET `done` = 1 WHERE `id` = ? AND `lease_owner` = ?",
                    self.table
                ),
                &[cookie.id.into(), cookie.owner.to_string().into()],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        Ok(())
    }
    async fn nack(&self, cookie: Self::Cookie, redelivery: &Redelivery) -> Result<()> {
        let retry_at = Utc::now().timestamp_millis()
            + redelivery.delay(cookie.attempts).as_millis() as i64;
        self.pool
            .exec(
                &format!(
                    "UPDATE `{}` SET `lease_owner` = NULL, `lease_expires` = ? \
                     WHERE `id` = ? AND `lease_owner` = ?",
                    self.table
                ),
                &[
                    retry_at.into(),
                    cookie.id.into(),
                    cookie.owner.to_string().into(),
                ],
            )
            .await
            .context(QueueSnafu { queue: &self.table })?;
        Ok(())
    }
}
