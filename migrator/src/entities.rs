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

//! # entities
//!
//! The [Entity] contract every migrated record type satisfies, plus the one record type this
//! repository migrates: [Interactive], the per-object read/like/collect counters.
//!
//! The migration machinery never interprets individual fields. It needs a stable numeric ID, a
//! whole-record equality test, the update time (for incremental scans) & a way to move the
//! record in & out of a generic [Row].

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::sql::{self, Row};

/// A record type that can be migrated between two tables
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    /// Name of the table holding this entity, in both source & destination
    const TABLE: &'static str;
    /// The columns this type maps, primary key first
    const COLUMNS: &'static [&'static str];
    /// Name of the update-time column; incremental scans filter & order on it
    const UTIME_COLUMN: &'static str = "utime";

    fn id(&self) -> i64;
    /// True if `self` & `other` agree on every field
    fn compare_to(&self, other: &Self) -> bool;
    fn update_time(&self) -> i64;
    fn from_row(row: &Row) -> sql::Result<Self>;
    /// Produce a [Row] holding every column in [COLUMNS](Entity::COLUMNS), in order
    fn to_row(&self) -> Row;
}

/// Interaction counters for one business object (an article, say)
///
/// Times are milliseconds since the Unix epoch.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Interactive {
    pub id: i64,
    pub biz_id: i64,
    pub biz: String,
    pub read_cnt: i64,
    pub like_cnt: i64,
    pub collect_cnt: i64,
    pub utime: i64,
    pub ctime: i64,
}

impl Entity for Interactive {
    const TABLE: &'static str = "interactives";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "biz_id",
        "biz",
        "read_cnt",
        "like_cnt",
        "collect_cnt",
        "utime",
        "ctime",
    ];

    fn id(&self) -> i64 {
        self.id
    }
    fn compare_to(&self, other: &Self) -> bool {
        self == other
    }
    fn update_time(&self) -> i64 {
        self.utime
    }
    fn from_row(row: &Row) -> sql::Result<Self> {
        Ok(Interactive {
            id: row.get_i64("id")?,
            biz_id: row.get_i64("biz_id")?,
            biz: row.get_string("biz")?,
            read_cnt: row.get_i64("read_cnt")?,
            like_cnt: row.get_i64("like_cnt")?,
            collect_cnt: row.get_i64("collect_cnt")?,
            utime: row.get_i64("utime")?,
            ctime: row.get_i64("ctime")?,
        })
    }
    fn to_row(&self) -> Row {
        Row::new()
            .with("id", self.id)
            .with("biz_id", self.biz_id)
            .with("biz", self.biz.as_str())
            .with("read_cnt", self.read_cnt)
            .with("like_cnt", self.like_cnt)
            .with("collect_cnt", self.collect_cnt)
            .with("utime", self.utime)
            .with("ctime", self.ctime)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interactive_rows() {
        let intr = Interactive {
            id: 3,
            biz_id: 101,
            biz: "article".to_owned(),
            read_cnt: 10,
            like_cnt: 2,
            collect_cnt: 1,
            utime: 1_700_000_000_123,
            ctime: 1_700_000_000_000,
        };
        let row = intr.to_row();
        assert_eq!(
            row.columns().iter().map(String::as_str).collect::<Vec<_>>(),
            Interactive::COLUMNS
        );
        let back = Interactive::from_row(&row).unwrap();
        assert!(back.compare_to(&intr));
        assert_eq!(back.update_time(), 1_700_000_000_123);

        let mut drifted = intr.clone();
        drifted.like_cnt += 1;
        assert!(!drifted.compare_to(&intr));

        assert!(Interactive::from_row(&Row::new().with("id", 1i64)).is_err());
    }
}
