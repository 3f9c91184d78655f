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

//! # sql
//!
//! The statement-level contract spoken by every relational store in [migrator](crate).
//!
//! The dual-write connection sits *beneath* the entity layer: application code (and the
//! [store](crate::store) module) issues SQL text plus positional arguments against a [ConnPool],
//! never knowing whether that pool is a single MySQL instance or a [DualWritePool] fanning
//! statements out to two of them. This module defines that contract: a dynamically-typed [Value],
//! a [Row] of named values, and the object-safe [ConnPool] & [Tx] traits.
//!
//! [DualWritePool]: crate::dual_write::DualWritePool

use std::fmt::Display;

use async_trait::async_trait;
use snafu::{Backtrace, prelude::*};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic variant backend implementations can use
    #[snafu(display("{pool}: {source}"))]
    Backend {
        pool: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Column {column} holds {actual}; expected {expected}"))]
    ColumnType {
        column: String,
        expected: &'static str,
        actual: String,
        backtrace: Backtrace,
    },
    #[snafu(display("No column named {column}"))]
    NoSuchColumn { column: String, backtrace: Backtrace },
    #[snafu(display("Bad dual-write pattern: {source}"))]
    #[snafu(visibility(pub(crate)))]
    Pattern {
        source: migrator_shared::Error,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "{pool} doesn't support prepared statements; statement caching across two connections is unsafe"
    ))]
    #[snafu(visibility(pub(crate)))]
    PrepareUnsupported { pool: String, backtrace: Backtrace },
    #[snafu(display("{pool}: this transaction has already been committed or rolled back"))]
    #[snafu(visibility(pub(crate)))]
    TxDone { pool: String, backtrace: Backtrace },
}

impl Error {
    pub fn backend(pool: &str, err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            pool: pool.to_owned(),
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Values & Rows                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single SQL value, either bound as a statement argument or read back from a result set
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn sort(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "an integer",
            Value::UInt(_) => "an unsigned integer",
            Value::Float(_) => "a float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(n) => write!(f, "{}", n),
            Value::UInt(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row of a result set: column names in select order, paired with their values
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Row {
        Row::default()
    }
    /// Builder-style column append
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Row {
        self.push(column, value);
        self
    }
    pub fn push(&mut self, column: &str, value: impl Into<Value>) {
        self.columns.push(column.to_owned());
        self.values.push(value.into());
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    pub fn values(&self) -> &[Value] {
        &self.values
    }
    pub fn len(&self) -> usize {
        self.columns.len()
    }
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
    /// Look up a column by name; MySQL column names are case-insensitive, so we are, too.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| &self.values[i])
    }
    fn require(&self, column: &str) -> Result<&Value> {
        self.get(column).context(NoSuchColumnSnafu { column })
    }
    pub fn get_i64(&self, column: &str) -> Result<i64> {
        match self.require(column)? {
            Value::Int(n) => Ok(*n),
            Value::UInt(n) if *n <= i64::MAX as u64 => Ok(*n as i64),
            other => ColumnTypeSnafu {
                column,
                expected: "an integer",
                actual: other.sort(),
            }
            .fail(),
        }
    }
    pub fn get_string(&self, column: &str) -> Result<String> {
        match self.require(column)? {
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| {
                ColumnTypeSnafu {
                    column,
                    expected: "text",
                    actual: "non-UTF-8 bytes",
                }
                .build()
            }),
            other => ColumnTypeSnafu {
                column,
                expected: "text",
                actual: other.sort(),
            }
            .fail(),
        }
    }
    pub fn get_bytes(&self, column: &str) -> Result<Vec<u8>> {
        match self.require(column)? {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            other => ColumnTypeSnafu {
                column,
                expected: "bytes",
                actual: other.sort(),
            }
            .fail(),
        }
    }
}

/// Outcome of a statement that doesn't return rows
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// Transaction isolation level
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxOptions {
    /// None means "the server default"
    pub isolation: Option<Isolation>,
    pub read_only: bool,
}

/// A statement that has been prepared (and described) by the server
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Prepared {
    pub query: String,
    pub columns: Vec<String>,
}

/// Produce `n` comma-separated positional placeholders
pub fn placeholders(n: usize) -> String {
    std::iter::repeat_n("?", n).collect::<Vec<_>>().join(", ")
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      ConnPool & friends                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over a pool of connections to one relational store
///
/// Implementations must be cheap to share (they'll live behind an `Arc`) & must be safe to drive
/// from many tasks concurrently.
#[async_trait]
pub trait ConnPool: Send + Sync {
    /// A human-readable name for this pool, used in log messages
    fn name(&self) -> &str;
    async fn begin_tx(&self, opts: TxOptions) -> Result<Box<dyn Tx>>;
    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult>;
    async fn query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>>;
    /// Return the first row produced by `query`, if any
    async fn query_row(&self, query: &str, args: &[Value]) -> Result<Option<Row>>;
    async fn prepare(&self, query: &str) -> Result<Prepared>;
}

/// An open transaction on some [ConnPool]
///
/// `commit()` & `rollback()` consume the transaction; the caller can't touch it again. Dropping a
/// [Tx] without doing either will roll it back, but implementations are free to do that lazily.
#[async_trait]
pub trait Tx: Send {
    fn name(&self) -> &str;
    async fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult>;
    async fn query(&mut self, query: &str, args: &[Value]) -> Result<Vec<Row>>;
    async fn query_row(&mut self, query: &str, args: &[Value]) -> Result<Option<Row>>;
    async fn prepare(&mut self, query: &str) -> Result<Prepared>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   a fake pool, for testing                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////
