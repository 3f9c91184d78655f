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

//! # migrator-shared
//!
//! Types shared between [migratord] and its clients: the write [Pattern] vocabulary & the request &
//! response bodies of the control-plane API.
//!
//! [migratord]: ../migratord/index.html

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{Backtrace, prelude::*};

use std::{fmt::Display, str::FromStr};

pub mod api;

pub use api::{ApiResult, IncrStartReq, SessionStatus, StatusRsp};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a dual-write pattern"))]
    UnknownPattern { text: String, backtrace: Backtrace },
    #[snafu(display("{value} does not encode a dual-write pattern"))]
    UnknownPatternCode { value: u8, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Pattern                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The routing mode governing which store(s) a dual-write connection uses for reads & writes
///
/// The four variants are traversed in order during a migration: we start out reading & writing the
/// source only, begin writing the destination as well (but still read from the source), flip reads
/// over to the destination (while continuing to mirror writes back to the source, so that we can
/// roll back), and finally abandon the source altogether.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Pattern {
    /// All reads & writes hit the source only
    #[default]
    SrcOnly = 0,
    /// Writes go to the source, then (best-effort) the destination; reads hit the source
    SrcFirst = 1,
    /// Writes go to the destination, then (best-effort) the source; reads hit the destination
    DstFirst = 2,
    /// All reads & writes hit the destination only
    DstOnly = 3,
}

impl Pattern {
    pub const ALL: [Pattern; 4] = [
        Pattern::SrcOnly,
        Pattern::SrcFirst,
        Pattern::DstFirst,
        Pattern::DstOnly,
    ];
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::SrcOnly => "src_only",
            Pattern::SrcFirst => "src_first",
            Pattern::DstFirst => "dst_first",
            Pattern::DstOnly => "dst_only",
        }
    }
    /// True if reads (and the synchronous leg of writes) are served by the source store
    pub fn source_is_primary(&self) -> bool {
        matches!(self, Pattern::SrcOnly | Pattern::SrcFirst)
    }
    /// True if writes are mirrored to the non-primary store
    pub fn is_dual(&self) -> bool {
        matches!(self, Pattern::SrcFirst | Pattern::DstFirst)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "src_only" => Ok(Pattern::SrcOnly),
            "src_first" => Ok(Pattern::SrcFirst),
            "dst_first" => Ok(Pattern::DstFirst),
            "dst_only" => Ok(Pattern::DstOnly),
            _ => UnknownPatternSnafu { text: s.to_owned() }.fail(),
        }
    }
}

impl TryFrom<u8> for Pattern {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Pattern::SrcOnly),
            1 => Ok(Pattern::SrcFirst),
            2 => Ok(Pattern::DstFirst),
            3 => Ok(Pattern::DstOnly),
            _ => UnknownPatternCodeSnafu { value }.fail(),
        }
    }
}

impl From<Pattern> for u8 {
    fn from(value: Pattern) -> Self {
        value as u8
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> StdResult<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<Pattern>()
            .map_err(|err| <D::Error as serde::de::Error>::custom(format!("{}", err)))
    }
}
