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

//! # Control-plane API types
//!
//! Every control-plane endpoint answers with HTTP 200 & an [ApiResult] body; expected failure modes
//! (a bad request body, a pattern that couldn't be propagated) are reported through `code` & `msg`
//! rather than through the HTTP status.

use serde::{Deserialize, Serialize};

use crate::Pattern;

/// Request body was malformed
pub const CODE_SYSTEM_ERROR: i32 = 501001;
/// The caller named a pattern we don't recognize
pub const CODE_UNKNOWN_PATTERN: i32 = 400001;

/// The uniform control-plane response body: `{code, msg, data}`
///
/// A `code` of zero means success.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApiResult {
    #[serde(default)]
    pub code: i32,
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ApiResult {
    pub fn ok() -> ApiResult {
        ApiResult::msg("OK")
    }
    pub fn ok_with(data: serde_json::Value) -> ApiResult {
        ApiResult {
            code: 0,
            msg: "OK".to_owned(),
            data,
        }
    }
    pub fn nok() -> ApiResult {
        ApiResult::msg("NOK")
    }
    pub fn system_fail() -> ApiResult {
        ApiResult::msg("system fail")
    }
    pub fn system_error() -> ApiResult {
        ApiResult {
            code: CODE_SYSTEM_ERROR,
            msg: "system error".to_owned(),
            data: serde_json::Value::Null,
        }
    }
    pub fn unknown_pattern(text: &str) -> ApiResult {
        ApiResult {
            code: CODE_UNKNOWN_PATTERN,
            msg: "unknown pattern".to_owned(),
            data: serde_json::Value::String(text.to_owned()),
        }
    }
    fn msg(msg: &str) -> ApiResult {
        ApiResult {
            code: 0,
            msg: msg.to_owned(),
            data: serde_json::Value::Null,
        }
    }
    pub fn is_ok(&self) -> bool {
        self.code == 0 && self.msg == "OK"
    }
}

/// Body for `POST /incr/start`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IncrStartReq {
    /// Watermark: only rows whose update time is strictly greater will be scanned
    pub utime: i64,
    /// Milliseconds to sleep when the scan is exhausted; JSON has no notion of a duration
    pub interval: i64,
}

/// The state of one validation session, as reported by `GET /status`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Monotonically increasing per-scheduler session number
    pub session: u64,
    /// Base store for this session: "SRC" or "DST"
    pub direction: String,
    /// Seconds since the Unix epoch at which the session was launched
    pub started: i64,
    pub running: bool,
}

/// Response data for `GET /status`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusRsp {
    pub pattern: Pattern,
    pub full: Option<SessionStatus>,
    pub incr: Option<SessionStatus>,
}
