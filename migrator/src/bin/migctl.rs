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

//! # migctl
//!
//! Drive a running [migratord] over its control plane: switch dual-write patterns, start & stop
//! validation, and check on progress.
//!
//! [migratord]: ../migratord/index.html

use std::fmt::Display;

use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use reqwest::{Client, Method};
use snafu::prelude::*;
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use migrator_shared::{ApiResult, IncrStartReq, Pattern};

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("{method} {url} failed: {source}"))]
    Request {
        method: Method,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("migratord refused the request: {msg} (code {code})"))]
    Refused { code: i32, msg: String },
    #[snafu(display("Failed to format the response: {source}"))]
    Render { source: serde_json::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Issue one control-plane request & print the response
async fn call(
    client: &Client,
    api: &str,
    method: Method,
    path: &str,
    body: Option<&IncrStartReq>,
) -> Result<()> {
    let url = format!("{}/migrator/{}", api.trim_end_matches('/'), path);
    debug!("{} {}", method, url);
    let mut req = client.request(method.clone(), &url);
    if let Some(body) = body {
        req = req.json(body);
    }
    let rsp = req
        .send()
        .await
        .and_then(|rsp| rsp.error_for_status())
        .context(RequestSnafu {
            method: method.clone(),
            url: url.clone(),
        })?
        .json::<ApiResult>()
        .await
        .context(RequestSnafu { method, url })?;

    println!(
        "{}",
        serde_json::to_string_pretty(&rsp).context(RenderSnafu)?
    );
    ensure!(
        rsp.is_ok(),
        RefusedSnafu {
            code: rsp.code,
            msg: rsp.msg.clone(),
        }
    );
    Ok(())
}

/// Name the route that switches to `name`
///
/// Known patterns have routes of their own; anything else goes to the generic route, where
/// migratord will reject it.
fn switch_path(name: &str) -> String {
    match name.parse::<Pattern>() {
        Ok(pattern) => pattern.as_str().to_owned(),
        Err(_) => format!("pattern/{}", name),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("migctl")
        .version(crate_version!())
        .author(crate_authors!())
        .about("The migratord control client")
        .long_about(
            "Operator's client for migratord.

migctl switches the dual-write pattern (src_only, src_first, dst_first, dst_only), starts and
stops full & incremental validation, and reports status.",
        )
        .arg(
            Arg::new("api")
                .short('A')
                .long("api")
                .num_args(1)
                .default_value("http://127.0.0.1:20690")
                .env("MIGCTL_API")
                .help("The location of the migratord control plane"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("produce more prolix output"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("switch")
                .about("Switch the dual-write pattern")
                .arg(
                    Arg::new("PATTERN")
                        .required(true)
                        .help("one of src_only, src_first, dst_first or dst_only"),
                ),
        )
        .subcommand(
            Command::new("full")
                .about("Full validation: scan both tables in their entirety")
                .subcommand_required(true)
                .subcommand(Command::new("start").about("Start (or restart) full validation"))
                .subcommand(Command::new("stop").about("Stop full validation")),
        )
        .subcommand(
            Command::new("incr")
                .about("Incremental validation: tail rows updated after a watermark")
                .subcommand_required(true)
                .subcommand(
                    Command::new("start")
                        .about("Start (or restart) incremental validation")
                        .arg(
                            Arg::new("utime")
                                .short('u')
                                .long("utime")
                                .num_args(1)
                                .value_parser(value_parser!(i64))
                                .default_value("0")
                                .help("validate rows updated strictly after this time (ms)"),
                        )
                        .arg(
                            Arg::new("interval")
                                .short('i')
                                .long("interval")
                                .num_args(1)
                                .value_parser(value_parser!(i64).range(0..))
                                .default_value("1000")
                                .help("sleep this long (ms) when caught up; 0 means stop instead"),
                        ),
                )
                .subcommand(Command::new("stop").about("Stop incremental validation")),
        )
        .subcommand(Command::new("status").about("Report the pattern & validation sessions"))
        .get_matches();

    tracing::subscriber::set_global_default(
        Registry::default()
            .with(fmt::Layer::default().compact().with_writer(std::io::stderr))
            .with(
                EnvFilter::builder()
                    .with_default_directive(
                        if matches.get_flag("verbose") {
                            Level::DEBUG
                        } else {
                            Level::WARN
                        }
                        .into(),
                    )
                    .from_env()
                    .context(EnvFilterSnafu)?,
            ),
    )
    .context(SubscriberSnafu)?;

    let api = matches
        .get_one::<String>("api")
        .cloned()
        .unwrap_or_default();
    let client = Client::new();

    match matches.subcommand() {
        Some(("switch", matches)) => {
            let name = matches
                .get_one::<String>("PATTERN")
                .cloned()
                .unwrap_or_default();
            call(&client, &api, Method::POST, &switch_path(&name), None).await
        }
        Some(("full", matches)) => match matches.subcommand() {
            Some(("start", _)) => call(&client, &api, Method::POST, "full/start", None).await,
            Some(("stop", _)) => call(&client, &api, Method::POST, "full/stop", None).await,
            _ => unreachable!(/* subcommand_required */),
        },
        Some(("incr", matches)) => match matches.subcommand() {
            Some(("start", matches)) => {
                let req = IncrStartReq {
                    utime: matches.get_one::<i64>("utime").copied().unwrap_or(0),
                    interval: matches.get_one::<i64>("interval").copied().unwrap_or(1000),
                };
                call(&client, &api, Method::POST, "incr/start", Some(&req)).await
            }
            Some(("stop", _)) => call(&client, &api, Method::POST, "incr/stop", None).await,
            _ => unreachable!(/* subcommand_required */),
        },
        Some(("status", _)) => call(&client, &api, Method::GET, "status", None).await,
        _ => unreachable!(/* subcommand_required */),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn switch_paths() {
        assert_eq!(switch_path("dst_first"), "dst_first");
        assert_eq!(switch_path("sideways"), "pattern/sideways");
    }
}
