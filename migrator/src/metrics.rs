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

//! # migrator metrics
//!
//! [OpenTelemetry] instruments are meant to be built once & re-used, which leaves the question of
//! where to keep them. Rather than hang a `Counter<u64>` field off every component for every
//! metric it records, each collection site registers its metric by name through the [inventory]
//! crate:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("fixer.upserts", Sort::IntegralCounter) }
//! // ...
//! counter_add!(self.instruments, "fixer.upserts", 1, &[]);
//! ```
//!
//! and a single [Instruments] instance, built at start-up & shared behind an `Arc`, pre-builds
//! every registered instrument & checks for name clashes. Looking up a name that was never
//! registered, or that names an instrument of a different sort, is a logic error & panics.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html

use std::collections::{HashMap, hash_map::Entry};

use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge, Meter},
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// A metric name & its instrument type, collected via [inventory]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    meter: Meter,
    map: HashMap<&'static str, Instrument>,
}

impl std::fmt::Debug for Instruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruments")
            .field("instruments", &self.map.len())
            .finish()
    }
}

impl Instruments {
    /// Build every registered instrument against the global meter provider
    ///
    /// Absent a configured provider, the global meter is a no-op, which is what tests want.
    pub fn new(scope: &'static str) -> Instruments {
        let meter = global::meter(scope);
        let mut map = HashMap::new();
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was registered twice", reg.name()),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            }
        });
        Instruments { meter, map }
    }
    pub fn meter(&self) -> &Meter {
        &self.meter
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::CounterU64(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeU64(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a gauge", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}
