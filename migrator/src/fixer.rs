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

//! # fixer
//!
//! Repair the target store from the base store, one ID at a time.
//!
//! An [OverrideFixer] makes the target agree with the base, whatever the target currently holds:
//! if the base has the row, it's upserted into the target over every column; if it doesn't, the
//! target's copy is deleted. Applying a repair twice is harmless, which is what lets the event bus
//! get away with at-least-once delivery.
//!
//! A [FixerConsumer] pairs two fixers (source-as-base & destination-as-base) & picks one per event
//! according to the event's direction.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::{
    counter_add,
    entities::Entity,
    events::{self, Direction, EventType, Handler, InconsistentEvent},
    metrics::{self, Instruments, Sort},
    store::{self, Store},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to introspect the columns of {store}: {source}"))]
    Introspect { store: String, source: store::Error },
    #[snafu(display("Failed to read {id} from {store}: {source}"))]
    Read {
        store: String,
        id: i64,
        source: store::Error,
    },
    #[snafu(display("Failed to repair {id} in {store}: {source}"))]
    Write {
        store: String,
        id: i64,
        source: store::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("fixer.upserts", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fixer.deletes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("fixer.failures", Sort::IntegralCounter) }

/// Overwrite target rows with their base counterparts
pub struct OverrideFixer<T: Entity> {
    base: Arc<dyn Store<T>>,
    target: Arc<dyn Store<T>>,
    // The base table's columns, read once at construction
    columns: Vec<String>,
    instruments: Arc<Instruments>,
}

impl<T: Entity> OverrideFixer<T> {
    pub async fn new(
        base: Arc<dyn Store<T>>,
        target: Arc<dyn Store<T>>,
        instruments: Arc<Instruments>,
    ) -> Result<OverrideFixer<T>> {
        let columns = base.columns().await.context(IntrospectSnafu {
            store: base.name(),
        })?;
        debug!("Fixer for {} => {} over columns {:?}", base.name(), target.name(), columns);
        Ok(OverrideFixer {
            base,
            target,
            columns,
            instruments,
        })
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    /// Make the target's row `id` match the base's
    pub async fn fix(&self, id: i64) -> Result<()> {
        let found = self.base.find_by_id(id).await.context(ReadSnafu {
            store: self.base.name(),
            id,
        });
        let result = match found {
            Ok(Some(entity)) => self.upsert(&entity).await,
            Ok(None) => self.delete(id).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            counter_add!(self.instruments, "fixer.failures", 1, &[]);
        }
        result
    }
    /// Repair in light of what the validator saw: a `base_missing` event skips the base read
    ///
    /// [FixerConsumer] doesn't use this; it always re-reads the base through [fix](Self::fix),
    /// since the row may have reappeared since the event was published.
    pub async fn fix_event(&self, event: &InconsistentEvent) -> Result<()> {
        match event.kind {
            EventType::Neq | EventType::TargetMissing => self.fix(event.id).await,
            EventType::BaseMissing => self.delete(event.id).await.inspect_err(|_| {
                counter_add!(self.instruments, "fixer.failures", 1, &[]);
            }),
        }
    }
    async fn upsert(&self, entity: &T) -> Result<()> {
        self.target
            .upsert(entity, &self.columns)
            .await
            .context(WriteSnafu {
                store: self.target.name(),
                id: entity.id(),
            })?;
        counter_add!(
            self.instruments,
            "fixer.upserts",
            1,
            &[KeyValue::new("target", self.target.name().to_owned())]
        );
        Ok(())
    }
    async fn delete(&self, id: i64) -> Result<()> {
        let removed = self.target.delete(id).await.context(WriteSnafu {
            store: self.target.name(),
            id,
        })?;
        counter_add!(
            self.instruments,
            "fixer.deletes",
            removed,
            &[KeyValue::new("target", self.target.name().to_owned())]
        );
        Ok(())
    }
}

/// Consume [InconsistentEvent]s by repairing whichever store was the target when they were found
pub struct FixerConsumer<T: Entity> {
    src_first: OverrideFixer<T>,
    dst_first: OverrideFixer<T>,
}

impl<T: Entity> FixerConsumer<T> {
    pub async fn new(
        src: Arc<dyn Store<T>>,
        dst: Arc<dyn Store<T>>,
        instruments: Arc<Instruments>,
    ) -> Result<FixerConsumer<T>> {
        Ok(FixerConsumer {
            src_first: OverrideFixer::new(src.clone(), dst.clone(), instruments.clone()).await?,
            dst_first: OverrideFixer::new(dst, src, instruments).await?,
        })
    }
    pub fn fixer(&self, direction: Direction) -> &OverrideFixer<T> {
        match direction {
            Direction::Src => &self.src_first,
            Direction::Dst => &self.dst_first,
        }
    }
}

#[async_trait]
impl<T: Entity> Handler for FixerConsumer<T> {
    async fn handle(&self, event: InconsistentEvent) -> events::Result<()> {
        self.fixer(event.direction)
            .fix(event.id)
            .await
            .map_err(events::Error::new)?;
        info!(id = event.id, direction = %event.direction, kind = %event.kind, "Repaired");
        Ok(())
    }
}
