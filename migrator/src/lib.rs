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

//! # migrator
//!
//! Move a live table from one MySQL instance to another without downtime.
//!
//! Application traffic flows through a [DualWritePool](dual_write::DualWritePool), which mirrors
//! writes across the source & destination according to a runtime-switchable
//! [Pattern](migrator_shared::Pattern). Meanwhile, a [Validator](validator::Validator) compares
//! the two stores batch by batch & publishes an [InconsistentEvent](events::InconsistentEvent) for
//! every row that disagrees; a [FixerConsumer](fixer::FixerConsumer) repairs each one by
//! overwriting the target with the base. The [scheduler] ties it all together behind an HTTP
//! control plane.
pub mod dual_write;
pub mod entities;
pub mod events;
pub mod fixer;
pub mod memory;
pub mod metrics;
pub mod mysql;
pub mod scheduler;
pub mod sql;
pub mod store;
pub mod validator;
