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

//! An in-process event bus.
//!
//! Nothing survives a restart, but for a single-process deployment (or a test) that's fine: the
//! validator will simply find the same inconsistencies again on its next pass.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use super::{InconsistentEvent, Producer, Receiver, Redelivery, Result};

#[derive(Debug)]
struct Message {
    id: u64,
    buf: Vec<u8>,
    attempts: u32,
    /// A released message isn't handed out again before this
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    next: u64,
    queue: VecDeque<Message>,
    inflight: HashMap<u64, Message>,
    redeliveries: usize,
}

#[derive(Debug, Default)]
pub struct MemoryBus {
    state: Mutex<State>,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }
    /// Enqueue a payload as-is; useful for exercising consumers with malformed messages
    pub async fn publish_raw(&self, buf: Vec<u8>) {
        let mut state = self.state.lock().await;
        let id = state.next;
        state.next += 1;
        state.queue.push_back(Message {
            id,
            buf,
            attempts: 0,
            not_before: None,
        });
    }
    /// Number of messages waiting to be taken
    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }
    /// Number of messages taken but not yet settled
    pub async fn inflight(&self) -> usize {
        self.state.lock().await.inflight.len()
    }
    /// True when every message ever published has been acknowledged
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.queue.is_empty() && state.inflight.is_empty()
    }
    pub async fn redeliveries(&self) -> usize {
        self.state.lock().await.redeliveries
    }
    /// Remove & decode everything waiting, without going through the take/ack protocol
    pub async fn drain(&self) -> Vec<InconsistentEvent> {
        self.state
            .lock()
            .await
            .queue
            .drain(..)
            .filter_map(|msg| InconsistentEvent::from_json(&msg.buf).ok())
            .collect()
    }
}

#[async_trait]
impl Producer for MemoryBus {
    async fn produce(&self, event: &InconsistentEvent) -> Result<()> {
        self.publish_raw(event.to_json()?).await;
        Ok(())
    }
}

#[async_trait]
impl Receiver for MemoryBus {
    type Cookie = u64;
    async fn take(&self) -> Result<Option<(Vec<u8>, Self::Cookie)>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let ready = state
            .queue
            .iter()
            .position(|msg| msg.not_before.is_none_or(|t| t <= now));
        let Some(mut msg) = ready.and_then(|idx| state.queue.remove(idx)) else {
            return Ok(None);
        };
        msg.attempts += 1;
        let (id, buf) = (msg.id, msg.buf.clone());
        state.inflight.insert(id, msg);
        Ok(Some((buf, id)))
    }
    async fn ack(&self, cookie: Self::Cookie) -> Result<()> {
        self.state.lock().await.inflight.remove(&cookie);
        Ok(())
    }
    async fn nack(&self, cookie: Self::Cookie, redelivery: &Redelivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(mut msg) = state.inflight.remove(&cookie) {
            msg.not_before = Some(Instant::now() + redelivery.delay(msg.attempts));
            state.queue.push_back(msg);
            state.redeliveries += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::events::{Direction, EventType};

    #[tokio::test]
    async fn take_and_settle() {
        let bus = MemoryBus::new();
        bus.produce(&InconsistentEvent::new(1, Direction::Src, EventType::Neq))
            .await
            .unwrap();
        bus.produce(&InconsistentEvent::new(2, Direction::Src, EventType::Neq))
            .await
            .unwrap();

        let (buf, first) = bus.take().await.unwrap().unwrap();
        assert_eq!(InconsistentEvent::from_json(&buf).unwrap().id, 1);
        assert_eq!((bus.pending().await, bus.inflight().await), (1, 1));

        // A nack'd message goes to the back of the line
        bus.nack(first, &Redelivery::immediate()).await.unwrap();
        let (buf, second) = bus.take().await.unwrap().unwrap();
        assert_eq!(InconsistentEvent::from_json(&buf).unwrap().id, 2);
        bus.ack(second).await.unwrap();
        let (buf, first) = bus.take().await.unwrap().unwrap();
        assert_eq!(InconsistentEvent::from_json(&buf).unwrap().id, 1);
        bus.ack(first).await.unwrap();

        assert!(bus.take().await.unwrap().is_none());
        assert!(bus.is_drained().await);
        assert_eq!(bus.redeliveries().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn released_messages_are_held_back() {
        let bus = MemoryBus::new();
        let redelivery = Redelivery {
            min: Duration::from_millis(100),
            max: Duration::from_millis(150),
        };
        bus.produce(&InconsistentEvent::new(1, Direction::Src, EventType::Neq))
            .await
            .unwrap();

        let (_, cookie) = bus.take().await.unwrap().unwrap();
        bus.nack(cookie, &redelivery).await.unwrap();
        assert!(bus.take().await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(101)).await;
        let (_, cookie) = bus.take().await.unwrap().unwrap();

        // The second failure doubles the delay, up to the cap
        bus.nack(cookie, &redelivery).await.unwrap();
        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(bus.take().await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(31)).await;
        assert!(bus.take().await.unwrap().is_some());
    }
}
