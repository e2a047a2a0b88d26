// SPDX-License-Identifier: Apache-2.0
//! Chunk logistics: producer/consumer matching via a fixed worker pool.

use crate::item::{InState, ItemId, Ports};
use crate::save::{Reader, SaveError, Writer};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

fn write_opt_item(w: &mut Writer, slot: Option<ItemId>) {
    match slot {
        Some(id) => {
            w.write_u8(1);
            w.write_u16(id.to_u16());
        }
        None => w.write_u8(0),
    }
}

fn read_opt_item(r: &mut Reader<'_>) -> Result<Option<ItemId>, SaveError> {
    if r.read_u8()? == 1 {
        Ok(Some(ItemId::from_u16(r.read_u16()?)))
    } else {
        Ok(None)
    }
}

fn write_queue(w: &mut Writer, queue: &VecDeque<Option<ItemId>>) {
    w.write_u32(queue.len() as u32);
    for &slot in queue {
        write_opt_item(w, slot);
    }
}

fn read_queue(r: &mut Reader<'_>) -> Result<VecDeque<Option<ItemId>>, SaveError> {
    let len = r.read_u32()?;
    let mut queue = VecDeque::with_capacity(len as usize);
    for _ in 0..len {
        queue.push_back(read_opt_item(r)?);
    }
    Ok(queue)
}

fn write_ports(w: &mut Writer, ports: &Ports) {
    write_opt_u16(w, ports.out);
    match ports.in_state {
        InState::Nil => w.write_u8(0),
        InState::Requested(item) => {
            w.write_u8(1);
            w.write_u16(item);
        }
        InState::Received(item) => {
            w.write_u8(2);
            w.write_u16(item);
        }
    }
}

fn read_ports(r: &mut Reader<'_>) -> Result<Ports, SaveError> {
    let out = read_opt_u16(r)?;
    let in_state = match r.read_u8()? {
        1 => InState::Requested(r.read_u16()?),
        2 => InState::Received(r.read_u16()?),
        _ => InState::Nil,
    };
    Ok(Ports { out, in_state })
}

fn write_opt_u16(w: &mut Writer, value: Option<u16>) {
    match value {
        Some(v) => {
            w.write_u8(1);
            w.write_u16(v);
        }
        None => w.write_u8(0),
    }
}

fn read_opt_u16(r: &mut Reader<'_>) -> Result<Option<u16>, SaveError> {
    if r.read_u8()? == 1 {
        Ok(Some(r.read_u16()?))
    } else {
        Ok(None)
    }
}

/// The resource/item kind transferred through a port, distinct from the
/// instance id of the machine producing or consuming it.
pub type Resource = u16;

/// Per-tick worker accounting: every worker slot is accounted for exactly
/// once, as `ops.len() + idle + fail + clean == count`.
#[derive(Debug, Clone, Default)]
pub struct Workers {
    /// Number of workers available this tick.
    pub count: u32,
    /// Matched `(producer, consumer)` pairs, in match order.
    pub ops: Vec<(ItemId, ItemId)>,
    /// Length of the `requested` queue at the start of the step.
    pub queue: u32,
    /// Workers left idle (ran out of queued consumers).
    pub idle: u32,
    /// Failed match attempts (consumer re-enqueued).
    pub fail: u32,
    /// Workers that popped an already-cleared (reset) queue entry.
    pub clean: u32,
}

/// The per-chunk port state: a `provided` FIFO per resource, plus the
/// `requested`/`storage` consumer FIFOs.
///
/// Invariant: every active id appears in at most one of `provided[*]`,
/// `requested`, `storage` at any moment (enforced by `ports_reset` before
/// any other port call re-registers it).
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    provided: FxHashMap<Resource, VecDeque<Option<ItemId>>>,
    requested: VecDeque<Option<ItemId>>,
    storage: VecDeque<Option<ItemId>>,
    ports: FxHashMap<ItemId, Ports>,
    /// Active-item kinds whose instances are storage consumers: matches
    /// between two storage instances are suppressed (storage-to-storage
    /// transfers add noise without moving goods closer to use).
    storage_kinds: FxHashSet<u8>,
    /// Worker pool and its per-tick accounting.
    pub workers: Workers,
}

impl Chunk {
    /// Construct a chunk with `worker_count` workers and the given set of
    /// active-item kinds considered "storage."
    #[must_use]
    pub fn new(worker_count: u32, storage_kinds: FxHashSet<u8>) -> Self {
        Self {
            workers: Workers {
                count: worker_count,
                ..Workers::default()
            },
            storage_kinds,
            ..Self::default()
        }
    }

    fn is_storage(&self, id: ItemId) -> bool {
        self.storage_kinds.contains(&id.kind)
    }

    fn ports_mut(&mut self, id: ItemId) -> &mut Ports {
        self.ports.entry(id).or_default()
    }

    /// Offer `resource` for pickup from `id`. Idempotent: a second call
    /// while `out` is already occupied is a no-op and returns `false`.
    pub fn ports_produce(&mut self, id: ItemId, resource: Resource) -> bool {
        let ports = self.ports_mut(id);
        if ports.out.is_some() {
            return false;
        }
        ports.out = Some(resource);
        self.provided.entry(resource).or_default().push_back(Some(id));
        true
    }

    /// Whether `id`'s `out` slot has been cleared by a completed match.
    #[must_use]
    pub fn ports_consumed(&self, id: ItemId) -> bool {
        self.ports.get(&id).is_none_or(|p| p.out.is_none())
    }

    /// Request `resource` be delivered to `id`. Rejects (no-op, returns
    /// `false`) whenever `id` already has a request or an unconsumed
    /// delivery pending, regardless of which resource it names.
    pub fn ports_request(&mut self, id: ItemId, resource: Resource) -> bool {
        let is_storage = self.is_storage(id);
        let ports = self.ports_mut(id);
        if ports.in_state != InState::Nil {
            return false;
        }
        ports.in_state = InState::Requested(resource);
        let queue = if is_storage {
            &mut self.storage
        } else {
            &mut self.requested
        };
        queue.push_back(Some(id));
        true
    }

    /// Take the received resource, if `in_state == Received`, clearing the
    /// slot. Returns `None` (including on a second call) otherwise.
    pub fn ports_consume(&mut self, id: ItemId) -> Option<Resource> {
        let ports = self.ports.get_mut(&id)?;
        if let InState::Received(resource) = ports.in_state {
            ports.in_state = InState::Nil;
            Some(resource)
        } else {
            None
        }
    }

    /// Remove `id` from whichever producer/consumer queue it inhabits and
    /// clear both of its port slots.
    pub fn ports_reset(&mut self, id: ItemId) {
        let is_storage = self.is_storage(id);
        let Some(ports) = self.ports.get(&id).copied() else {
            return;
        };

        if let InState::Requested(_) = ports.in_state {
            let queue = if is_storage {
                &mut self.storage
            } else {
                &mut self.requested
            };
            clear_entry(queue, id);
        }

        if let Some(resource) = ports.out {
            if let Some(queue) = self.provided.get_mut(&resource) {
                clear_entry(queue, id);
            }
        }

        self.ports.remove(&id);
    }

    /// Run one tick of producer/consumer matching: drains `requested` then
    /// `storage`, one match attempt per available worker.
    pub fn ports_step(&mut self) {
        self.workers.ops.clear();
        self.workers.idle = 0;
        self.workers.fail = 0;
        self.workers.clean = 0;
        self.workers.queue = self.requested.len() as u32;

        let mut worker = 0;
        let mut stop = None;
        while worker < self.workers.count {
            if !self.step_queue(Queue::Requested, &mut stop) {
                break;
            }
            worker += 1;
        }

        stop = None;
        while worker < self.workers.count {
            if !self.step_queue(Queue::Storage, &mut stop) {
                break;
            }
            worker += 1;
        }

        self.workers.idle = self.workers.count - worker;
    }

    /// One worker's attempt against `queue`. Returns `false` when the
    /// queue is empty or a full cycle without progress has been detected
    /// (`stop` re-appears at the head), meaning the worker goes idle.
    fn step_queue(&mut self, queue: Queue, stop: &mut Option<ItemId>) -> bool {
        let q = self.queue_mut(queue);
        if q.is_empty() {
            return false;
        }
        if let (Some(stop_id), Some(Some(head))) = (*stop, q.front()) {
            if stop_id == *head {
                return false;
            }
        }

        let Some(dst) = self.queue_mut(queue).pop_front().flatten() else {
            self.workers.clean += 1;
            return true;
        };

        let resource = match self.ports.get(&dst).map(|p| p.in_state) {
            Some(InState::Requested(resource)) => resource,
            _ => unreachable!("queued id must be in Requested state"),
        };

        let Some(provided) = self.provided.get_mut(&resource) else {
            self.nomatch(queue, dst, stop);
            return true;
        };
        if provided.is_empty() {
            self.nomatch(queue, dst, stop);
            return true;
        }

        let Some(src) = provided.pop_front().flatten() else {
            self.workers.clean += 1;
            self.nomatch(queue, dst, stop);
            return true;
        };

        // storage-to-storage transfers add noise; suppress and re-queue the
        // producer side so it is matched by a non-storage consumer later.
        if self.is_storage(src) && self.is_storage(dst) {
            if let Some(provided) = self.provided.get_mut(&resource) {
                provided.push_back(Some(src));
            }
            self.nomatch(queue, dst, stop);
            return true;
        }

        if let Some(out) = self.ports.get_mut(&src) {
            out.out = None;
        }
        if let Some(in_) = self.ports.get_mut(&dst) {
            in_.in_state = InState::Received(resource);
        }
        self.workers.ops.push((src, dst));
        true
    }

    fn nomatch(&mut self, queue: Queue, dst: ItemId, stop: &mut Option<ItemId>) {
        self.queue_mut(queue).push_back(Some(dst));
        if stop.is_none() {
            *stop = Some(dst);
        }
        self.workers.fail += 1;
    }

    fn queue_mut(&mut self, queue: Queue) -> &mut VecDeque<Option<ItemId>> {
        match queue {
            Queue::Requested => &mut self.requested,
            Queue::Storage => &mut self.storage,
        }
    }

    /// Write this chunk's full port/worker state, unframed.
    pub fn encode(&self, w: &mut Writer) {
        w.write_u32(self.provided.len() as u32);
        for (&resource, queue) in &self.provided {
            w.write_u16(resource);
            write_queue(w, queue);
        }
        write_queue(w, &self.requested);
        write_queue(w, &self.storage);
        w.write_u32(self.ports.len() as u32);
        for (&id, ports) in &self.ports {
            w.write_u16(id.to_u16());
            write_ports(w, ports);
        }
        w.write_u32(self.storage_kinds.len() as u32);
        for &kind in &self.storage_kinds {
            w.write_u8(kind);
        }
        w.write_u32(self.workers.count);
        w.write_u32(self.workers.ops.len() as u32);
        for &(src, dst) in &self.workers.ops {
            w.write_u16(src.to_u16());
            w.write_u16(dst.to_u16());
        }
        w.write_u32(self.workers.queue);
        w.write_u32(self.workers.idle);
        w.write_u32(self.workers.fail);
        w.write_u32(self.workers.clean);
    }

    /// Read a chunk previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        let provided_count = r.read_u32()?;
        let mut provided = FxHashMap::default();
        for _ in 0..provided_count {
            let resource = r.read_u16()?;
            provided.insert(resource, read_queue(r)?);
        }
        let requested = read_queue(r)?;
        let storage = read_queue(r)?;
        let ports_count = r.read_u32()?;
        let mut ports = FxHashMap::default();
        for _ in 0..ports_count {
            let id = ItemId::from_u16(r.read_u16()?);
            ports.insert(id, read_ports(r)?);
        }
        let kind_count = r.read_u32()?;
        let mut storage_kinds = FxHashSet::default();
        for _ in 0..kind_count {
            storage_kinds.insert(r.read_u8()?);
        }
        let count = r.read_u32()?;
        let op_count = r.read_u32()?;
        let mut ops = Vec::with_capacity(op_count as usize);
        for _ in 0..op_count {
            let src = ItemId::from_u16(r.read_u16()?);
            let dst = ItemId::from_u16(r.read_u16()?);
            ops.push((src, dst));
        }
        let queue = r.read_u32()?;
        let idle = r.read_u32()?;
        let fail = r.read_u32()?;
        let clean = r.read_u32()?;
        Ok(Self {
            provided,
            requested,
            storage,
            ports,
            storage_kinds,
            workers: Workers {
                count,
                ops,
                queue,
                idle,
                fail,
                clean,
            },
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Queue {
    Requested,
    Storage,
}

fn clear_entry(queue: &mut VecDeque<Option<ItemId>>, id: ItemId) {
    if let Some(slot) = queue.iter_mut().find(|slot| **slot == Some(id)) {
        *slot = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const RESOURCE_X: Resource = 1;
    const RESOURCE_Y: Resource = 2;

    #[test]
    fn encode_decode_roundtrips_port_state() {
        let mut chunk = Chunk::new(2, FxHashSet::default());
        let producer = ItemId::instance(10, 1);
        let consumer = ItemId::instance(11, 1);
        chunk.ports_produce(producer, RESOURCE_X);
        chunk.ports_request(consumer, RESOURCE_X);
        chunk.ports_step();

        let mut w = Writer::new();
        chunk.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let mut decoded = Chunk::decode(&mut r).unwrap();

        assert_eq!(decoded.ports_consumed(producer), chunk.ports_consumed(producer));
        assert_eq!(decoded.ports_consume(consumer), chunk.ports_consume(consumer));
        assert_eq!(decoded.workers.count, chunk.workers.count);
    }

    /// S3 — one producer, one consumer, one worker: a single match, port
    /// consume returns the item then nil.
    #[test]
    fn s3_ports_matching() {
        let mut chunk = Chunk::new(1, FxHashSet::default());
        let producer = ItemId::instance(10, 1);
        let consumer = ItemId::instance(11, 1);

        assert!(chunk.ports_produce(producer, RESOURCE_X));
        chunk.ports_request(consumer, RESOURCE_X);

        chunk.ports_step();

        assert_eq!(chunk.workers.ops.len(), 1);
        assert!(chunk.ports_consumed(producer));
        assert_eq!(chunk.ports_consume(consumer), Some(RESOURCE_X));
        assert_eq!(chunk.ports_consume(consumer), None);
    }

    /// S4 — two storage instances never match each other.
    #[test]
    fn s4_storage_to_storage_suppressed() {
        let mut storage_kinds = FxHashSet::default();
        storage_kinds.insert(20);
        let mut chunk = Chunk::new(1, storage_kinds);

        let a = ItemId::instance(20, 1);
        let b = ItemId::instance(20, 2);
        chunk.ports_produce(a, RESOURCE_X);
        chunk.ports_request(b, RESOURCE_X);

        chunk.ports_step();

        assert!(chunk.workers.ops.is_empty());
        assert_eq!(chunk.workers.fail, 1);
        assert!(!chunk.ports_consumed(a));
        assert_eq!(chunk.ports_consume(b), None);
    }

    #[test]
    fn worker_accounting_sums_to_count() {
        let mut chunk = Chunk::new(3, FxHashSet::default());
        let producer = ItemId::instance(10, 1);
        let consumer = ItemId::instance(11, 1);
        chunk.ports_produce(producer, RESOURCE_X);
        chunk.ports_request(consumer, RESOURCE_X);

        chunk.ports_step();

        let w = &chunk.workers;
        assert_eq!(w.ops.len() as u32 + w.idle + w.fail + w.clean, w.count);
    }

    #[test]
    fn request_is_idempotent_on_repeat() {
        let mut chunk = Chunk::new(1, FxHashSet::default());
        let consumer = ItemId::instance(11, 1);
        assert!(chunk.ports_request(consumer, RESOURCE_X));
        assert!(!chunk.ports_request(consumer, RESOURCE_X));
        assert_eq!(chunk.requested.len(), 1);
    }

    #[test]
    fn request_rejects_different_resource_while_pending() {
        let mut chunk = Chunk::new(1, FxHashSet::default());
        let consumer = ItemId::instance(11, 1);
        assert!(chunk.ports_request(consumer, RESOURCE_X));
        assert!(!chunk.ports_request(consumer, RESOURCE_Y));
        assert_eq!(chunk.requested.len(), 1);
    }

    #[test]
    fn reset_removes_from_queue_and_clears_slots() {
        let mut chunk = Chunk::new(1, FxHashSet::default());
        let consumer = ItemId::instance(11, 1);
        chunk.ports_request(consumer, RESOURCE_X);
        chunk.ports_reset(consumer);
        chunk.ports_step();
        assert_eq!(chunk.workers.clean, 1);
    }
}
