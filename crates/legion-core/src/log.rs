// SPDX-License-Identifier: Apache-2.0
//! A fixed-capacity ring buffer of I/O events, used to surface faults and
//! delivery errors to the owning user without keeping unbounded history.

use crate::coord::Coord;
use crate::save::{Reader, SaveError, Writer};

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Tick at which this event was recorded.
    pub time: u64,
    /// The chunk this event concerns.
    pub star: Coord,
    /// The item (machine) involved, packed as in [`crate::item::ItemId`].
    pub id: u16,
    /// The I/O operation kind (`io_send`, `io_recv`, `io_arrive`, ...).
    pub io: u16,
    /// The error code, or `0` for a non-error event.
    pub err: u16,
}

impl Record {
    /// Whether this record represents an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.err != 0
    }
}

/// A fixed-capacity ring of [`Record`]s. Pushing past capacity silently
/// overwrites the oldest entry.
#[derive(Debug, Clone)]
pub struct Log {
    items: Vec<Option<Record>>,
    cap: usize,
    next: u64,
}

impl Log {
    /// Construct an empty log with room for `cap` records.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            items: vec![None; cap.max(1)],
            cap: cap.max(1),
            next: 0,
        }
    }

    /// Record one event, overwriting the oldest slot once full.
    pub fn push(&mut self, time: u64, star: Coord, id: u16, io: u16, err: u16) {
        let idx = (self.next as usize) % self.cap;
        self.items[idx] = Some(Record {
            time,
            star,
            id,
            io,
            err,
        });
        self.next += 1;
    }

    /// Number of records ever pushed (not bounded by capacity).
    #[must_use]
    pub const fn pushed(&self) -> u64 {
        self.next
    }

    /// Walk recorded events most-recent-first, yielding only errors, until
    /// the ring wraps back to where iteration started.
    pub fn errors(&self) -> impl Iterator<Item = &Record> {
        let len = self.items.len();
        let start = self.next as usize;
        (1..=len.min(self.next as usize)).filter_map(move |back| {
            let idx = (start + len - back) % len;
            self.items[idx].as_ref().filter(|r| r.is_error())
        })
    }

    /// Write this ring's full contents (including empty slots, to preserve
    /// wrap position), unframed.
    pub fn encode(&self, w: &mut Writer) {
        w.write_u64(self.cap as u64);
        w.write_u64(self.next);
        for slot in &self.items {
            match slot {
                Some(r) => {
                    w.write_u8(1);
                    w.write_u64(r.time);
                    w.write_u64(r.star.to_u64());
                    w.write_u16(r.id);
                    w.write_u16(r.io);
                    w.write_u16(r.err);
                }
                None => w.write_u8(0),
            }
        }
    }

    /// Read a ring previously written by [`Self::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on truncated data.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, SaveError> {
        let cap = r.read_u64()? as usize;
        let next = r.read_u64()?;
        let mut items = Vec::with_capacity(cap.max(1));
        for _ in 0..cap.max(1) {
            if r.read_u8()? == 1 {
                let time = r.read_u64()?;
                let star = Coord::from_u64(r.read_u64()?);
                let id = r.read_u16()?;
                let io = r.read_u16()?;
                let err = r.read_u16()?;
                items.push(Some(Record {
                    time,
                    star,
                    id,
                    io,
                    err,
                }));
            } else {
                items.push(None);
            }
        }
        Ok(Self {
            items,
            cap: cap.max(1),
            next,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrips_including_wrap() {
        let mut log = Log::new(2);
        log.push(1, Coord::new(0, 0), 1, 1, 0);
        log.push(2, Coord::new(1, 1), 2, 1, 5);
        log.push(3, Coord::new(2, 2), 3, 1, 0);

        let mut w = Writer::new();
        log.encode(&mut w);
        let buf = w.into_inner();
        let mut r = Reader::new(&buf);
        let decoded = Log::decode(&mut r).unwrap();

        assert_eq!(decoded.pushed(), log.pushed());
        assert_eq!(
            decoded.errors().map(|rec| rec.time).collect::<Vec<_>>(),
            log.errors().map(|rec| rec.time).collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_log_has_no_errors() {
        let log = Log::new(4);
        assert_eq!(log.errors().count(), 0);
    }

    #[test]
    fn errors_walks_most_recent_first() {
        let mut log = Log::new(4);
        log.push(1, Coord::new(0, 0), 1, 1, 0);
        log.push(2, Coord::new(0, 0), 2, 1, 7);
        log.push(3, Coord::new(0, 0), 3, 1, 0);
        log.push(4, Coord::new(0, 0), 4, 1, 9);

        let errs: Vec<_> = log.errors().map(|r| r.time).collect();
        assert_eq!(errs, vec![4, 2]);
    }

    #[test]
    fn push_past_capacity_overwrites_oldest() {
        let mut log = Log::new(2);
        log.push(1, Coord::new(0, 0), 1, 1, 1);
        log.push(2, Coord::new(0, 0), 2, 1, 1);
        log.push(3, Coord::new(0, 0), 3, 1, 1);

        let times: Vec<_> = log.errors().map(|r| r.time).collect();
        assert_eq!(times, vec![3, 2]);
    }
}
