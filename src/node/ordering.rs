//! Total-order delivery: sequence assignment, gap buffering, dedup.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::Limits;
use crate::proto::{ChatRecord, SeqNo, Term};

use super::metrics;

/// What happened to an ingested SEQ_CHAT.
#[derive(Clone, Debug, PartialEq)]
pub enum Ingest {
    /// The record (and any contiguous buffered successors) is now
    /// deliverable, in order.
    Delivered(Vec<ChatRecord>),
    /// Out of order; parked until the gap fills.
    Buffered,
    /// Already seen this (seq_no, term), or already parked.
    Duplicate,
    /// At or below the delivered watermark.
    Stale,
    /// Gap buffer full; dropped. Catch-up heals the loss.
    Overflow,
}

/// Per-node ordering state. `last_seq` is the highest contiguously
/// delivered sequence number and advances on every delivery regardless of
/// role, so a promoted follower never reassigns a used seq_no.
#[derive(Clone, Debug)]
pub struct Ordering {
    last_seq: SeqNo,
    buffer: BTreeMap<SeqNo, ChatRecord>,
    delivered: BTreeSet<(SeqNo, Term)>,
    max_buffered: usize,
    dedup_window: u64,
}

impl Ordering {
    pub fn new(limits: &Limits) -> Self {
        Self {
            last_seq: SeqNo::ZERO,
            buffer: BTreeMap::new(),
            delivered: BTreeSet::new(),
            max_buffered: limits.max_buffered_messages,
            dedup_window: limits.dedup_window,
        }
    }

    pub fn last_seq(&self) -> SeqNo {
        self.last_seq
    }

    pub fn next_expected(&self) -> SeqNo {
        self.last_seq.next()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Seed state from a record recovered out of the log. Loaded records
    /// are already delivered; they only move the watermark and the dedup
    /// set.
    pub fn recover(&mut self, seq_no: SeqNo, term: Term) {
        if seq_no > self.last_seq {
            self.last_seq = seq_no;
        }
        self.delivered.insert((seq_no, term));
        self.prune_dedup();
    }

    pub fn ingest(&mut self, record: ChatRecord) -> Ingest {
        let key = (record.seq_no, record.term);
        if self.delivered.contains(&key) {
            metrics::dropped("duplicate");
            return Ingest::Duplicate;
        }
        if record.seq_no <= self.last_seq {
            metrics::dropped("gap_stale");
            return Ingest::Stale;
        }

        if record.seq_no == self.next_expected() {
            let mut batch = Vec::new();
            self.mark_delivered(&record);
            batch.push(record);
            while let Some(next) = self.buffer.remove(&self.next_expected()) {
                self.mark_delivered(&next);
                batch.push(next);
            }
            return Ingest::Delivered(batch);
        }

        // seq_no > next_expected: park it.
        if self.buffer.contains_key(&record.seq_no) {
            metrics::dropped("duplicate");
            return Ingest::Duplicate;
        }
        if self.buffer.len() >= self.max_buffered {
            metrics::dropped("buffer_overflow");
            return Ingest::Overflow;
        }
        tracing::debug!(
            seq_no = record.seq_no.get(),
            expected = self.next_expected().get(),
            "buffered out-of-order message"
        );
        self.buffer.insert(record.seq_no, record);
        Ingest::Buffered
    }

    fn mark_delivered(&mut self, record: &ChatRecord) {
        self.delivered.insert((record.seq_no, record.term));
        self.last_seq = record.seq_no;
        self.prune_dedup();
    }

    fn prune_dedup(&mut self) {
        let floor = self.last_seq.get().saturating_sub(self.dedup_window);
        while let Some(&(seq, term)) = self.delivered.first() {
            if seq.get() >= floor {
                break;
            }
            self.delivered.remove(&(seq, term));
        }
    }
}
