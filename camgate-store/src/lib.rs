//! In-process shared store: the coordination substrate between the pipeline
//! stages and their consumers.
//!
//! Four primitives, all keyed by string:
//! - plain values (bytes),
//! - string→string maps (device settings written by external consumers),
//! - bounded append-only streams with millisecond-prefixed monotonic ids,
//! - pub/sub channels.
//!
//! Streams provide atomic append and atomic exclusive-lower-bound range
//! reads, so readers and the single writer never need read-modify-write.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, bail, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Stream entry id: wall-clock milliseconds at insertion plus a store-wide
/// counter breaking ties within one millisecond. Ordering is lexicographic,
/// so ids assigned by one store are strictly increasing per stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SeqId {
    pub ms: i64,
    pub seq: u64,
}

impl SeqId {
    pub const ZERO: SeqId = SeqId { ms: 0, seq: 0 };

    pub fn new(ms: i64, seq: u64) -> SeqId {
        SeqId { ms, seq }
    }

    /// The largest id strictly smaller than `self`. Range reads are
    /// exclusive in their lower bound, so seeking to `id.prev_tick()`
    /// makes the entry at `id` itself the first one returned.
    pub fn prev_tick(self) -> SeqId {
        if self.seq > 0 {
            SeqId { ms: self.ms, seq: self.seq - 1 }
        } else {
            SeqId { ms: self.ms - 1, seq: u64::MAX }
        }
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for SeqId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<SeqId> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("malformed sequence id '{s}'"))?;
        Ok(SeqId { ms: ms.parse()?, seq: seq.parse()? })
    }
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<(SeqId, Vec<u8>)>,
}

impl StreamState {
    fn last_id(&self) -> SeqId {
        self.entries.back().map(|(id, _)| *id).unwrap_or(SeqId::ZERO)
    }

    fn push(&mut self, id: SeqId, payload: Vec<u8>, maxlen: usize) {
        self.entries.push_back((id, payload));
        while self.entries.len() > maxlen {
            self.entries.pop_front();
        }
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Vec<u8>>,
    maps: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, StreamState>,
    channels: HashMap<String, Vec<Sender<Vec<u8>>>>,
    /// Store-wide id counter; combined with a non-decreasing millisecond
    /// clock this totally orders all appends.
    seq: u64,
    last_ms: i64,
}

impl Inner {
    fn next_id(&mut self) -> SeqId {
        self.last_ms = self.last_ms.max(camgate_util::time::now_ms());
        self.seq += 1;
        SeqId { ms: self.last_ms, seq: self.seq }
    }
}

/// Handle to the shared store. Cheap to clone; all clones see the same data.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("shared store lock poisoned"))
    }

    pub fn now_ms(&self) -> i64 {
        camgate_util::time::now_ms()
    }

    // ── values ──

    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock()?.values.insert(key.to_owned(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.values.get(key).cloned())
    }

    pub fn del(&self, key: &str) -> Result<()> {
        self.lock()?.values.remove(key);
        Ok(())
    }

    // ── maps ──

    pub fn map_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.lock()?
            .maps
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn map_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.lock()?.maps.get(key).cloned().unwrap_or_default())
    }

    // ── streams ──

    /// Appends to a bounded stream, trimming the oldest entries beyond
    /// `maxlen`. Returns the assigned id.
    pub fn stream_append(&self, key: &str, payload: Vec<u8>, maxlen: usize) -> Result<SeqId> {
        let mut inner = self.lock()?;
        let id = inner.next_id();
        inner
            .streams
            .entry(key.to_owned())
            .or_default()
            .push(id, payload, maxlen);
        Ok(id)
    }

    /// Appends with a caller-chosen id, which must exceed the stream's last
    /// id. Lets a secondary stream index entries of a primary one by id.
    pub fn stream_append_at(
        &self,
        key: &str,
        id: SeqId,
        payload: Vec<u8>,
        maxlen: usize,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let stream = inner.streams.entry(key.to_owned()).or_default();
        let last = stream.last_id();
        if id <= last {
            bail!("stream '{key}': id {id} not after last id {last}");
        }
        stream.push(id, payload, maxlen);
        Ok(())
    }

    /// Range read with exclusive lower bound: entries with id > `after`,
    /// oldest first, at most `count`.
    pub fn stream_read_after(
        &self,
        key: &str,
        after: SeqId,
        count: usize,
    ) -> Result<Vec<(SeqId, Vec<u8>)>> {
        let inner = self.lock()?;
        let Some(stream) = inner.streams.get(key) else {
            return Ok(Vec::new());
        };
        Ok(stream
            .entries
            .iter()
            .filter(|(id, _)| *id > after)
            .take(count)
            .cloned()
            .collect())
    }

    pub fn stream_all(&self, key: &str) -> Result<Vec<(SeqId, Vec<u8>)>> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(key)
            .map(|s| s.entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn stream_len(&self, key: &str) -> Result<usize> {
        Ok(self.lock()?.streams.get(key).map(|s| s.entries.len()).unwrap_or(0))
    }

    /// Removes and returns the oldest entry. This is how the single reader
    /// of a hand-off stream drains it.
    pub fn stream_pop(&self, key: &str) -> Result<Option<(SeqId, Vec<u8>)>> {
        let mut inner = self.lock()?;
        Ok(inner
            .streams
            .get_mut(key)
            .and_then(|s| s.entries.pop_front()))
    }

    pub fn stream_delete(&self, key: &str) -> Result<()> {
        self.lock()?.streams.remove(key);
        Ok(())
    }

    // ── pub/sub ──

    /// Delivers to every current subscriber; returns how many received it.
    pub fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(subscribers) = inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        Ok(subscribers.len())
    }

    pub fn subscribe(&self, channel: &str) -> Result<Receiver<Vec<u8>>> {
        let (tx, rx) = unbounded();
        self.lock()?
            .channels
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
