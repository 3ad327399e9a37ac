//! The mapping cache: alignment groups kept from the first pass so later
//! rounds can replay them without re-running the aligner.
//!
//! During the first round a writer thread drains groups completed by the
//! workers, appends them to a per-library file and hands them back to the
//! buffer pool. Later rounds replay the file through a [`CacheFile`], either
//!
//! * on disk, with a reader thread streaming records into a bounded queue
//!   that is refilled from a fixed pool of recycled groups, or
//! * in memory, where the whole cache is read once and thereafter the
//!   processed groups are handed straight back as the next round's input.
//!
//! Records are a little-endian `u32` length followed by the CBOR encoding of
//! the group, inside a snappy frame stream.
//!
//! Queues are [`crossbeam_channel`] channels. A replay stream ends when its
//! producer drops the sending half.
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::alignment::AlignmentGroup;
use crate::error::QuantError;

/// A queue of recycled alignment groups.
///
/// The queue holds both ends of its channel, so it never disconnects. Use
/// [`into_parts`](Self::into_parts) when the end of a stream must be signalled.
#[derive(Debug, Clone)]
pub struct GroupQueue {
    tx: Sender<AlignmentGroup>,
    rx: Receiver<AlignmentGroup>,
}

impl GroupQueue {
    /// An unbounded empty queue
    pub fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// A queue holding at most `cap` groups
    pub fn bounded(cap: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(cap);
        Self { tx, rx }
    }

    /// An unbounded queue prefilled with `n` empty groups
    pub fn with_groups(n: usize) -> Self {
        let queue = Self::unbounded();
        for _ in 0..n {
            queue.push(AlignmentGroup::new());
        }
        queue
    }

    /// Add a group, blocking while a bounded queue is full
    pub fn push(&self, group: AlignmentGroup) {
        // Cannot fail, the receiver lives as long as self
        let _ = self.tx.send(group);
    }

    /// Take a group if one is waiting
    pub fn try_pop(&self) -> Option<AlignmentGroup> {
        self.rx.try_recv().ok()
    }

    /// Take a group, blocking until one is available
    pub fn pop(&self) -> Option<AlignmentGroup> {
        self.rx.recv().ok()
    }

    /// Groups currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Sending half
    pub fn sender(&self) -> Sender<AlignmentGroup> {
        self.tx.clone()
    }

    /// Receiving half
    pub fn receiver(&self) -> Receiver<AlignmentGroup> {
        self.rx.clone()
    }

    /// Split into the two halves of the channel
    pub fn into_parts(self) -> (Sender<AlignmentGroup>, Receiver<AlignmentGroup>) {
        (self.tx, self.rx)
    }
}

/// Append one length-prefixed CBOR record for `group` to `writer`
pub fn write_group<W: Write>(writer: &mut W, group: &AlignmentGroup) -> std::io::Result<()> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(group, &mut buf)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    let len = u32::try_from(buf.len())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&buf)
}

/// Read the next record from `reader` into `group`.
///
/// Returns `Ok(false)` on a clean end of stream. A stream ending part way
/// through a record is an error.
pub fn read_group<R: Read>(reader: &mut R, group: &mut AlignmentGroup) -> std::io::Result<bool> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "truncated record length",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    *group = ciborium::de::from_reader(buf.as_slice())
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    Ok(true)
}

/// Drain completed groups to the cache file at `path`.
///
/// Every group received on `completed` is handed back on `pool` once it has
/// been dealt with. A group is written if `cache_unique` is set or it maps to
/// more than one transcript. Writing stops once `num_observed` exceeds
/// `num_required`, but groups keep being recycled until every sender on
/// `completed` has been dropped.
///
/// Returns the number of groups written.
pub fn write_alignment_cache(
    path: &Path,
    completed: Receiver<AlignmentGroup>,
    pool: Sender<AlignmentGroup>,
    cache_unique: bool,
    num_observed: &AtomicU64,
    num_required: u64,
) -> Result<u64, QuantError> {
    let cache_err = |e: std::io::Error| QuantError::CacheWrite {
        path: path.to_path_buf(),
        msg: e.to_string(),
    };
    let mut encoder = snap::write::FrameEncoder::new(BufWriter::new(
        File::create(path).map_err(cache_err)?,
    ));

    let mut num_written = 0;
    let mut writing = true;
    let mut first_err = None;
    for group in completed.iter() {
        if writing && (cache_unique || !group.is_uniquely_mapped()) {
            match write_group(&mut encoder, &group) {
                Ok(()) => num_written += 1,
                Err(e) => {
                    log::error!("Stopped writing mapping cache: {e}");
                    first_err = Some(cache_err(e));
                    writing = false;
                }
            }
        }
        let _ = pool.send(group);
        if writing && num_observed.load(Ordering::Relaxed) > num_required {
            log::debug!("Seen the required fragments, no longer writing the mapping cache");
            writing = false;
        }
    }
    encoder.flush().map_err(cache_err)?;

    match first_err {
        Some(err) => Err(err),
        None => Ok(num_written),
    }
}

/// Stream every record in the cache file at `path` onto `sink`.
///
/// Each record is read into a group taken from `source`, or a fresh group if
/// `source` has been disconnected. Stops early if `sink` is disconnected.
/// `sink` is dropped on return, which ends the stream for its receivers.
///
/// Returns the number of groups read.
pub fn read_alignment_cache(
    path: &Path,
    source: Receiver<AlignmentGroup>,
    sink: Sender<AlignmentGroup>,
) -> Result<u64, QuantError> {
    let cache_err = |e: std::io::Error| QuantError::CacheRead {
        path: path.to_path_buf(),
        msg: e.to_string(),
    };
    let mut decoder =
        snap::read::FrameDecoder::new(BufReader::new(File::open(path).map_err(cache_err)?));

    let mut num_read = 0;
    loop {
        let mut group = source.recv().unwrap_or_default();
        if !read_group(&mut decoder, &mut group).map_err(cache_err)? {
            break;
        }
        num_read += 1;
        if sink.send(group).is_err() {
            break;
        }
    }
    Ok(num_read)
}

/// Groups to process in a replay round, and where to return them
#[derive(Debug)]
pub struct ReplayStream {
    /// Cached groups, disconnected after the last one
    pub groups: Receiver<AlignmentGroup>,
    /// Processed groups go back here
    pub recycle: Sender<AlignmentGroup>,
}

#[derive(Debug)]
enum Tier {
    Unpopulated,
    // fixed pool of buffers refilled by the reader thread
    OnDisk { pool: GroupQueue },
    // every cached group, collected as workers finish with them
    InMemory { processed: GroupQueue },
}

/// One library's mapping cache
#[derive(Debug)]
pub struct CacheFile {
    path: PathBuf,
    num_written: u64,
    in_memory: bool,
    tier: Tier,
    reader: Option<JoinHandle<Result<u64, QuantError>>>,
}

impl CacheFile {
    /// A cache at `path` holding `num_written` records
    pub fn new(path: PathBuf, num_written: u64) -> Self {
        Self {
            path,
            num_written,
            in_memory: false,
            tier: Tier::Unpopulated,
            reader: None,
        }
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in the file
    pub fn num_written(&self) -> u64 {
        self.num_written
    }

    /// Set the number of records once the writer has finished
    pub fn set_num_written(&mut self, num_written: u64) {
        self.num_written = num_written;
    }

    /// Keep the cache resident from the next round on
    pub fn set_in_memory(&mut self, in_memory: bool) {
        self.in_memory = in_memory;
    }

    /// Whether replay is from memory
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Start a replay round.
    ///
    /// From memory, the groups collected in the previous round are handed
    /// straight back. The first in-memory round and every on-disk round start
    /// a reader thread over the file. `buffer_size` bounds the number of
    /// groups in flight when reading from disk.
    pub fn populate(&mut self, buffer_size: usize) -> Result<ReplayStream, QuantError> {
        let buffer_size = usize::max(buffer_size, 1);
        if self.in_memory {
            if let Tier::InMemory { processed } = &self.tier {
                let (tx, rx) = crossbeam_channel::unbounded();
                while let Some(group) = processed.try_pop() {
                    let _ = tx.send(group);
                }
                let processed = GroupQueue::unbounded();
                let recycle = processed.sender();
                self.tier = Tier::InMemory { processed };
                log::debug!("Replaying {} cached groups from memory", rx.len());
                return Ok(ReplayStream {
                    groups: rx,
                    recycle,
                });
            }

            // initial fill, disconnected so the reader allocates if it runs dry
            let (_, init) = GroupQueue::with_groups(self.num_written as usize).into_parts();
            let processed = GroupQueue::unbounded();
            let (tx, rx) = crossbeam_channel::unbounded();
            self.spawn_reader(init, tx)?;
            let recycle = processed.sender();
            self.tier = Tier::InMemory { processed };
            Ok(ReplayStream {
                groups: rx,
                recycle,
            })
        } else {
            let pool = match std::mem::replace(&mut self.tier, Tier::Unpopulated) {
                Tier::OnDisk { pool } => pool,
                _ => GroupQueue::with_groups(buffer_size),
            };
            // the reader discards the buffer it was holding at end of file
            while pool.len() < buffer_size {
                pool.push(AlignmentGroup::new());
            }
            let (tx, rx) = crossbeam_channel::bounded(buffer_size);
            self.spawn_reader(pool.receiver(), tx)?;
            let recycle = pool.sender();
            self.tier = Tier::OnDisk { pool };
            Ok(ReplayStream {
                groups: rx,
                recycle,
            })
        }
    }

    fn spawn_reader(
        &mut self,
        source: Receiver<AlignmentGroup>,
        sink: Sender<AlignmentGroup>,
    ) -> Result<(), QuantError> {
        let path = self.path.clone();
        let handle = std::thread::Builder::new()
            .name("cache-reader".to_string())
            .spawn(move || read_alignment_cache(&path, source, sink))?;
        self.reader = Some(handle);
        Ok(())
    }

    /// Wait for the reader thread of the current round.
    ///
    /// Returns the number of records it read, zero if no reader was running.
    pub fn flush(&mut self) -> Result<u64, QuantError> {
        match self.reader.take() {
            Some(handle) => {
                let num_read = handle.join().map_err(|_| QuantError::CacheRead {
                    path: self.path.clone(),
                    msg: "reader thread panicked".to_string(),
                })??;
                if num_read != self.num_written {
                    log::warn!(
                        "Read {num_read} groups from {} but {} were written",
                        self.path.display(),
                        self.num_written
                    );
                }
                Ok(num_read)
            }
            None => Ok(0),
        }
    }

    /// Drop every queued group and delete the file
    pub fn clear(&mut self) -> Result<(), QuantError> {
        self.flush()?;
        self.tier = Tier::Unpopulated;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
