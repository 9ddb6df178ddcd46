//! Simulated block device for deterministic crash and fault testing.
//!
//! The device keeps two views of its bytes: the durable view as of the last
//! `sync`, and the volatile view every read sees. Writes since the last sync
//! are queued in order. `crash` rebuilds the volatile view from the durable
//! one plus a seeded random prefix of the queued writes, modelling a disk
//! that persisted some but not all of its write-back cache.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{BlockDevice, StorageError};

/// One write not yet covered by a sync.
#[derive(Debug, Clone)]
enum PendingWrite {
    Data { offset: u64, bytes: Vec<u8> },
    Resize(u64),
}

impl PendingWrite {
    fn apply(&self, target: &mut Vec<u8>) {
        match self {
            Self::Data { offset, bytes } => write_into(target, *offset, bytes),
            Self::Resize(len) => target.resize(to_usize(*len), 0),
        }
    }
}

/// Statistics about simulated device operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedDeviceStats {
    /// Number of reads.
    pub reads: u64,
    /// Number of writes, resizes included.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of writes rejected by fault injection.
    pub injected_write_errors: u64,
    /// Number of crashes.
    pub crashes: u64,
    /// Unsynced writes that survived a crash.
    pub writes_survived: u64,
    /// Unsynced writes lost to a crash.
    pub writes_lost: u64,
}

struct DeviceState {
    durable: Vec<u8>,
    volatile: Vec<u8>,
    pending: Vec<PendingWrite>,
    rng: StdRng,
    /// Writes still allowed before every write fails.
    fail_writes_after: Option<usize>,
    /// Writes still allowed before exactly one write fails.
    fail_one_write_after: Option<usize>,
    stats: SimulatedDeviceStats,
}

/// In-memory `BlockDevice` with crash simulation.
///
/// Clones share the same bytes, so a test can keep a handle while the store
/// owns another and crash the device underneath it.
///
/// # Thread Safety
///
/// All state sits behind one mutex; concurrent readers serialize.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Create an empty device.
    ///
    /// The seed decides which unsynced writes survive each crash, so the same
    /// seed and the same operations always produce the same bytes.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                durable: Vec::new(),
                volatile: Vec::new(),
                pending: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
                fail_writes_after: None,
                fail_one_write_after: None,
                stats: SimulatedDeviceStats::default(),
            })),
        }
    }

    /// Lose an unpredictable suffix of the writes made since the last sync.
    pub fn crash(&self) {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        let survivors = if pending.is_empty() {
            0
        } else {
            state.rng.random_range(0..=pending.len())
        };
        Self::settle_crash(&mut state, &pending, survivors);
    }

    /// Lose every write made since the last sync.
    pub fn lose_unsynced(&self) {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        Self::settle_crash(&mut state, &pending, 0);
    }

    fn settle_crash(state: &mut DeviceState, pending: &[PendingWrite], survivors: usize) {
        let mut bytes = state.durable.clone();
        for write in &pending[..survivors] {
            write.apply(&mut bytes);
        }
        state.durable.clone_from(&bytes);
        state.volatile = bytes;

        state.stats.crashes += 1;
        state.stats.writes_survived += survivors as u64;
        state.stats.writes_lost += (pending.len() - survivors) as u64;
    }

    /// Allow `n` more writes, then fail every write until `clear_faults`.
    pub fn fail_writes_after(&self, n: usize) {
        self.lock().fail_writes_after = Some(n);
    }

    /// Allow `n` more writes, fail the next one, then succeed again.
    pub fn fail_one_write_after(&self, n: usize) {
        self.lock().fail_one_write_after = Some(n);
    }

    /// Stop injecting faults.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.fail_writes_after = None;
        state.fail_one_write_after = None;
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> SimulatedDeviceStats {
        self.lock().stats
    }

    /// Length of the durable view.
    #[must_use]
    pub fn durable_len(&self) -> u64 {
        self.lock().durable.len() as u64
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("lock poisoned")
    }

    fn record(&self, write: PendingWrite) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.stats.writes += 1;
        if let Some(remaining) = state.fail_writes_after.as_mut() {
            if *remaining == 0 {
                state.stats.injected_write_errors += 1;
                return Err(StorageError::InjectedFault(
                    "simulated write error".to_string(),
                ));
            }
            *remaining -= 1;
        }
        let fail_one = state.fail_one_write_after;
        match fail_one {
            Some(0) => {
                state.fail_one_write_after = None;
                state.stats.injected_write_errors += 1;
                return Err(StorageError::InjectedFault(
                    "simulated write error".to_string(),
                ));
            }
            Some(remaining) => state.fail_one_write_after = Some(remaining - 1),
            None => {}
        }
        write.apply(&mut state.volatile);
        state.pending.push(write);
        Ok(())
    }
}

impl BlockDevice for SimulatedDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.stats.reads += 1;
        let device_len = state.volatile.len() as u64;
        let start = to_usize(offset);
        let Some(bytes) = state.volatile.get(start..start + buf.len()) else {
            return Err(StorageError::ShortRead {
                offset,
                len: buf.len(),
                device_len,
            });
        };
        buf.copy_from_slice(bytes);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.record(PendingWrite::Data {
            offset,
            bytes: data.to_vec(),
        })
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.stats.syncs += 1;
        state.pending.clear();
        let bytes = state.volatile.clone();
        state.durable = bytes;
        Ok(())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.lock().volatile.len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<(), StorageError> {
        self.record(PendingWrite::Resize(len))
    }
}

fn write_into(target: &mut Vec<u8>, offset: u64, bytes: &[u8]) {
    let start = to_usize(offset);
    let end = start + bytes.len();
    if target.len() < end {
        target.resize(end, 0);
    }
    target[start..end].copy_from_slice(bytes);
}

#[allow(clippy::cast_possible_truncation)]
const fn to_usize(value: u64) -> usize {
    value as usize
}
