//! Deterministic simulation testing infrastructure.
//!
//! Every byte the engine persists goes through a `BlockDevice`. Swapping in
//! `SimulatedDevice` gives tests:
//! - Crashes that drop a seeded random suffix of unsynced writes
//! - Write failures injected after a chosen number of writes
//! - Reproducibility: the same seed and operations yield the same bytes
//!
//! # Usage
//!
//! ```ignore
//! use arbor::simulation::SimulatedDevice;
//!
//! let data = SimulatedDevice::new(1);
//! let log = SimulatedDevice::new(2);
//! let manager = RecordManager::open_with_devices(
//!     Arc::new(data.clone()),
//!     Arc::new(log.clone()),
//!     RecordManagerOptions::default(),
//! )?;
//! // ... work, then lose the process without closing
//! drop(manager);
//! data.crash();
//! log.crash();
//! ```

mod device;

pub use device::{SimulatedDevice, SimulatedDeviceStats};
