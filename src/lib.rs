//! ByteBite -- Android device test orchestrator.
//!
//! Drives a single USB-attached device through `adb` in fixed, ordered
//! profiles: forensic extraction, a marker/logcat traceability check and a
//! controlled offensive simulation. Every execution produces one `run.json`
//! record; a stock versus rooted comparison pairs two of them. Records are
//! projected into a cumulative SQLite results store.

pub mod compare;
pub mod config;
pub mod device;
pub mod driver;
pub mod profiles;
pub mod runlog;
pub mod storage;
