//! Session state machine and its data model.
//!
//! The types here are free of I/O. [`BleUidSession`](crate::BleUidSession)
//! drives a [`SessionMachine`] against a real adapter.

pub mod config;
pub mod machine;
pub mod sightings;
pub mod state;
pub mod uid;

pub use config::SessionConfig;
pub use machine::{Command, Preflight, SessionEvent, SessionMachine, SessionSnapshot};
pub use sightings::{DeviceSighting, SightingList};
pub use state::{FailureReason, SessionState};
pub use uid::{UidValue, NO_UID_TEXT};
