//! In-Process Collaborators
//!
//! Scripted implementations of the group, channel, applier and certification
//! interfaces. They let a recovery session run end to end inside one process,
//! for tests and for the `simulate` command.

mod applier;
mod channel;
mod group;

use std::sync::{Mutex, MutexGuard};

pub use applier::{SimApplier, SimCertifier};
pub use channel::{DonorScript, SimChannel};
pub use group::SimGroup;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
