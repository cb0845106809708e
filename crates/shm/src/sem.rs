// SPDX-FileCopyrightText: © 2026 Manifold Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Named semaphores.
//!
//! Binary semaphores shared between processes, implemented as exclusive
//! `flock`s on files in the scratch directory. The kernel releases a held
//! lock on any process exit path, which is exactly the release guarantee
//! the page contracts require. [`NamedSemaphore::abandon`] detaches a held
//! lock from this handle so that drop paths stop releasing it, used around
//! process spawns where the child logically takes over the resource.

use crate::scratch::backing_path;
use manifold_core::{ManifoldError, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

enum State {
    /// Handle is attached but the lock is not held by us.
    Open(File),
    /// We hold the lock.
    Held(Flock<File>),
    /// Handle was abandoned or poisoned by an OS error.
    Detached,
}

/// A named binary semaphore.
pub struct NamedSemaphore {
    name: String,
    path: PathBuf,
    state: State,
}

impl NamedSemaphore {
    /// Opens (creating if needed) the named semaphore. Does not acquire it.
    pub fn open(name: &str) -> Result<Self> {
        let path = backing_path(&format!("{name}.sem"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ManifoldError::Fatal(format!("cannot open semaphore {name}: {e}")))?;
        Ok(Self { name: name.to_string(), path, state: State::Open(file) })
    }

    /// Non-blocking acquire. Returns true when the lock was taken.
    pub fn try_wait(&mut self) -> bool {
        match std::mem::replace(&mut self.state, State::Detached) {
            State::Open(file) => match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(guard) => {
                    self.state = State::Held(guard);
                    true
                },
                Err((file, _)) => {
                    self.state = State::Open(file);
                    false
                },
            },
            other => {
                self.state = other;
                false
            },
        }
    }

    /// Blocking acquire. Only used for the metadata semaphore, whose
    /// critical section is a bounded memcpy.
    pub fn wait(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Detached) {
            State::Open(file) => match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(guard) => {
                    self.state = State::Held(guard);
                    Ok(())
                },
                Err((file, errno)) => {
                    self.state = State::Open(file);
                    Err(ManifoldError::Fatal(format!("semaphore {} wait: {errno}", self.name)))
                },
            },
            State::Held(guard) => {
                self.state = State::Held(guard);
                Ok(())
            },
            State::Detached => {
                Err(ManifoldError::Fatal(format!("semaphore {} is detached", self.name)))
            },
        }
    }

    /// Releases a held lock. A no-op when not held.
    pub fn post(&mut self) {
        if let State::Held(guard) = std::mem::replace(&mut self.state, State::Detached) {
            match guard.unlock() {
                Ok(file) => self.state = State::Open(file),
                Err((guard, errno)) => {
                    tracing::warn!(sem = %self.name, %errno, "failed to release semaphore");
                    self.state = State::Held(guard);
                },
            }
        }
    }

    /// Detaches this handle from the lock without releasing it. The lock
    /// stays held until this process exits.
    pub fn abandon(&mut self) {
        if let State::Held(guard) = std::mem::replace(&mut self.state, State::Detached) {
            std::mem::forget(guard);
        }
    }

    /// Whether this handle currently holds the lock.
    pub const fn is_held(&self) -> bool {
        matches!(self.state, State::Held(_))
    }

    /// Removes the backing file. Existing holders keep their lock.
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Probes whether the named semaphore is currently held by any process.
/// The probe acquires and immediately releases on a separate handle, so it
/// never disturbs a holder.
pub fn is_locked(name: &str) -> Result<bool> {
    let mut probe = NamedSemaphore::open(name)?;
    if probe.try_wait() {
        probe.post();
        Ok(false)
    } else {
        Ok(true)
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Open(_) => "open",
            State::Held(_) => "held",
            State::Detached => "detached",
        };
        f.debug_struct("NamedSemaphore").field("name", &self.name).field("state", &state).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("{}-{}-{}", name, std::process::id(), line!())
    }

    #[test]
    fn test_acquire_release_cycle() {
        let name = unique("MstTestLock");
        let mut sem = NamedSemaphore::open(&name).unwrap();
        assert!(!sem.is_held());
        assert!(sem.try_wait());
        assert!(sem.is_held());
        sem.post();
        assert!(!sem.is_held());
        sem.unlink();
    }

    #[test]
    fn test_probe_sees_holder() {
        let name = unique("MstTestLock");
        let mut holder = NamedSemaphore::open(&name).unwrap();
        assert!(!is_locked(&name).unwrap());
        assert!(holder.try_wait());
        assert!(is_locked(&name).unwrap());
        holder.post();
        assert!(!is_locked(&name).unwrap());
        holder.unlink();
    }

    #[test]
    fn test_second_handle_cannot_take_held_lock() {
        let name = unique("MstTestLock");
        let mut a = NamedSemaphore::open(&name).unwrap();
        let mut b = NamedSemaphore::open(&name).unwrap();
        assert!(a.try_wait());
        assert!(!b.try_wait());
        a.post();
        assert!(b.try_wait());
        b.post();
        a.unlink();
    }

    #[test]
    fn test_abandon_keeps_lock_held() {
        let name = unique("MstTestLock");
        let mut sem = NamedSemaphore::open(&name).unwrap();
        assert!(sem.try_wait());
        sem.abandon();
        drop(sem);
        // The lock stays held by this process even though the handle is
        // gone; only process exit releases it.
        assert!(is_locked(&name).unwrap());
        let _ = std::fs::remove_file(crate::scratch::backing_path(&format!("{name}.sem")));
    }

    #[test]
    fn test_blocking_wait_after_release() {
        let name = unique("MstTestLock");
        let mut sem = NamedSemaphore::open(&name).unwrap();
        sem.wait().unwrap();
        assert!(sem.is_held());
        sem.post();
        sem.unlink();
    }
}
