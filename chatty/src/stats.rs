// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Fixed-width counter block guarded by one mutex.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub nusers: u64,
    pub nonline: u64,
    pub ndelivered: u64,
    pub nnotdelivered: u64,
    pub nfiledelivered: u64,
    pub nfilenotdelivered: u64,
    pub nerrors: u64,
    pub ngroups: u64,
}

pub struct Stats {
    inner: Mutex<Counters>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Counters::default()),
        }
    }

    /// Takes the lock, runs `f` against the counters, releases -- every
    /// update in the crate goes through this one chokepoint.
    pub fn update(&self, f: impl FnOnce(&mut Counters)) {
        let mut guard = self.inner.lock().unwrap();
        f(&mut guard);
    }

    pub fn snapshot(&self) -> Counters {
        *self.inner.lock().unwrap()
    }

    /// Appends one line `epoch nusers nonline ndelivered nnotdelivered
    /// nfiledelivered nfilenotdelivered nerrors ngroups` to `path`, taking
    /// the same counters mutex the signal thread's SIGUSR1 handler uses.
    pub fn dump(&self, path: &Path, epoch: u64) -> std::io::Result<()> {
        let c = self.snapshot();
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(
            file,
            "{epoch} {} {} {} {} {} {} {} {}",
            c.nusers,
            c.nonline,
            c.ndelivered,
            c.nnotdelivered,
            c.nfiledelivered,
            c.nfilenotdelivered,
            c.nerrors,
            c.ngroups
        )
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_apply_under_the_lock() {
        let stats = Stats::new();
        stats.update(|c| c.nusers += 1);
        stats.update(|c| c.ndelivered += 2);
        let snap = stats.snapshot();
        assert_eq!(snap.nusers, 1);
        assert_eq!(snap.ndelivered, 2);
    }

    #[test]
    fn dump_appends_one_line_per_call() {
        let dir = std::env::temp_dir().join(format!("chatty-stats-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let stats = Stats::new();
        stats.update(|c| c.nusers = 2);
        stats.dump(&dir, 1).unwrap();
        stats.dump(&dir, 2).unwrap();
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let _ = std::fs::remove_file(&dir);
    }
}
