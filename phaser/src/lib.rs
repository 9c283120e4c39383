// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A synchronization primitive for coordinating wait-free writers with a
//! blocking reader.
//!
//! Writers bracket their work with [`WriterReaderPhaser::writer_critical_section`],
//! which is a single atomic fetch-add on entry and another on exit. A reader
//! holding the reader lock may call [`PhaserReadGuard::flip_phase`], which
//! returns only once every writer that entered before the flip has exited.
//! The reader never blocks writers; writers never take a lock.
//!
//! The phaser says nothing about the data being protected. The usual
//! discipline is: writers mutate only state belonging to the current phase,
//! the reader repoints that state under its lock and then flips, after which
//! the state belonging to the previous phase is quiesced.

use core::sync::atomic::{AtomicI64, Ordering};
use core::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/// Epoch-pair phase synchronization.
///
/// Internally three signed epoch counters: writers increment `start_epoch` on
/// entry and one of the two end epochs on exit, chosen by the sign of the
/// token returned at entry. A phase flip inverts the sign of `start_epoch`
/// (by adding `i64::MIN`), so writers entering after the flip are steered to
/// the other end epoch, and the reader waits for the previous end epoch to
/// catch up with the start value captured at the flip.
#[derive(Debug)]
pub struct WriterReaderPhaser {
    start_epoch: AtomicI64,
    even_end_epoch: AtomicI64,
    odd_end_epoch: AtomicI64,
    reader_lock: Mutex<()>,
}

impl WriterReaderPhaser {
    pub fn new() -> Self {
        Self {
            start_epoch: AtomicI64::new(0),
            even_end_epoch: AtomicI64::new(0),
            odd_end_epoch: AtomicI64::new(i64::MIN),
            reader_lock: Mutex::new(()),
        }
    }

    /// Enter a writer critical section, returning the token that must be
    /// passed to [`writer_critical_section_exit`].
    ///
    /// Wait-free: a single atomic fetch-add.
    ///
    /// [`writer_critical_section_exit`]: Self::writer_critical_section_exit
    pub fn writer_critical_section_enter(&self) -> i64 {
        self.start_epoch.fetch_add(1, Ordering::AcqRel)
    }

    /// Exit a writer critical section entered with the given token.
    pub fn writer_critical_section_exit(&self, token: i64) {
        if token < 0 {
            self.odd_end_epoch.fetch_add(1, Ordering::Release);
        } else {
            self.even_end_epoch.fetch_add(1, Ordering::Release);
        }
    }

    /// Enter a writer critical section that exits when the returned guard is
    /// dropped, including on unwind.
    pub fn writer_critical_section(&self) -> WriterCriticalSection<'_> {
        WriterCriticalSection {
            phaser: self,
            token: self.writer_critical_section_enter(),
        }
    }

    /// Acquire the reader lock. Phase flips are performed through the
    /// returned guard, serializing readers; writers are unaffected.
    pub fn reader_lock(&self) -> PhaserReadGuard<'_> {
        PhaserReadGuard {
            phaser: self,
            _guard: self.reader_lock.lock(),
        }
    }
}

impl Default for WriterReaderPhaser {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII writer critical section. Dropping the guard exits the section.
pub struct WriterCriticalSection<'a> {
    phaser: &'a WriterReaderPhaser,
    token: i64,
}

impl Drop for WriterCriticalSection<'_> {
    fn drop(&mut self) {
        self.phaser.writer_critical_section_exit(self.token);
    }
}

/// Holds the phaser's reader lock.
pub struct PhaserReadGuard<'a> {
    phaser: &'a WriterReaderPhaser,
    _guard: MutexGuard<'a, ()>,
}

impl PhaserReadGuard<'_> {
    /// Flip the phase and wait until every writer that entered before the
    /// flip has exited.
    ///
    /// `yield_period` controls the wait granularity: zero yields the thread
    /// between polls, a nonzero duration sleeps for that long instead.
    ///
    /// Termination requires that every live writer eventually exits its
    /// critical section; the wait does not bound how long a writer may stay
    /// inside one.
    pub fn flip_phase(&self, yield_period: Duration) {
        let phaser = self.phaser;
        let next_phase_is_even = phaser.start_epoch.load(Ordering::Acquire) < 0;

        // Reset the end epoch the next phase's writers will exit into.
        let initial_start_value = if next_phase_is_even { 0 } else { i64::MIN };
        if next_phase_is_even {
            phaser.even_end_epoch.store(initial_start_value, Ordering::Relaxed);
        } else {
            phaser.odd_end_epoch.store(initial_start_value, Ordering::Relaxed);
        }

        // Flip the start epoch, steering new writers to the other end epoch,
        // and capture the pre-flip start value the old phase must drain to.
        let start_value_at_flip = phaser
            .start_epoch
            .swap(initial_start_value, Ordering::AcqRel);

        loop {
            let end_epoch = if next_phase_is_even {
                phaser.odd_end_epoch.load(Ordering::Acquire)
            } else {
                phaser.even_end_epoch.load(Ordering::Acquire)
            };
            if end_epoch == start_value_at_flip {
                break;
            }
            if yield_period.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(yield_period);
            }
        }
    }
}
