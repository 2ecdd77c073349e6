//! Whole-bus reader/writer admission.
//!
//! Readers and writers never overlap: a read waits until no writer is in
//! flight and a write waits until every reader has drained. Each side
//! publishes itself first and then re-checks the opposite counter, so two
//! racing threads cannot both get in. The write side belongs to one
//! thread at a time; that thread may nest writes, which lets a post-write
//! hook start a DMA, while writers on other threads wait.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// No thread owns the write side.
const NO_OWNER: u64 = 0;

#[derive(Default)]
pub struct Admission {
    readers: AtomicUsize,
    writers: AtomicUsize,
    owner: AtomicU64,
}

/// Small per-thread token, never `NO_OWNER`.
fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

/// Held while a read is in flight.
pub struct ReadAdmission<'a> {
    admission: &'a Admission,
}

/// Held while a write (or DMA copy) is in flight.
pub struct WriteAdmission<'a> {
    admission: &'a Admission,
}

/// Spin briefly, then start yielding the thread.
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> ReadAdmission<'_> {
        let mut backoff = Backoff::new();
        loop {
            while self.writers.load(Ordering::SeqCst) != 0 {
                backoff.snooze();
            }
            self.readers.fetch_add(1, Ordering::SeqCst);
            if self.writers.load(Ordering::SeqCst) == 0 {
                return ReadAdmission { admission: self };
            }
            self.readers.fetch_sub(1, Ordering::SeqCst);
            backoff.snooze();
        }
    }

    pub fn write(&self) -> WriteAdmission<'_> {
        let me = thread_token();
        let mut backoff = Backoff::new();
        loop {
            while self.readers.load(Ordering::SeqCst) != 0 {
                backoff.snooze();
            }
            let owned = self.owner.load(Ordering::SeqCst) == me
                || self
                    .owner
                    .compare_exchange(NO_OWNER, me, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
            if !owned {
                backoff.snooze();
                continue;
            }
            self.writers.fetch_add(1, Ordering::SeqCst);
            if self.readers.load(Ordering::SeqCst) == 0 {
                return WriteAdmission { admission: self };
            }
            self.release_write();
            backoff.snooze();
        }
    }

    /// Drop one write hold; the last one gives up ownership.
    fn release_write(&self) {
        if self.writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.owner.store(NO_OWNER, Ordering::SeqCst);
        }
    }

    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }
}

impl Drop for ReadAdmission<'_> {
    fn drop(&mut self) {
        self.admission.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for WriteAdmission<'_> {
    fn drop(&mut self) {
        self.admission.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn guards_release_on_drop() {
        let admission = Admission::new();
        {
            let _a = admission.read();
            let _b = admission.read();
            assert_eq!(admission.readers(), 2);
        }
        assert_eq!(admission.readers(), 0);
        {
            let _w = admission.write();
            let _nested = admission.write();
            assert_eq!(admission.writers(), 2);
        }
        assert_eq!(admission.writers(), 0);
    }

    #[test]
    fn writers_on_different_threads_take_turns() {
        let admission = Admission::new();
        let inside = AtomicUsize::new(0);
        let violated = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        let _outer = admission.write();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            violated.store(true, Ordering::SeqCst);
                        }
                        // Same-thread nesting is still admitted.
                        let _inner = admission.write();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert!(!violated.load(Ordering::SeqCst));
        assert_eq!(admission.writers(), 0);
        assert_eq!(admission.owner.load(Ordering::SeqCst), NO_OWNER);
    }

    #[test]
    fn readers_and_writers_never_overlap() {
        let admission = Admission::new();
        // Counted only inside the guarded section; the admission counters
        // themselves can blip while a side backs off.
        let active_readers = AtomicUsize::new(0);
        let active_writers = AtomicUsize::new(0);
        let violated = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        let _guard = admission.write();
                        active_writers.fetch_add(1, Ordering::SeqCst);
                        if active_readers.load(Ordering::SeqCst) != 0 {
                            violated.store(true, Ordering::SeqCst);
                        }
                        active_writers.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        let _guard = admission.read();
                        active_readers.fetch_add(1, Ordering::SeqCst);
                        if active_writers.load(Ordering::SeqCst) != 0 {
                            violated.store(true, Ordering::SeqCst);
                        }
                        active_readers.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert!(!violated.load(Ordering::SeqCst));
        assert_eq!(admission.readers(), 0);
        assert_eq!(admission.writers(), 0);
    }
}
