//! Counting completion of asynchronous attachment resolution.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use crate::interfaces::Job;

///One-shot stage. Continuations registered before the signal run when it fires, later ones run immediately.
pub struct StageSignal {
    fired: AtomicBool,
    continuations: Mutex<Vec<Job>>,
}

impl Default for StageSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StageSignal {
    pub fn new() -> Self {
        StageSignal {
            fired: AtomicBool::new(false),
            continuations: Mutex::new(Vec::new()),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn on_signaled(&self, job: Job) {
        {
            let mut continuations = self
                .continuations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            //Checked under the lock, otherwise a concurrent signal could miss the job.
            if !self.fired.load(Ordering::Acquire) {
                continuations.push(job);
                return;
            }
        }
        job();
    }

    ///Fires the signal. Returns false if it was fired before.
    pub fn signal(&self) -> bool {
        let continuations = {
            let mut continuations = self
                .continuations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.fired.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *continuations)
        };
        for job in continuations {
            job();
        }
        true
    }
}

impl std::fmt::Debug for StageSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSignal")
            .field("fired", &self.is_signaled())
            .finish()
    }
}

///Global pending counter of a compilation.
///
/// A compilation starts with one "unit" held by [compile](crate::Framegraph::compile) itself, every pass adds one unit plus
/// one per attachment. The armed [StageSignal] fires exactly once, when the count drops back to zero.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    pending: AtomicU32,
    signal: Mutex<Option<Arc<StageSignal>>>,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    ///Starts a new compilation.
    pub fn begin(&self) {
        let previous = self.pending.swap(1, Ordering::AcqRel);
        assert!(
            previous == 0,
            "Compilation started while {previous} tasks of the previous one are pending"
        );
        *self.signal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn add(&self, count: u32) {
        self.pending.fetch_add(count, Ordering::AcqRel);
    }

    ///Sets the signal fired on completion.
    pub fn arm(&self, signal: Arc<StageSignal>) {
        *self.signal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(signal);
    }

    ///Removes one pending unit, fires the armed signal if it was the last one. Returns true in that case.
    pub fn complete_one(&self) -> bool {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Completion latch underflow");
        if previous != 1 {
            return false;
        }

        let signal = self
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(signal) = signal {
            signal.signal();
        }
        true
    }

    ///Drops the unit taken by [begin](Self::begin) of a compilation that failed before any work was queued.
    pub fn cancel(&self) {
        let previous = self.pending.swap(0, Ordering::AcqRel);
        debug_assert!(previous == 1, "Cancelled a compilation with {previous} pending units");
        *self.signal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_exactly_once() {
        let latch = CompletionLatch::new();
        let signal = Arc::new(StageSignal::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        signal.on_signaled(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        latch.begin();
        latch.add(2);
        latch.arm(signal.clone());
        assert!(!latch.complete_one());
        assert!(!latch.complete_one());
        assert!(!signal.is_signaled());
        assert!(latch.complete_one());
        assert!(signal.is_signaled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!signal.signal());
        assert_eq!(latch.pending(), 0);
    }

    #[test]
    fn late_continuation_runs_immediately() {
        let signal = StageSignal::new();
        assert!(signal.signal());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        signal.on_signaled(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_completion() {
        const THREADS: u32 = 8;
        const PER_THREAD: u32 = 500;

        let latch = Arc::new(CompletionLatch::new());
        let signal = Arc::new(StageSignal::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        signal.on_signaled(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        latch.begin();
        latch.add(THREADS * PER_THREAD);
        latch.arm(signal.clone());

        let handles = (0..THREADS)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        latch.complete_one();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!signal.is_signaled());
        latch.complete_one();
        assert!(signal.is_signaled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn begin_while_pending_panics() {
        let latch = CompletionLatch::new();
        latch.begin();
        latch.begin();
    }
}
