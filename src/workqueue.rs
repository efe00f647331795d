//! A single dedicated worker's FIFO queue, for work that shouldn't run on
//! the caller's own stack: shadow-chain collapse and anything else that
//! wants "enqueue now, let one worker get to it". Modeled directly on
//! [`crate::fault::UserfaultfdCtx`]'s event queue, a `Spin`-guarded
//! `VecDeque` plus a [`WaitList`] to signal the waiter, since this core
//! has no scheduler of its own to park a worker thread on. The embedding
//! kernel supplies the thread: it calls [`run_worker`] in a loop and,
//! between calls, blocks on [`wait_queue`] with its own scheduler's
//! blocking primitive.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use eonix_sync::{Spin, WaitList};

type WorkFn = Box<dyn FnOnce() + Send>;

struct Queue {
    items: Spin<VecDeque<WorkFn>>,
    wait: WaitList,
}

static QUEUE: Queue = Queue {
    items: Spin::new(VecDeque::new()),
    wait: WaitList::new(),
};

/// Queue `work` to run FIFO on the worker thread, and wake it.
pub fn enqueue(work: impl FnOnce() + Send + 'static) {
    QUEUE.items.lock().push_back(Box::new(work));
    QUEUE.wait.notify_one();
}

/// Run every item queued so far, FIFO, on the calling thread. Returns
/// the number of items run. Never blocks; the embedding kernel's worker
/// thread calls this in a loop and waits on [`wait_queue`] when it comes
/// back empty.
pub fn run_worker() -> usize {
    let mut ran = 0;
    while let Some(work) = QUEUE.items.lock().pop_front() {
        work();
        ran += 1;
    }
    ran
}

/// The wait-queue a dedicated worker thread parks on between
/// [`run_worker`] calls. `enqueue` calls `notify_one` on it.
pub fn wait_queue() -> &'static WaitList {
    &QUEUE.wait
}

pub fn pending_count() -> usize {
    QUEUE.items.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_worker_drains_in_fifo_order() {
        while run_worker() > 0 {}

        static ORDER: Spin<VecDeque<u32>> = Spin::new(VecDeque::new());
        for i in 0..3 {
            enqueue(move || ORDER.lock().push_back(i));
        }
        assert_eq!(run_worker(), 3);
        assert_eq!(ORDER.lock().drain(..).collect::<VecDeque<_>>(), [0, 1, 2]);
    }

    #[test]
    fn run_worker_on_an_empty_queue_runs_nothing() {
        while run_worker() > 0 {}
        assert_eq!(run_worker(), 0);
        assert_eq!(pending_count(), 0);
    }

    #[test]
    fn enqueue_wakes_a_waiter() {
        while run_worker() > 0 {}

        static WOKEN: AtomicUsize = AtomicUsize::new(0);
        assert!(!wait_queue().has_waiters());
        enqueue(|| {
            WOKEN.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(run_worker(), 1);
        assert_eq!(WOKEN.load(Ordering::Relaxed), 1);
    }
}
