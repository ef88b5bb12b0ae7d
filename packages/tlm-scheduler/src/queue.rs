use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::clock::Clock;
use crate::error::{JobOutput, JobResult};

/// A scheduled callback with its arguments already captured.
pub type Job = Box<dyn FnOnce() -> JobResult>;

/// Boxes a callback, normalizing its return value into a [`JobResult`].
pub fn job<F, R>(callback: F) -> Job
where
    F: FnOnce() -> R + 'static,
    R: JobOutput,
{
    Box::new(move || callback().into_job_result())
}

/// Boxes `callback` together with the arguments it will be called with.
pub fn job_with<A, F, R>(callback: F, args: A) -> Job
where
    A: 'static,
    F: FnOnce(A) -> R + 'static,
    R: JobOutput,
{
    Box::new(move || callback(args).into_job_result())
}

/// FIFO queue backing one phase.
///
/// Queues are drained one item at a time so the engine can account for the
/// runtime of every callback and stop between any two of them.
pub trait ProcessQueue {
    fn enqueue(&self, job: Job);

    /// Removes the front item and runs it.
    ///
    /// Returns `None` without side effects when the queue is empty.
    /// `current_queued_at` is the scheduler's published timestamp slot.
    fn dequeue(&self, current_queued_at: &Cell<Option<f64>>) -> Option<JobResult>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A simple FIFO queue for jobs.
/// Since the scheduler is single-threaded, we use RefCell<VecDeque>.
#[derive(Default)]
pub struct GeneralQueue {
    queue: RefCell<VecDeque<Job>>,
}

impl GeneralQueue {
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }
}

impl ProcessQueue for GeneralQueue {
    fn enqueue(&self, job: Job) {
        self.queue.borrow_mut().push_back(job);
    }

    fn dequeue(&self, _current_queued_at: &Cell<Option<f64>>) -> Option<JobResult> {
        // The borrow must end before the job runs; jobs enqueue onto this queue.
        let job = self.queue.borrow_mut().pop_front()?;
        Some(job())
    }

    fn len(&self) -> usize {
        self.queue.borrow().len()
    }
}

struct EventItem {
    job: Job,
    queued_at: f64,
}

/// Queue for event callbacks.
///
/// Records when each job was queued and publishes that time while the job
/// runs, so a handler can tell how long its event waited.
pub struct EventQueue {
    queue: RefCell<VecDeque<EventItem>>,
    clock: Rc<dyn Clock>,
}

impl EventQueue {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            clock,
        }
    }
}

impl ProcessQueue for EventQueue {
    fn enqueue(&self, job: Job) {
        let queued_at = self.clock.now();
        self.queue.borrow_mut().push_back(EventItem { job, queued_at });
    }

    fn dequeue(&self, current_queued_at: &Cell<Option<f64>>) -> Option<JobResult> {
        let EventItem { job, queued_at } = self.queue.borrow_mut().pop_front()?;
        current_queued_at.set(Some(queued_at));
        let result = job();
        current_queued_at.set(None);
        Some(result)
    }

    fn len(&self) -> usize {
        self.queue.borrow().len()
    }
}
