// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Coalesced, single-shot deferred work inside one worker, plus [`JobRef`]
//! for posting a wakeup onto a worker from any other thread.
//!
//! A [`Job`] tracks at most one pending "now" and one pending "later"
//! execution regardless of how many times it's posted — the callback itself
//! decides what to do by re-reading its owner's state when it finally runs,
//! same as the original's `liJob`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

/// Coalescing flag pair embedded in whatever wants deferred, single-run work
/// (a stream, say). Not useful on its own — implement [`Scheduled`] on the
/// owning `Rc`-held type and post it on a [`JobQueue`].
#[derive(Debug, Default)]
pub struct Job {
    now_scheduled: Cell<bool>,
    later_scheduled: Cell<bool>,
}

impl Job {
    /// A fresh, unscheduled job.
    pub fn new() -> Self {
        Job::default()
    }
}

/// Anything that can be posted on a [`JobQueue`]: owns a [`Job`] and knows
/// how to run once dispatched.
pub trait Scheduled {
    /// The embedded coalescing flags for this target.
    fn job(&self) -> &Job;
    /// Runs the deferred work. Invoked with the flags already cleared, so
    /// re-posting from inside `run` schedules a fresh execution rather than
    /// being swallowed.
    fn run(self: Rc<Self>);
}

/// Per-worker coalesced job queue. Single-threaded by construction — only
/// the worker that owns it ever touches it; cross-thread wakeups go through
/// [`JobRef`] instead.
#[derive(Default)]
pub struct JobQueue {
    now: RefCell<Vec<Rc<dyn Scheduled>>>,
    later: RefCell<Vec<Rc<dyn Scheduled>>>,
}

/// Manual impl: `Rc<dyn Scheduled>` isn't `Debug`, so this can't derive it.
impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("now", &self.now.borrow().len())
            .field("later", &self.later.borrow().len())
            .finish()
    }
}

impl JobQueue {
    /// A fresh, empty queue.
    pub fn new() -> Self {
        JobQueue::default()
    }

    /// Schedules `target` to run during this tick's [`JobQueue::run_ready`],
    /// unless it's already scheduled for this tick.
    pub fn post_now<T: Scheduled + 'static>(&self, target: &Rc<T>) {
        let job = target.job();
        if !job.now_scheduled.replace(true) {
            self.now.borrow_mut().push(target.clone() as Rc<dyn Scheduled>);
        }
    }

    /// Schedules `target` to run on the *next* tick, after all of this
    /// tick's "now" work has drained — used to coalesce a burst of wakeups
    /// into a single deferred pass (e.g. a drain connecting to a source
    /// that has no data yet).
    pub fn post_later<T: Scheduled + 'static>(&self, target: &Rc<T>) {
        let job = target.job();
        if job.now_scheduled.get() {
            // already running (or about to run) this tick; that supersedes "later"
            return;
        }
        if !job.later_scheduled.replace(true) {
            self.later
                .borrow_mut()
                .push(target.clone() as Rc<dyn Scheduled>);
        }
    }

    /// Whether any work is pending (used by the worker loop to decide
    /// whether to poll with a zero timeout instead of blocking).
    pub fn has_pending(&self) -> bool {
        !self.now.borrow().is_empty() || !self.later.borrow().is_empty()
    }

    /// Runs one tick: promotes anything scheduled "later" into "now", then
    /// drains "now" to completion (including anything newly posted while
    /// draining).
    pub fn run_ready(&self) {
        {
            let mut later = self.later.borrow_mut();
            if !later.is_empty() {
                let mut now = self.now.borrow_mut();
                for target in later.drain(..) {
                    target.job().later_scheduled.set(false);
                    if !target.job().now_scheduled.replace(true) {
                        now.push(target);
                    }
                }
            }
        }

        loop {
            let batch: Vec<Rc<dyn Scheduled>> = {
                let mut now = self.now.borrow_mut();
                std::mem::take(&mut *now)
            };
            if batch.is_empty() {
                break;
            }
            for target in batch {
                target.job().now_scheduled.set(false);
                target.run();
            }
        }
    }
}

/// A `Send + Sync` handle that, when fired, posts a coalesced wakeup onto a
/// specific worker's job queue from any thread — the "job reference" spec
/// calls for so [`crate::backend::Backend`] and [`crate::dynconf::DynamicConfig`]
/// can resume a parked request without ever touching that request's
/// (single-threaded) owning worker directly.
#[derive(Clone)]
pub struct JobRef {
    resume: Arc<dyn Fn() + Send + Sync>,
    sender: Sender<Arc<dyn Fn() + Send + Sync>>,
    waker: Arc<mio::Waker>,
}

impl std::fmt::Debug for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRef").finish_non_exhaustive()
    }
}

impl JobRef {
    /// Builds a job reference that will run `resume` on the worker draining
    /// `sender`'s matching [`JobRefQueue`], waking it via `waker` if it's
    /// currently blocked in `poll()`.
    pub fn new(
        resume: Arc<dyn Fn() + Send + Sync>,
        sender: Sender<Arc<dyn Fn() + Send + Sync>>,
        waker: Arc<mio::Waker>,
    ) -> Self {
        JobRef {
            resume,
            sender,
            waker,
        }
    }

    /// Posts the wakeup and interrupts the target worker's `poll()`.
    /// Consumes `self` — firing releases the reference, same as
    /// `li_job_async` + `li_job_ref_release` together.
    pub fn fire(self) {
        if self.sender.send(self.resume).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Whether this reference's resume closure is the same allocation as
    /// `resume` — lets a caller that kept its own clone of the `Arc` it
    /// handed to [`JobRef::new`] find (and cancel) this exact ticket later
    /// out of a queue it doesn't otherwise have a handle into, e.g.
    /// [`crate::dynconf::DynamicConfig::handle_cleanup`].
    pub fn is(&self, resume: &Arc<dyn Fn() + Send + Sync>) -> bool {
        Arc::ptr_eq(&self.resume, resume)
    }
}

/// Receiving half of the cross-thread [`JobRef`] channel, owned by the
/// worker whose event loop it wakes. Drained once per tick after a
/// [`crate::eventloop::WAKE_TOKEN`] event.
#[derive(Debug)]
pub struct JobRefQueue {
    sender: Sender<Arc<dyn Fn() + Send + Sync>>,
    receiver: Receiver<Arc<dyn Fn() + Send + Sync>>,
}

impl JobRefQueue {
    /// A fresh, empty cross-thread wakeup channel.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        JobRefQueue { sender, receiver }
    }

    /// A cloneable sender usable to build further [`JobRef`]s targeting this
    /// queue's owning worker.
    pub fn sender(&self) -> Sender<Arc<dyn Fn() + Send + Sync>> {
        self.sender.clone()
    }

    /// Drains and runs every wakeup posted since the last call.
    pub fn drain(&self) {
        while let Ok(resume) = self.receiver.try_recv() {
            resume();
        }
    }
}

impl Default for JobRefQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        job: Job,
        runs: Cell<usize>,
    }

    impl Scheduled for Counter {
        fn job(&self) -> &Job {
            &self.job
        }
        fn run(self: Rc<Self>) {
            self.runs.set(self.runs.get() + 1);
        }
    }

    #[test]
    fn posting_now_twice_before_drain_runs_once() {
        let queue = JobQueue::new();
        let target = Rc::new(Counter {
            job: Job::new(),
            runs: Cell::new(0),
        });
        queue.post_now(&target);
        queue.post_now(&target);
        queue.run_ready();
        assert_eq!(target.runs.get(), 1);
    }

    #[test]
    fn later_runs_on_the_tick_after_it_was_posted() {
        let queue = JobQueue::new();
        let target = Rc::new(Counter {
            job: Job::new(),
            runs: Cell::new(0),
        });
        queue.post_later(&target);
        queue.run_ready();
        assert_eq!(target.runs.get(), 1);
    }

    #[test]
    fn reposting_inside_run_schedules_a_fresh_execution() {
        struct Reposter {
            job: Job,
            queue: RefCell<Option<Rc<JobQueue>>>,
            runs: Cell<usize>,
        }
        impl Scheduled for Reposter {
            fn job(&self) -> &Job {
                &self.job
            }
            fn run(self: Rc<Self>) {
                let runs = self.runs.get() + 1;
                self.runs.set(runs);
                if runs < 2 {
                    if let Some(q) = self.queue.borrow().as_ref() {
                        q.post_now(&self);
                    }
                }
            }
        }

        let queue = Rc::new(JobQueue::new());
        let target = Rc::new(Reposter {
            job: Job::new(),
            queue: RefCell::new(None),
            runs: Cell::new(0),
        });
        *target.queue.borrow_mut() = Some(queue.clone());
        queue.post_now(&target);
        queue.run_ready();
        assert_eq!(target.runs.get(), 2);
    }

    #[test]
    fn job_ref_fires_across_threads_and_wakes_the_target_loop() {
        let jr_queue = JobRefQueue::new();
        let sender = jr_queue.sender();
        let el = crate::eventloop::EventLoop::new().expect("loop");
        let waker = el.waker();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let job_ref = JobRef::new(
            Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
            sender,
            waker,
        );

        let handle = std::thread::spawn(move || {
            job_ref.fire();
        });
        handle.join().unwrap();

        jr_queue.drain();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
