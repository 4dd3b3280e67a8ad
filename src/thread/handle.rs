//! User-facing thread handles.
//!
//! A handle is an id-based reference to a thread. It never points into
//! scheduler memory, so it stays valid (if not useful) after the thread is
//! reclaimed: every operation then reports [`ThreadError::NotFound`].
//!
//! A failed operation is also recorded as the last error of the thread that
//! made the call, readable later through [`ThreadHandle::last_error`].

use crate::arch::Platform;
use crate::error::ThreadError;
use crate::memory::stack::StackAllocator;
use crate::scheduler::Scheduler;
use crate::thread::{EntryPoint, ThreadId, ThreadInfo, ThreadParams, ThreadState, ThreadStatus};

pub struct ThreadHandle<'s, P: Platform, A: StackAllocator> {
    scheduler: &'s Scheduler<P, A>,
    id: Option<ThreadId>,
}

impl<'s, P: Platform, A: StackAllocator> ThreadHandle<'s, P, A> {
    /// Creates an unbound handle.
    pub fn new(scheduler: &'s Scheduler<P, A>) -> Self {
        Self { scheduler, id: None }
    }

    /// Binds to an existing thread.
    pub fn open(&mut self, id: ThreadId) -> Result<(), ThreadError> {
        if self.id.is_some() {
            return self.track(Err(ThreadError::AlreadyOpen));
        }
        self.track(self.scheduler.lookup(id))?;
        self.id = Some(id);
        Ok(())
    }

    /// Creates a thread from `params` and binds to it.
    pub fn create(&mut self, params: &ThreadParams) -> Result<ThreadId, ThreadError> {
        if self.id.is_some() {
            return self.track(Err(ThreadError::AlreadyOpen));
        }
        let id = self.track(self.scheduler.create(params))?;
        self.id = Some(id);
        Ok(id)
    }

    /// Positional form of [`create`](Self::create).
    pub fn create_thread(
        &mut self,
        priority: u32,
        stack_size: usize,
        entry: EntryPoint,
        userdata: usize,
        start_paused: bool,
        usermode: bool,
    ) -> Result<ThreadId, ThreadError> {
        let params = ThreadParams::new(entry)
            .priority(priority)
            .stack_size(stack_size)
            .userdata(userdata)
            .start_paused(start_paused)
            .usermode(usermode);
        self.create(&params)
    }

    /// Records a failure on the calling thread and passes the result through.
    fn track<T>(&self, result: Result<T, ThreadError>) -> Result<T, ThreadError> {
        result.inspect_err(|&err| self.scheduler.set_last_error(err))
    }

    /// Runs `op` on the bound thread's id.
    fn with_bound<T>(
        &self,
        op: impl FnOnce(ThreadId) -> Result<T, ThreadError>,
    ) -> Result<T, ThreadError> {
        self.track(self.id.ok_or(ThreadError::UnopenedHandle).and_then(op))
    }

    pub fn pause(&self) -> Result<(), ThreadError> {
        self.with_bound(|id| self.scheduler.pause(id))
    }

    pub fn resume(&self) -> Result<(), ThreadError> {
        self.with_bound(|id| self.scheduler.resume(id))
    }

    pub fn set_priority(&self, priority: u32) -> Result<(), ThreadError> {
        self.with_bound(|id| self.scheduler.set_priority(id, priority))
    }

    /// Kills the thread. Its stacks are reclaimed by a later reschedule.
    pub fn terminate(&self, exit_code: u32) -> Result<(), ThreadError> {
        self.with_bound(|id| self.scheduler.terminate(id, exit_code))
    }

    pub fn state(&self) -> Result<ThreadState, ThreadError> {
        self.with_bound(|id| self.scheduler.thread_state(id))
    }

    pub fn status(&self) -> Result<ThreadStatus, ThreadError> {
        self.state().map(ThreadStatus::from)
    }

    /// Exit code of a dead thread; `InvalidState` while it still lives.
    pub fn exit_code(&self) -> Result<u32, ThreadError> {
        self.with_bound(|id| self.scheduler.exit_code(id))
    }

    /// Last failed handle operation made *by* the bound thread.
    pub fn last_error(&self) -> Result<Option<ThreadError>, ThreadError> {
        self.with_bound(|id| self.scheduler.thread_last_error(id))
    }

    pub fn info(&self) -> Result<ThreadInfo, ThreadError> {
        self.with_bound(|id| self.scheduler.thread_info(id))
    }

    pub fn id(&self) -> Result<ThreadId, ThreadError> {
        self.with_bound(Ok)
    }

    pub fn is_open(&self) -> bool {
        self.id.is_some()
    }

    /// Unbinds the handle. The thread itself is unaffected.
    pub fn close(&mut self) -> Result<(), ThreadError> {
        let result = self.id.take().map(|_| ()).ok_or(ThreadError::UnopenedHandle);
        self.track(result)
    }
}

impl<P: Platform, A: StackAllocator> Clone for ThreadHandle<'_, P, A> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler,
            id: self.id,
        }
    }
}
