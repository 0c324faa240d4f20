//! Cross-thread handoff into the loop thread.
//!
//! Everything else in the runtime is single-threaded. Other OS threads get
//! a [`RemoteHandle`]: callbacks go through a lock-free queue and the wake
//! descriptor interrupts a blocked poll. A live handle keeps an otherwise
//! idle loop running.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use super::waker::WakeFd;

pub type RemoteCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct RemoteShared {
    queue: SegQueue<RemoteCallback>,
    waker: WakeFd,
    stop: AtomicBool,
    closed: AtomicBool,
}

impl RemoteShared {
    pub(crate) fn new() -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            queue: SegQueue::new(),
            waker: WakeFd::create()?,
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn waker(&self) -> &WakeFd {
        &self.waker
    }

    pub(crate) fn pop(&self) -> Option<RemoteCallback> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    /// The loop is gone; later `schedule` calls fail
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.queue.pop().is_some() {}
    }
}

/// `Send + Sync` handle for handing work to the loop thread
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<RemoteShared>,
}

impl RemoteHandle {
    pub(crate) fn new(shared: Arc<RemoteShared>) -> Self {
        Self { shared }
    }

    /// Run `f` on the loop thread during its next pass
    pub fn schedule<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "event loop closed"));
        }
        self.shared.queue.push(Box::new(f));
        self.shared.waker.notify()
    }

    /// Ask the loop to stop after its current pass
    pub fn stop(&self) -> io::Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.waker.notify()
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RemoteHandle>();
    }

    #[test]
    fn test_schedule_from_thread() {
        let shared = RemoteShared::new().unwrap();
        let handle = RemoteHandle::new(shared.clone());
        std::thread::spawn(move || handle.schedule(|| {}).unwrap())
            .join()
            .unwrap();
        assert!(shared.pop().is_some());
        assert!(shared.is_empty());
    }

    #[test]
    fn test_schedule_after_close_fails() {
        let shared = RemoteShared::new().unwrap();
        let handle = RemoteHandle::new(shared.clone());
        shared.close();
        let err = handle.schedule(|| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
