//! Single-threaded event loop implementing [`Reactor`].

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use noblock_core::{kdebug, kerror, ktrace, Interest, TaskFailure, WaitMode};

use super::poller::{DefaultPoller, PollEvent, Poller};
use super::remote::{RemoteHandle, RemoteShared};
use super::timer::{TimerHandle, TimerHeap, TimerStats};
use super::{Callback, Reactor, Watcher};
use crate::config::RuntimeConfig;

struct WatchEntry {
    watcher: Weak<dyn Watcher>,
    interest: Interest,
    /// Registered with the poller (interest was non-empty at some point)
    polled: bool,
}

/// Counters for one event loop
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub passes: u64,
    pub events_dispatched: u64,
    pub timers_fired: u64,
    pub ticks_run: u64,
    pub remote_run: u64,
    pub task_failures: u64,
}

type ErrorHandler = Box<dyn FnMut(TaskFailure)>;

/// The reactor. Create with [`EventLoop::new`], hand an `Rc` of it to the
/// scheduler, then call [`run`](EventLoop::run).
pub struct EventLoop {
    poller: RefCell<Box<dyn Poller>>,
    watches: RefCell<HashMap<RawFd, WatchEntry>>,
    timers: RefCell<TimerHeap>,
    ticks: RefCell<VecDeque<Callback>>,
    shutdown_hooks: RefCell<Vec<Callback>>,
    error_handler: RefCell<Option<ErrorHandler>>,
    remote: Arc<RemoteShared>,
    events: RefCell<Vec<PollEvent>>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    max_poll_interval: Duration,
    /// Next pass that checks polled descriptors are still open
    liveness_due: Cell<Instant>,
    stats: RefCell<LoopStats>,
}

impl EventLoop {
    pub fn new(config: &RuntimeConfig) -> io::Result<Rc<Self>> {
        let poller = DefaultPoller::new(config.max_events)?;
        Self::with_poller(Box::new(poller), config)
    }

    /// Event loop over a specific poller backend
    pub fn with_poller(mut poller: Box<dyn Poller>, config: &RuntimeConfig) -> io::Result<Rc<Self>> {
        let remote = RemoteShared::new()?;
        poller.add(remote.waker().fd(), Interest::READ)?;
        kdebug!("event loop created (backend={})", poller.name());

        Ok(Rc::new(Self {
            poller: RefCell::new(poller),
            watches: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerHeap::with_capacity(config.timer_capacity)),
            ticks: RefCell::new(VecDeque::new()),
            shutdown_hooks: RefCell::new(Vec::new()),
            error_handler: RefCell::new(None),
            remote,
            events: RefCell::new(Vec::with_capacity(config.max_events)),
            running: Cell::new(false),
            stop_requested: Cell::new(false),
            max_poll_interval: config.max_poll_interval,
            liveness_due: Cell::new(Instant::now()),
            stats: RefCell::new(LoopStats::default()),
        }))
    }

    /// Run passes until [`stop`](Self::stop) is called or nothing can wake
    /// the loop any more. Shutdown hooks run on return and pending ticks
    /// are discarded.
    pub fn run(&self) -> io::Result<()> {
        if self.running.replace(true) {
            return Err(io::Error::new(io::ErrorKind::Other, "event loop already running"));
        }
        self.stop_requested.set(false);

        let result = loop {
            if self.stop_requested.get() {
                kdebug!("event loop stopped");
                break Ok(());
            }
            if self.is_idle() {
                kdebug!("event loop idle, returning");
                break Ok(());
            }
            if let Err(e) = self.turn(None) {
                kerror!("event loop poll failed: {}", e);
                break Err(e);
            }
        };

        self.running.set(false);
        self.finish_run();
        result
    }

    /// One pass. Waits for readiness at most `max_wait` (or the configured
    /// cap), and not at all when ticks are pending.
    pub fn turn(&self, max_wait: Option<Duration>) -> io::Result<()> {
        let timeout = self.poll_timeout(max_wait);
        let mut events = std::mem::take(&mut *self.events.borrow_mut());
        events.clear();
        self.poller.borrow_mut().poll(&mut events, timeout)?;
        self.stats.borrow_mut().passes += 1;

        self.drain_remote();
        self.reap_closed();
        for ev in &events {
            self.dispatch(ev);
        }
        *self.events.borrow_mut() = events;

        self.fire_timers();
        self.run_ticks();
        Ok(())
    }

    /// Stop after the current pass
    pub fn stop(&self) {
        self.stop_requested.set(true);
    }

    /// Handle for other threads
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle::new(self.remote.clone())
    }

    /// Install the top-level error boundary. Without one, failures are logged.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: FnMut(TaskFailure) + 'static,
    {
        *self.error_handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.borrow().clone()
    }

    pub fn timer_stats(&self) -> TimerStats {
        self.timers.borrow().stats()
    }

    /// Armed timers
    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn pending_ticks(&self) -> usize {
        self.ticks.borrow().len()
    }

    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.watches.borrow().contains_key(&fd)
    }

    /// Interest currently registered for `fd`
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.watches.borrow().get(&fd).map(|e| e.interest)
    }

    pub fn watched_count(&self) -> usize {
        self.watches.borrow().len()
    }

    pub fn backend_name(&self) -> &'static str {
        self.poller.borrow().name()
    }

    /// Nothing queued, armed or watched, and no remote handle alive
    pub fn is_idle(&self) -> bool {
        self.ticks.borrow().is_empty()
            && self.timers.borrow().is_empty()
            && self.watches.borrow().values().all(|e| e.interest.is_empty())
            && self.remote.is_empty()
            && Arc::strong_count(&self.remote) == 1
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.ticks.borrow().is_empty() || self.stop_requested.get() || !self.remote.is_empty() {
            return Some(Duration::ZERO);
        }
        let cap = max_wait.unwrap_or(self.max_poll_interval);
        let until_timer = self
            .timers
            .borrow_mut()
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));
        Some(until_timer.map_or(cap, |d| d.min(cap)))
    }

    fn drain_remote(&self) {
        if self.remote.take_stop() {
            self.stop_requested.set(true);
        }
        while let Some(callback) = self.remote.pop() {
            self.stats.borrow_mut().remote_run += 1;
            callback();
        }
    }

    fn dispatch(&self, ev: &PollEvent) {
        if ev.fd == self.remote.waker().fd() {
            self.remote.waker().drain();
            return;
        }

        let Some((weak, interest)) = self.entry(ev.fd) else {
            // Detached earlier in this pass
            return;
        };
        let Some(watcher) = weak.upgrade() else {
            self.detach(ev.fd);
            return;
        };
        self.stats.borrow_mut().events_dispatched += 1;

        if ev.invalid {
            self.unbind(ev.fd);
            return;
        }
        if (ev.readable || ev.error) && interest.read {
            watcher.on_readable();
        }
        if ev.writable || ev.error {
            // on_readable may have detached or re-registered the descriptor
            let still_writing = matches!(
                self.entry(ev.fd),
                Some((current, interest)) if interest.write && Weak::ptr_eq(&current, &weak)
            );
            if still_writing {
                watcher.on_writable();
            }
        }
    }

    /// Unbind polled descriptors that were closed without `unbind`.
    ///
    /// epoll drops a closed descriptor from its set without reporting it, so
    /// its waiters would never hear anything. Runs at most once per
    /// `max_poll_interval`, or on the next pass after the poller refused a
    /// descriptor with `EBADF`.
    fn reap_closed(&self) {
        let now = Instant::now();
        if now < self.liveness_due.get() {
            return;
        }
        self.liveness_due.set(now + self.max_poll_interval);

        let closed: Vec<RawFd> = self
            .watches
            .borrow()
            .iter()
            .filter(|&(&fd, e)| e.polled && !fd_is_open(fd))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in closed {
            kdebug!("fd {} closed while watched, unbinding", fd);
            self.unbind(fd);
        }
    }

    fn entry(&self, fd: RawFd) -> Option<(Weak<dyn Watcher>, Interest)> {
        self.watches
            .borrow()
            .get(&fd)
            .map(|e| (e.watcher.clone(), e.interest))
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let mark = self.timers.borrow().watermark();
        loop {
            let next = self.timers.borrow_mut().pop_expired(now, mark);
            let Some((handle, callback)) = next else { break };
            ktrace!("timer {} fired", handle.as_u64());
            self.stats.borrow_mut().timers_fired += 1;
            callback();
        }
    }

    fn run_ticks(&self) {
        let queued = self.ticks.borrow().len();
        for _ in 0..queued {
            let next = self.ticks.borrow_mut().pop_front();
            let Some(callback) = next else { break };
            self.stats.borrow_mut().ticks_run += 1;
            callback();
        }
    }

    fn finish_run(&self) {
        let discarded = std::mem::take(&mut *self.ticks.borrow_mut());
        if !discarded.is_empty() {
            kdebug!("discarding {} pending ticks", discarded.len());
        }
        drop(discarded);

        let hooks = std::mem::take(&mut *self.shutdown_hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }
}

impl Reactor for EventLoop {
    fn is_running(&self) -> bool {
        self.running.get()
    }

    fn watch(&self, fd: RawFd, watcher: Weak<dyn Watcher>) -> io::Result<()> {
        let stale = match self.watches.borrow().get(&fd) {
            Some(entry) if entry.watcher.strong_count() > 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "descriptor already watched",
                ));
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            // Watcher dropped without detaching
            self.detach(fd);
        }
        let mut watches = self.watches.borrow_mut();
        watches.insert(
            fd,
            WatchEntry {
                watcher,
                interest: Interest::NONE,
                polled: false,
            },
        );
        Ok(())
    }

    fn set_interest(&self, fd: RawFd, mode: WaitMode, enabled: bool) -> io::Result<()> {
        let mut watches = self.watches.borrow_mut();
        let entry = watches
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not watched"))?;

        let next = entry.interest.with(mode, enabled);
        if next == entry.interest {
            return Ok(());
        }

        let mut poller = self.poller.borrow_mut();
        let result = if next.is_empty() {
            poller.delete(fd).map(|()| entry.polled = false)
        } else if entry.polled {
            poller.modify(fd, next)
        } else {
            poller.add(fd, next).map(|()| entry.polled = true)
        };
        match result {
            Ok(()) => {
                entry.interest = next;
                Ok(())
            }
            Err(e) => {
                if e.raw_os_error() == Some(libc::EBADF) {
                    // Waiters already queued on it are failed next pass
                    entry.polled = true;
                    self.liveness_due.set(Instant::now());
                }
                Err(e)
            }
        }
    }

    fn detach(&self, fd: RawFd) {
        let removed = self.watches.borrow_mut().remove(&fd);
        if let Some(entry) = removed {
            if entry.polled {
                if let Err(e) = self.poller.borrow_mut().delete(fd) {
                    kdebug!("detach fd {}: {}", fd, e);
                }
            }
        }
    }

    fn unbind(&self, fd: RawFd) {
        let watcher = self
            .watches
            .borrow()
            .get(&fd)
            .and_then(|e| e.watcher.upgrade());
        self.detach(fd);
        if let Some(watcher) = watcher {
            watcher.on_closed();
        }
    }

    fn add_timer(&self, after: Duration, callback: Callback) -> TimerHandle {
        self.timers.borrow_mut().insert(Instant::now() + after, callback)
    }

    fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.timers.borrow_mut().cancel(handle)
    }

    fn next_tick(&self, callback: Callback) {
        self.ticks.borrow_mut().push_back(callback);
    }

    fn add_shutdown_hook(&self, callback: Callback) {
        self.shutdown_hooks.borrow_mut().push(callback);
    }

    fn report_error(&self, failure: TaskFailure) {
        self.stats.borrow_mut().task_failures += 1;
        let handler = self.error_handler.borrow_mut().take();
        match handler {
            Some(mut handler) => {
                handler(failure);
                let mut slot = self.error_handler.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            }
            None => kerror!("unhandled task failure: {}", failure),
        }
    }
}

fn fd_is_open(fd: RawFd) -> bool {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) }) != Err(Errno::EBADF)
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.remote.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noblock_core::FiberId;

    #[derive(Default)]
    struct Recorder {
        log: RefCell<Vec<&'static str>>,
    }

    impl Watcher for Recorder {
        fn on_readable(&self) {
            self.log.borrow_mut().push("read");
        }
        fn on_writable(&self) {
            self.log.borrow_mut().push("write");
        }
        fn on_closed(&self) {
            self.log.borrow_mut().push("closed");
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn event_loop() -> Rc<EventLoop> {
        EventLoop::new(&RuntimeConfig::new().max_poll_interval(Duration::from_millis(50))).unwrap()
    }

    fn as_watcher(rc: &Rc<Recorder>) -> Weak<dyn Watcher> {
        let dynamic: Rc<dyn Watcher> = rc.clone();
        Rc::downgrade(&dynamic)
    }

    #[test]
    fn test_run_returns_when_idle() {
        let el = event_loop();
        assert!(el.is_idle());
        el.run().unwrap();
        assert!(!el.is_running());
    }

    #[test]
    fn test_ticks_run_on_next_pass_only() {
        let el = event_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (l, el2) = (log.clone(), el.clone());
        el.next_tick(Box::new(move || {
            l.borrow_mut().push(1);
            let l2 = l.clone();
            el2.next_tick(Box::new(move || l2.borrow_mut().push(2)));
        }));

        el.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(el.pending_ticks(), 1);
        el.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_readable_dispatch_respects_interest() {
        let el = event_loop();
        let (r, w) = pipe();
        let rec = Rc::new(Recorder::default());
        el.watch(r, as_watcher(&rec)).unwrap();
        assert!(el.watch(r, as_watcher(&rec)).is_err());

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        el.turn(Some(Duration::from_millis(20))).unwrap();
        assert!(rec.log.borrow().is_empty());

        el.set_interest(r, WaitMode::Read, true).unwrap();
        assert_eq!(el.interest(r), Some(Interest::READ));
        el.turn(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(*rec.log.borrow(), vec!["read"]);

        el.detach(r);
        assert!(!el.is_watching(r));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_watch_replaces_dropped_watcher() {
        let el = event_loop();
        let (r, w) = pipe();
        let gone = Rc::new(Recorder::default());
        el.watch(r, as_watcher(&gone)).unwrap();
        el.set_interest(r, WaitMode::Read, true).unwrap();
        drop(gone);

        let rec = Rc::new(Recorder::default());
        el.watch(r, as_watcher(&rec)).unwrap();
        assert_eq!(el.interest(r), Some(Interest::NONE));
        el.detach(r);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_unbind_notifies_closed() {
        let el = event_loop();
        let (r, w) = pipe();
        let rec = Rc::new(Recorder::default());
        el.watch(r, as_watcher(&rec)).unwrap();
        el.set_interest(r, WaitMode::Read, true).unwrap();
        el.unbind(r);
        assert_eq!(*rec.log.borrow(), vec!["closed"]);
        assert!(!el.is_watching(r));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_descriptor_closed_under_watch_is_unbound() {
        use crate::reactor::poller::poll::PollPoller;

        let config = RuntimeConfig::new().max_poll_interval(Duration::from_millis(1));
        let backends: Vec<Box<dyn Poller>> = vec![
            Box::new(DefaultPoller::new(8).unwrap()),
            Box::new(PollPoller::new(8).unwrap()),
        ];
        for poller in backends {
            let el = EventLoop::with_poller(poller, &config).unwrap();
            let backend = el.backend_name();
            let (r, w) = pipe();
            let rec = Rc::new(Recorder::default());
            el.watch(r, as_watcher(&rec)).unwrap();
            el.set_interest(r, WaitMode::Read, true).unwrap();
            el.turn(Some(Duration::ZERO)).unwrap();
            assert!(rec.log.borrow().is_empty(), "{}", backend);

            unsafe { libc::close(r) };
            std::thread::sleep(Duration::from_millis(2));
            el.turn(Some(Duration::ZERO)).unwrap();
            assert_eq!(*rec.log.borrow(), vec!["closed"], "{}", backend);
            assert!(!el.is_watching(r), "{}", backend);
            assert!(el.is_idle(), "{}", backend);
            unsafe { libc::close(w) };
        }
    }

    #[test]
    fn test_timers_fire_in_order_and_cancel() {
        let el = event_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        el.add_timer(Duration::from_millis(2), Box::new(move || a.borrow_mut().push("second")));
        el.add_timer(Duration::from_millis(1), Box::new(move || b.borrow_mut().push("first")));
        let cancelled = el.add_timer(Duration::from_millis(1), Box::new(move || c.borrow_mut().push("never")));
        assert!(el.cancel_timer(cancelled));

        el.run().unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert_eq!(el.pending_timers(), 0);
    }

    #[test]
    fn test_timer_callback_can_cancel_sibling_in_same_pass() {
        let el = event_loop();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sibling = Rc::new(Cell::new(None::<TimerHandle>));

        let (l, s, el2) = (log.clone(), sibling.clone(), el.clone());
        el.add_timer(Duration::ZERO, Box::new(move || {
            l.borrow_mut().push("first");
            if let Some(h) = s.get() {
                el2.cancel_timer(h);
            }
        }));
        let l = log.clone();
        sibling.set(Some(el.add_timer(Duration::ZERO, Box::new(move || l.borrow_mut().push("sibling")))));

        std::thread::sleep(Duration::from_millis(2));
        el.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(*log.borrow(), vec!["first"]);
    }

    #[test]
    fn test_stop_runs_hooks_and_discards_ticks() {
        let el = event_loop();
        let hook_ran = Rc::new(Cell::new(false));
        let h = hook_ran.clone();
        el.add_shutdown_hook(Box::new(move || h.set(true)));

        let el2 = el.clone();
        el.next_tick(Box::new(move || {
            el2.stop();
            el2.next_tick(Box::new(|| panic!("discarded tick ran")));
        }));
        el.run().unwrap();

        assert!(hook_ran.get());
        assert_eq!(el.pending_ticks(), 0);
    }

    #[test]
    fn test_remote_schedule_wakes_loop() {
        let el = event_loop();
        let remote = el.remote();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.schedule(|| {}).unwrap();
            remote.stop().unwrap();
        });

        el.run().unwrap();
        worker.join().unwrap();
        assert_eq!(el.stats().remote_run, 1);
    }

    #[test]
    fn test_error_handler_receives_failures() {
        let el = event_loop();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        el.set_error_handler(move |failure| s.borrow_mut().push(failure.fiber()));

        el.report_error(TaskFailure::Panic { fiber: FiberId::new(4), message: "x".into() });
        el.report_error(TaskFailure::Panic { fiber: FiberId::new(5), message: "y".into() });
        assert_eq!(*seen.borrow(), vec![FiberId::new(4), FiberId::new(5)]);
        assert_eq!(el.stats().task_failures, 2);
    }
}
