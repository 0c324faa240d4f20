//! Pooled fiber slot

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use noblock_core::{FiberId, NbError, NbResult, ScopeId, SuspendToken};

use crate::timeout::TimeoutScope;

/// A task as driven by a fiber
pub type LocalTask = Pin<Box<dyn Future<Output = NbResult<()>>>>;

/// Value delivered to a suspended primitive when it is resumed
#[derive(Debug)]
pub enum Wakeup {
    Ready,
    Failed(NbError),
}

impl Wakeup {
    pub fn into_result(self) -> NbResult<()> {
        match self {
            Wakeup::Ready => Ok(()),
            Wakeup::Failed(e) => Err(e),
        }
    }
}

/// One execution context of the pool.
///
/// Reused across tasks; per-task state is reset by the pool between tasks.
/// At most one suspension token is outstanding at a time: whoever presents
/// it first resumes the fiber, every other resume is stale.
pub struct Fiber {
    id: FiberId,
    neverblock: Cell<bool>,
    scopes: RefCell<Vec<Rc<TimeoutScope>>>,
    pending: Cell<Option<SuspendToken>>,
    resume: RefCell<Option<Wakeup>>,
    task: RefCell<Option<LocalTask>>,
    busy: Cell<bool>,
    tasks_run: Cell<u64>,
}

impl Fiber {
    pub(crate) fn new(id: FiberId, neverblock: bool) -> Self {
        Self {
            id,
            neverblock: Cell::new(neverblock),
            scopes: RefCell::new(Vec::new()),
            pending: Cell::new(None),
            resume: RefCell::new(None),
            task: RefCell::new(None),
            busy: Cell::new(false),
            tasks_run: Cell::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    /// Tasks started on this fiber
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.get()
    }

    pub(crate) fn neverblock(&self) -> bool {
        self.neverblock.get()
    }

    pub(crate) fn set_neverblock(&self, enabled: bool) -> bool {
        self.neverblock.replace(enabled)
    }

    // ---- suspension -------------------------------------------------------

    /// Record the token that owns the next resume
    pub(crate) fn arm(&self, token: SuspendToken) {
        self.resume.borrow_mut().take();
        self.pending.set(Some(token));
    }

    pub(crate) fn pending(&self) -> Option<SuspendToken> {
        self.pending.get()
    }

    /// Consume the pending token if it is `token`
    pub(crate) fn claim(&self, token: SuspendToken) -> bool {
        if self.pending.get() == Some(token) {
            self.pending.set(None);
            true
        } else {
            false
        }
    }

    /// Consume whatever token is pending
    pub(crate) fn claim_any(&self) -> Option<SuspendToken> {
        self.pending.take()
    }

    /// Drop the pending token if it is still `token`
    pub(crate) fn disarm(&self, token: SuspendToken) {
        if self.pending.get() == Some(token) {
            self.pending.set(None);
        }
    }

    pub(crate) fn deliver(&self, wake: Wakeup) {
        *self.resume.borrow_mut() = Some(wake);
    }

    pub(crate) fn take_wakeup(&self) -> Option<Wakeup> {
        self.resume.borrow_mut().take()
    }

    pub(crate) fn has_wakeup(&self) -> bool {
        self.resume.borrow().is_some()
    }

    // ---- timeout scopes ---------------------------------------------------

    pub(crate) fn push_scope(&self, scope: Rc<TimeoutScope>) {
        self.scopes.borrow_mut().push(scope);
    }

    pub(crate) fn innermost_scope(&self) -> Option<Rc<TimeoutScope>> {
        self.scopes.borrow().last().cloned()
    }

    /// Remove the scope `id` and every scope created after it, in creation
    /// order. Empty when `id` is no longer on the stack.
    pub(crate) fn split_scopes_from(&self, id: ScopeId) -> Vec<Rc<TimeoutScope>> {
        let mut scopes = self.scopes.borrow_mut();
        match scopes.iter().position(|s| s.id() == id) {
            Some(pos) => scopes.split_off(pos),
            None => Vec::new(),
        }
    }

    pub(crate) fn take_all_scopes(&self) -> Vec<Rc<TimeoutScope>> {
        std::mem::take(&mut *self.scopes.borrow_mut())
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.borrow().len()
    }

    // ---- task slot --------------------------------------------------------

    pub(crate) fn install(&self, task: LocalTask) {
        self.busy.set(true);
        self.tasks_run.set(self.tasks_run.get() + 1);
        *self.task.borrow_mut() = Some(task);
    }

    pub(crate) fn take_task(&self) -> Option<LocalTask> {
        self.task.borrow_mut().take()
    }

    pub(crate) fn put_task(&self, task: LocalTask) {
        *self.task.borrow_mut() = Some(task);
    }

    pub(crate) fn has_task(&self) -> bool {
        self.task.borrow().is_some()
    }

    pub(crate) fn set_idle(&self) {
        self.busy.set(false);
    }

    /// Clear per-task state before the fiber is reused
    pub(crate) fn reset(&self, neverblock: bool) {
        self.pending.set(None);
        self.resume.borrow_mut().take();
        self.neverblock.set(neverblock);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("busy", &self.busy.get())
            .field("pending", &self.pending.get())
            .field("scopes", &self.scopes.borrow().len())
            .finish()
    }
}
