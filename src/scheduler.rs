//! # Scheduler
//!
//! The kernel's task table and every decision made over it.
//!
//! ## Scheduling Algorithm
//!
//! At each SysTick interrupt (see [`Scheduler::tick`]):
//! 1. **Age**: every user task's `timeout` counts down by one
//! 2. **Flip**: a `Waiting` task whose timeout ran out becomes `Active`;
//!    an `Active` task whose timeout ran out has used its quantum and
//!    becomes `Waiting`. Either way `timeout` is reloaded from `period`
//! 3. **Switch**: if anything flipped, save the running task's context
//!    point, select a task, and ask the port to pend the context switch
//!
//! Selection ([`Scheduler::schedule`]) is a deadline proxy: the `Active`
//! task with the smallest nonzero `timeout` wins, lowest index on ties,
//! and the idle task runs when nothing qualifies.
//!
//! The scheduler never touches hardware. The port layer feeds it stack
//! pointers and acts on its return values, so everything here runs under
//! `cargo test` on the host.

use core::ffi::c_void;

use crate::config::{IDLE_TIMEOUT, MAX_TASKS, ROUND_ROBIN_QUANTUM, UNINITIALIZED_PERIOD};
use crate::context::{self, StackRegion};
use crate::error::KernelError;
use crate::mutex::{MutexMask, MutexTable};
use crate::task::{TaskControlBlock, TaskEntry, TaskId, TaskState};

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The central kernel state. Held by [`crate::kernel`] on target, or by
/// value in tests.
///
/// ## Design Notes
///
/// - User tasks occupy slots `0..task_count`; the idle task always sits
///   in slot `MAX_TASKS` and is never counted
/// - `current` is `None` until the first trap selects a task
/// - `running` trails `current`: it only changes when the port performs
///   the switch, so a tick that lands between a trap and the switch still
///   saves into the task whose stack the process stack pointer is on
/// - Task stacks come from a [`StackRegion`], one slot per task index
pub struct Scheduler {
    /// Task table. The last slot is the idle task.
    pub(crate) tasks: [TaskControlBlock; MAX_TASKS + 1],

    /// Number of user tasks created.
    pub(crate) task_count: usize,

    /// The task the next context switch resumes.
    pub(crate) current: Option<TaskId>,

    /// The task whose context the process stack holds right now.
    pub(crate) running: Option<TaskId>,

    /// Mutex table, in creation order.
    pub(crate) mutexes: MutexTable,

    /// Where task stacks are carved from. `None` until `init`.
    stacks: Option<StackRegion>,

    /// Set once `start` has succeeded.
    started: bool,

    /// Held while the trap dispatcher runs.
    pub(crate) dispatching: bool,

    /// A tick wanted a switch while the dispatcher held the guard.
    pub(crate) deferred_switch: bool,

    /// Monotonic tick counter.
    ticks: u32,
}

impl Scheduler {
    /// Create an uninitialized scheduler.
    pub const fn new() -> Self {
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS + 1],
            task_count: 0,
            current: None,
            running: None,
            mutexes: MutexTable::new(),
            stacks: None,
            started: false,
            dispatching: false,
            deferred_switch: false,
            ticks: 0,
        }
    }

    /// One-time setup. Must come before any task or mutex is created.
    ///
    /// Clears every period to the "unset" sentinel so creation can tell
    /// timed tasks from round-robin ones, and gives the idle slot the
    /// default quantum.
    pub fn init(&mut self, stacks: StackRegion) {
        *self = Self::new();
        for tcb in &mut self.tasks[..MAX_TASKS] {
            tcb.period = UNINITIALIZED_PERIOD;
        }
        self.tasks[TaskId::IDLE.index()].period = ROUND_ROBIN_QUANTUM;
        self.stacks = Some(stacks);
    }

    /// Register a round-robin task that uses the mutexes in `mutexes`.
    ///
    /// # Returns
    /// - `Ok(task_id)`: the id of the newly created task
    /// - `Err(KernelError::TaskTableFull)`: all `MAX_TASKS` slots are used
    pub fn create_task(
        &mut self,
        entry: TaskEntry,
        arg: *mut c_void,
        mutexes: MutexMask,
    ) -> Result<TaskId, KernelError> {
        self.spawn(entry, arg, UNINITIALIZED_PERIOD, mutexes)
    }

    /// Register a task that runs with its own `period` instead of the
    /// default quantum. A `period` of zero means the default quantum.
    pub fn create_timed_task(
        &mut self,
        entry: TaskEntry,
        arg: *mut c_void,
        period: u32,
        mutexes: MutexMask,
    ) -> Result<TaskId, KernelError> {
        self.spawn(entry, arg, period, mutexes)
    }

    fn spawn(
        &mut self,
        entry: TaskEntry,
        arg: *mut c_void,
        period: u32,
        mutexes: MutexMask,
    ) -> Result<TaskId, KernelError> {
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        let stacks = self.stacks.ok_or(KernelError::NotInitialized)?;
        if self.task_count >= MAX_TASKS {
            warn!("task table full");
            return Err(KernelError::TaskTableFull);
        }

        let id = TaskId::new(self.task_count);
        let tcb = &mut self.tasks[id.index()];
        tcb.init(entry, period, mutexes);
        // SAFETY: each slot of the region belongs to exactly one task index
        tcb.stack_pointer =
            unsafe { context::build_initial_frame(stacks.slot_top(id.index()), entry, arg) };

        info!(
            "created {} period={=u32} sp=0x{=usize:08x}",
            id,
            tcb.period,
            tcb.stack_pointer as usize
        );
        self.task_count += 1;
        Ok(id)
    }

    fn create_idle_task(&mut self, entry: TaskEntry, stacks: StackRegion) {
        let idle = &mut self.tasks[TaskId::IDLE.index()];
        idle.init(entry, ROUND_ROBIN_QUANTUM, MutexMask::NONE);
        idle.timeout = IDLE_TIMEOUT;
        // SAFETY: slot MAX_TASKS is reserved for the idle task
        idle.stack_pointer = unsafe {
            context::build_initial_frame(
                stacks.slot_top(TaskId::IDLE.index()),
                entry,
                core::ptr::null_mut(),
            )
        };
    }

    /// Create the idle task and mark the kernel started.
    ///
    /// Returns the idle task's stack pointer, which the port installs as
    /// the process stack before trapping into the first switch.
    ///
    /// # Errors
    /// `NoTasks` when no user task exists. Nothing is changed in that case.
    pub fn start(&mut self, idle: TaskEntry) -> Result<*mut u32, KernelError> {
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        let stacks = self.stacks.ok_or(KernelError::NotInitialized)?;
        if self.task_count == 0 {
            warn!("no tasks to run");
            return Err(KernelError::NoTasks);
        }

        self.create_idle_task(idle, stacks);
        self.current = None;
        self.running = None;
        self.started = true;
        info!("kernel started with {=usize} tasks", self.task_count);
        Ok(self.tasks[TaskId::IDLE.index()].stack_pointer)
    }

    /// Called from the SysTick handler every tick with the live process
    /// stack pointer.
    ///
    /// Returns `true` when the port should pend a context switch.
    pub fn tick(&mut self, live_sp: *mut u32) -> bool {
        self.ticks = self.ticks.wrapping_add(1);

        let mut changed = false;
        for tcb in &mut self.tasks[..self.task_count] {
            changed |= tcb.age();
        }
        if !changed {
            return false;
        }

        if self.dispatching {
            self.deferred_switch = true;
            return false;
        }

        self.save_context(live_sp);
        let next = self.schedule();
        debug!("tick {=u32}: switch to {}", self.ticks, next);
        true
    }

    /// Record where the running task's context will be saved.
    pub(crate) fn save_context(&mut self, live_sp: *mut u32) {
        if let Some(running) = self.running {
            self.tasks[running.index()].stack_pointer = context::save_point(live_sp);
        }
    }

    /// Select the next task to run.
    ///
    /// Picks the `Active` task with the smallest nonzero timeout, lowest
    /// index first on ties, or the idle task when there is none. Sets the
    /// current task and returns it; task timers are left alone.
    pub fn schedule(&mut self) -> TaskId {
        let mut best: Option<(TaskId, u32)> = None;

        for (index, tcb) in self.tasks[..self.task_count].iter().enumerate() {
            if !tcb.is_eligible() {
                continue;
            }
            if best.map_or(true, |(_, timeout)| tcb.timeout < timeout) {
                best = Some((TaskId::new(index), tcb.timeout));
            }
        }

        let next = best.map_or(TaskId::IDLE, |(id, _)| id);
        trace!("scheduled {}", next);
        self.current = Some(next);
        next
    }

    /// Perform the switch: the selected task becomes the running one.
    /// Returns its saved stack pointer. Called by the context switch
    /// handler only.
    pub fn switch_target(&mut self) -> *mut u32 {
        let id = self.current.unwrap_or(TaskId::IDLE);
        self.running = Some(id);
        self.tasks[id.index()].stack_pointer
    }

    /// The running user task, or an error for the idle task or before the
    /// first switch.
    pub(crate) fn current_user_task(&self) -> Result<TaskId, KernelError> {
        match self.running {
            Some(id) if !id.is_idle() => Ok(id),
            _ => Err(KernelError::NoCurrentTask),
        }
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    pub fn task(&self, id: TaskId) -> &TaskControlBlock {
        &self.tasks[id.index()]
    }

    /// Number of user tasks, not counting idle.
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// The task executing on the CPU. Differs from `current_task` only
    /// while a switch is pending.
    pub fn running_task(&self) -> Option<TaskId> {
        self.running
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.stacks.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Ticks since start, wrapping.
    pub fn now(&self) -> u32 {
        self.ticks
    }

    /// Is any user task able to run right now?
    pub fn any_ready(&self) -> bool {
        self.tasks[..self.task_count]
            .iter()
            .any(|tcb| tcb.state == TaskState::Active)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::test_support::{spin, Harness};
    use super::*;

    #[test]
    fn test_create_until_full() {
        let mut h = Harness::new();
        for i in 0..MAX_TASKS {
            let id = h.spawn(MutexMask::NONE);
            assert_eq!(id.index(), i);
            assert_eq!(h.sched.task_count(), i + 1);
        }
        let err = h
            .sched
            .create_task(spin, core::ptr::null_mut(), MutexMask::NONE)
            .unwrap_err();
        assert_eq!(err, KernelError::TaskTableFull);
        assert_eq!(h.sched.task_count(), MAX_TASKS);
    }

    #[test]
    fn test_create_requires_init() {
        let mut sched = Scheduler::new();
        assert_eq!(
            sched
                .create_task(spin, core::ptr::null_mut(), MutexMask::NONE)
                .unwrap_err(),
            KernelError::NotInitialized
        );
        assert_eq!(sched.start(spin).unwrap_err(), KernelError::NotInitialized);
    }

    #[test]
    fn test_created_task_state() {
        let mut h = Harness::new();
        let mask = MutexMask::from_indices(&[0, 2]);
        let id = h.spawn(mask);
        let tcb = h.sched.task(id);

        assert_eq!(tcb.state, TaskState::Active);
        assert_eq!(tcb.period, ROUND_ROBIN_QUANTUM);
        assert_eq!(tcb.timeout, ROUND_ROBIN_QUANTUM);
        assert_eq!(tcb.sleep_timer, 0);
        assert_eq!(tcb.mutexes, mask);
        assert_eq!(tcb.stack_pointer as usize % 8, 0);
    }

    #[test]
    fn test_timed_task_period() {
        let mut h = Harness::new();
        let id = h.spawn_timed(250);
        assert_eq!(h.sched.task(id).period, 250);
        assert_eq!(h.sched.task(id).timeout, 250);

        let rr = h.spawn_timed(0);
        assert_eq!(h.sched.task(rr).period, ROUND_ROBIN_QUANTUM);
    }

    #[test]
    fn test_task_stacks_do_not_overlap() {
        let mut h = Harness::new();
        let ids: std::vec::Vec<_> = (0..MAX_TASKS).map(|_| h.spawn(MutexMask::NONE)).collect();
        h.start();

        let mut sps: std::vec::Vec<usize> = ids
            .iter()
            .map(|&id| h.sched.task(id).stack_pointer as usize)
            .collect();
        sps.push(h.sched.task(TaskId::IDLE).stack_pointer as usize);
        for pair in sps.windows(2) {
            assert!(pair[0] - pair[1] >= crate::config::THREAD_STACK_SIZE);
        }
    }

    #[test]
    fn test_start_without_tasks_fails() {
        let mut h = Harness::new();
        assert_eq!(h.sched.start(spin), Err(KernelError::NoTasks));
        assert!(!h.sched.is_started());
    }

    #[test]
    fn test_start_builds_idle_task() {
        let mut h = Harness::new();
        h.spawn(MutexMask::NONE);
        let sp = h.sched.start(spin).unwrap();

        let idle = h.sched.task(TaskId::IDLE);
        assert_eq!(sp, idle.stack_pointer);
        assert_eq!(idle.timeout, IDLE_TIMEOUT);
        assert_eq!(idle.period, ROUND_ROBIN_QUANTUM);
        assert_eq!(h.sched.current_task(), None);
        assert_eq!(h.sched.task_count(), 1);
    }

    #[test]
    fn test_no_creation_after_start() {
        let mut h = Harness::new();
        h.spawn(MutexMask::NONE);
        h.start();
        assert_eq!(
            h.sched
                .create_task(spin, core::ptr::null_mut(), MutexMask::NONE)
                .unwrap_err(),
            KernelError::AlreadyStarted
        );
        assert_eq!(h.sched.start(spin), Err(KernelError::AlreadyStarted));
    }

    #[test]
    fn test_schedule_picks_smallest_timeout() {
        let mut h = Harness::new();
        let a = h.spawn_timed(30);
        let b = h.spawn_timed(5);
        let c = h.spawn_timed(20);
        h.start();

        assert_eq!(h.sched.schedule(), b);
        h.sched.tasks[b.index()].state = TaskState::Waiting;
        assert_eq!(h.sched.schedule(), c);
        h.sched.tasks[c.index()].state = TaskState::Blocked;
        assert_eq!(h.sched.schedule(), a);
    }

    #[test]
    fn test_schedule_tie_goes_to_lower_index() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::NONE);
        let b = h.spawn(MutexMask::NONE);
        h.start();
        assert_eq!(h.sched.task(a).timeout, h.sched.task(b).timeout);
        assert_eq!(h.sched.schedule(), a);
    }

    #[test]
    fn test_schedule_falls_back_to_idle() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::NONE);
        let b = h.spawn(MutexMask::NONE);
        h.start();
        h.sched.tasks[a.index()].state = TaskState::Waiting;
        h.sched.tasks[b.index()].timeout = 0;

        for _ in 0..5 {
            assert_eq!(h.sched.schedule(), TaskId::IDLE);
            assert_eq!(h.sched.current_task(), Some(TaskId::IDLE));
        }
    }

    #[test]
    fn test_schedule_leaves_timers_alone() {
        let mut h = Harness::new();
        let a = h.spawn_timed(3);
        h.start();
        h.sched.schedule();
        assert_eq!(h.sched.task(a).timeout, 3);
        assert_eq!(h.sched.task(a).state, TaskState::Active);
    }

    #[test]
    fn test_tick_without_transition_is_quiet() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::NONE);
        h.start();
        h.sched.schedule();
        let sp = h.sched.task(a).stack_pointer;

        assert!(!h.sched.tick(core::ptr::null_mut()));
        assert_eq!(h.sched.task(a).timeout, ROUND_ROBIN_QUANTUM - 1);
        assert_eq!(h.sched.task(a).stack_pointer, sp);
        assert_eq!(h.sched.current_task(), Some(a));
        assert_eq!(h.sched.now(), 1);
    }

    #[test]
    fn test_tick_wakes_waiting_task() {
        let mut h = Harness::new();
        let a = h.spawn_timed(4);
        h.start();
        h.sched.tasks[a.index()].state = TaskState::Waiting;
        h.sched.tasks[a.index()].timeout = 1;
        h.run(TaskId::IDLE);

        assert!(h.tick());
        assert_eq!(h.sched.task(a).state, TaskState::Active);
        assert_eq!(h.sched.task(a).timeout, 4);
        assert_eq!(h.sched.current_task(), Some(a));
    }

    #[test]
    fn test_tick_preempts_task_at_end_of_quantum() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::NONE);
        h.start();
        h.run(a);
        h.sched.tasks[a.index()].timeout = 1;
        let saved = h.sched.task(a).stack_pointer;

        assert!(h.tick());
        assert_eq!(h.sched.task(a).state, TaskState::Waiting);
        assert_eq!(h.sched.task(a).timeout, ROUND_ROBIN_QUANTUM);
        assert_eq!(h.sched.task(a).stack_pointer, saved);
        assert_eq!(h.sched.current_task(), Some(TaskId::IDLE));
    }

    #[test]
    fn test_tick_records_save_point() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::NONE);
        h.start();
        h.run(a);
        h.sched.tasks[a.index()].timeout = 1;

        let mut fake_stack = [0u32; 32];
        let psp = unsafe { fake_stack.as_mut_ptr().add(20) };
        assert!(h.sched.tick(psp));
        assert_eq!(h.sched.task(a).stack_pointer, unsafe {
            fake_stack.as_mut_ptr().add(12)
        });
    }

    #[test]
    fn test_tick_skips_idle_task() {
        let mut h = Harness::new();
        h.spawn(MutexMask::NONE);
        h.start();
        h.run(TaskId::IDLE);
        h.tick();
        let idle = h.sched.task(TaskId::IDLE);
        assert_eq!(idle.timeout, IDLE_TIMEOUT);
        assert_eq!(idle.state, TaskState::Active);
    }

    #[test]
    fn test_tick_before_first_switch_saves_nothing() {
        let mut h = Harness::new();
        let a = h.spawn_timed(1);
        h.start();
        let sp = h.sched.task(a).stack_pointer;

        assert!(h.sched.tick(core::ptr::null_mut()));
        assert_eq!(h.sched.task(a).stack_pointer, sp);
    }

    #[test]
    fn test_any_ready() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::NONE);
        h.start();
        assert!(h.sched.any_ready());
        h.sched.tasks[a.index()].state = TaskState::Waiting;
        assert!(!h.sched.any_ready());
    }

    #[test]
    fn test_tick_before_pending_switch_saves_outgoing_task() {
        let mut h = Harness::new();
        let a = h.spawn_timed(2);
        let b = h.spawn_timed(3);
        let c = h.spawn_timed(50);
        h.start();
        h.run(a);

        // `a` yields; the switch to `b` is pended but not yet performed
        let psp = h.live_sp();
        assert!(h.sched.handle_trap(crate::syscall::SvcCall::Yield as u8, psp));
        assert_eq!(h.sched.current_task(), Some(b));
        assert_eq!(h.sched.running_task(), Some(a));
        let b_sp = h.sched.task(b).stack_pointer;

        // A tick taken before the switch, with `c` waking up
        h.sched.tasks[c.index()].state = TaskState::Waiting;
        h.sched.tasks[c.index()].timeout = 1;
        assert!(h.sched.tick(psp));

        assert_eq!(h.sched.task(b).stack_pointer, b_sp);
        assert_eq!(h.sched.task(a).stack_pointer, context::save_point(psp));
        assert_eq!(h.sched.current_task(), Some(b));
        assert_eq!(h.sched.switch_target(), b_sp);
        assert_eq!(h.sched.running_task(), Some(b));
    }
}
