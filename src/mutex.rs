//! # Mutexes
//!
//! A fixed table of mutexes, each with a FIFO queue of waiting tasks.
//!
//! Tasks declare up front, as a [`MutexMask`], which mutexes they use.
//! [`Scheduler::acquire_mutexes`] claims every declared mutex that is free
//! and queues the caller on every one that is held; a task left waiting on
//! anything becomes [`TaskState::Blocked`] and must trap out.
//! [`Scheduler::release_mutexes`] hands each mutex the caller owns to the
//! head of its queue, or frees it when nobody is waiting. A blocked task
//! runs again once it owns everything it queued for.

use core::fmt;

use heapless::{Deque, Vec};

use crate::config::{MAX_MUTEXES, MAX_TASKS};
use crate::error::KernelError;
use crate::scheduler::Scheduler;
use crate::task::{TaskId, TaskState};

/// Index of a mutex, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MutexId(usize);

impl MutexId {
    /// Slot index in the mutex table.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{:02}", self.0)
    }
}

/// The set of mutexes a task declares it will use. Bit `n` is mutex `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MutexMask(u32);

impl MutexMask {
    /// Uses no mutexes.
    pub const NONE: MutexMask = MutexMask(0);

    /// Build a mask from mutex indices. Indices of `MAX_MUTEXES` or more
    /// are dropped.
    pub const fn from_indices(indices: &[usize]) -> MutexMask {
        let mut bits = 0;
        let mut i = 0;
        while i < indices.len() {
            if indices[i] < MAX_MUTEXES {
                bits |= 1 << indices[i];
            }
            i += 1;
        }
        MutexMask(bits)
    }

    /// This mask plus `id`.
    pub const fn with(self, id: MutexId) -> MutexMask {
        MutexMask(self.0 | (1 << id.0))
    }

    /// Does the mask include `id`?
    pub const fn contains(self, id: MutexId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The declared mutexes, lowest index first.
    pub fn iter(self) -> impl Iterator<Item = MutexId> {
        (0..MAX_MUTEXES)
            .map(MutexId)
            .filter(move |&id| self.contains(id))
    }
}

impl From<[bool; MAX_MUTEXES]> for MutexMask {
    fn from(uses: [bool; MAX_MUTEXES]) -> MutexMask {
        uses.into_iter()
            .enumerate()
            .filter(|&(_, used)| used)
            .fold(MutexMask::NONE, |mask, (index, _)| mask.with(MutexId(index)))
    }
}

/// One mutex. It is available exactly when it has no owner.
pub struct Mutex {
    owner: Option<TaskId>,
    waiters: Deque<TaskId, MAX_TASKS>,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            owner: None,
            waiters: Deque::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.owner.is_none()
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// Waiting tasks, longest-waiting first.
    pub fn waiters(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.waiters.iter().copied()
    }

    pub fn is_queued(&self, task: TaskId) -> bool {
        self.waiters.iter().any(|&t| t == task)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

/// Fixed-capacity mutex storage, indexed by [`MutexId`].
pub type MutexTable = Vec<Mutex, MAX_MUTEXES>;

/// What [`Scheduler::acquire_mutexes`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Acquisition {
    /// The caller owns every mutex it declared.
    Granted,
    /// The caller is queued on at least one mutex and is now blocked.
    Blocked,
}

impl Scheduler {
    /// Add a mutex to the table. Only allowed between `init` and the
    /// kernel starting.
    pub fn create_mutex(&mut self) -> Result<MutexId, KernelError> {
        if self.is_started() {
            return Err(KernelError::AlreadyStarted);
        }
        if !self.is_initialized() {
            return Err(KernelError::NotInitialized);
        }
        let id = MutexId(self.mutexes.len());
        self.mutexes.push(Mutex::new()).map_err(|_| {
            warn!("mutex table full");
            KernelError::MutexTableFull
        })?;
        info!("created mutex {}", id);
        Ok(id)
    }

    /// Number of mutexes created so far.
    pub fn mutex_count(&self) -> usize {
        self.mutexes.len()
    }

    pub fn mutex(&self, id: MutexId) -> Option<&Mutex> {
        self.mutexes.get(id.0)
    }

    /// Try to claim every mutex the running task declared.
    ///
    /// Free mutexes are claimed on the spot, held ones queue the caller.
    /// When anything was queued the caller is marked `Blocked`; it has to
    /// trap with [`crate::syscall::SvcCall::Block`] to give up the CPU.
    pub fn acquire_mutexes(&mut self) -> Result<Acquisition, KernelError> {
        let task = self.current_user_task()?;
        let mask = self.tasks[task.index()].mutexes;
        let mut blocked = false;

        for id in mask.iter() {
            let Some(mutex) = self.mutexes.get_mut(id.0) else {
                warn!("{} declares {} which does not exist", task, id);
                continue;
            };
            match mutex.owner {
                None => {
                    mutex.owner = Some(task);
                    debug!("{} took {}", task, id);
                }
                Some(owner) if owner == task => {}
                Some(owner) => {
                    if !mutex.is_queued(task) {
                        // Holds MAX_TASKS; the owner is never queued and
                        // nobody is queued twice, so this always fits
                        mutex.waiters.push_back(task).ok();
                    }
                    debug!("{} queued on {} held by {}", task, id, owner);
                    blocked = true;
                }
            }
        }

        if blocked {
            self.tasks[task.index()].state = TaskState::Blocked;
            Ok(Acquisition::Blocked)
        } else {
            Ok(Acquisition::Granted)
        }
    }

    /// Give up every mutex the running task owns.
    ///
    /// Each one passes to the head of its queue if there is one. Returns
    /// how many blocked tasks became runnable as a result.
    pub fn release_mutexes(&mut self) -> Result<usize, KernelError> {
        let task = self.current_user_task()?;
        let mut granted: Vec<TaskId, MAX_MUTEXES> = Vec::new();

        for (index, mutex) in self.mutexes.iter_mut().enumerate() {
            if mutex.owner != Some(task) {
                continue;
            }
            mutex.owner = mutex.waiters.pop_front();
            if let Some(next) = mutex.owner {
                debug!("{} hands M{=usize:02} to {}", task, index, next);
                // One entry per mutex at most, so this always fits
                granted.push(next).ok();
            }
        }

        let mut woken = 0;
        for next in granted {
            let tcb = &self.tasks[next.index()];
            let still_waiting = self.mutexes.iter().any(|m| m.is_queued(next));
            if tcb.state == TaskState::Blocked && !still_waiting {
                self.tasks[next.index()].unblock();
                woken += 1;
            }
        }
        Ok(woken)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::Harness;

    #[test]
    fn test_mask_from_bools() {
        let mask = MutexMask::from([true, false, true]);
        assert!(mask.contains(MutexId(0)));
        assert!(!mask.contains(MutexId(1)));
        assert!(mask.contains(MutexId(2)));
        assert_eq!(mask, MutexMask::from_indices(&[0, 2]));
    }

    #[test]
    fn test_mask_iter_in_index_order() {
        let mask = MutexMask::from_indices(&[2, 0, 7]);
        let mut ids = mask.iter();
        assert_eq!(ids.next(), Some(MutexId(0)));
        assert_eq!(ids.next(), Some(MutexId(2)));
        assert_eq!(ids.next(), None);
        assert!(MutexMask::NONE.is_empty());
    }

    #[test]
    fn test_mutex_table_capacity() {
        let mut h = Harness::new();
        for i in 0..MAX_MUTEXES {
            assert_eq!(h.sched.create_mutex(), Ok(MutexId(i)));
        }
        assert_eq!(h.sched.create_mutex(), Err(KernelError::MutexTableFull));
        assert_eq!(h.sched.mutex_count(), MAX_MUTEXES);
        assert!(h.sched.mutex(MutexId(0)).is_some_and(Mutex::is_available));
    }

    #[test]
    fn test_acquire_free_mutex() {
        let mut h = Harness::new();
        let m = h.sched.create_mutex().unwrap();
        let a = h.spawn(MutexMask::NONE.with(m));
        h.start();
        h.run(a);

        assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Granted));
        let mutex = h.sched.mutex(m).unwrap();
        assert!(!mutex.is_available());
        assert_eq!(mutex.owner(), Some(a));
        assert_eq!(h.sched.task(a).state, TaskState::Active);
    }

    #[test]
    fn test_contended_mutex_queues_second_task() {
        let mut h = Harness::new();
        let m = h.sched.create_mutex().unwrap();
        let a = h.spawn(MutexMask::NONE.with(m));
        let b = h.spawn(MutexMask::NONE.with(m));
        h.start();

        h.run(a);
        assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Granted));
        h.run(b);
        assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Blocked));

        let mutex = h.sched.mutex(m).unwrap();
        assert_eq!(mutex.owner(), Some(a));
        assert_eq!(mutex.waiters().collect::<std::vec::Vec<_>>(), [b]);
        assert_eq!(h.sched.task(b).state, TaskState::Blocked);
        assert!(!h.sched.task(b).is_eligible());
    }

    #[test]
    fn test_repeat_acquire_does_not_queue_twice() {
        let mut h = Harness::new();
        let m = h.sched.create_mutex().unwrap();
        let a = h.spawn(MutexMask::NONE.with(m));
        let b = h.spawn(MutexMask::NONE.with(m));
        h.start();

        h.run(a);
        h.sched.acquire_mutexes().unwrap();
        assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Granted));
        h.run(b);
        h.sched.acquire_mutexes().unwrap();
        h.sched.acquire_mutexes().unwrap();
        assert_eq!(h.sched.mutex(m).unwrap().waiters().count(), 1);
    }

    #[test]
    fn test_release_hands_over_in_fifo_order() {
        let mut h = Harness::new();
        let m = h.sched.create_mutex().unwrap();
        let mask = MutexMask::NONE.with(m);
        let a = h.spawn(mask);
        let b = h.spawn(mask);
        let c = h.spawn(mask);
        h.start();

        h.run(a);
        h.sched.acquire_mutexes().unwrap();
        h.run(c);
        h.sched.acquire_mutexes().unwrap();
        h.run(b);
        h.sched.acquire_mutexes().unwrap();

        h.run(a);
        assert_eq!(h.sched.release_mutexes(), Ok(1));
        assert_eq!(h.sched.mutex(m).unwrap().owner(), Some(c));
        assert_eq!(h.sched.task(c).state, TaskState::Active);
        assert_eq!(h.sched.task(c).timeout, h.sched.task(c).period);
        assert_eq!(h.sched.task(b).state, TaskState::Blocked);

        h.run(c);
        assert_eq!(h.sched.release_mutexes(), Ok(1));
        assert_eq!(h.sched.mutex(m).unwrap().owner(), Some(b));

        h.run(b);
        assert_eq!(h.sched.release_mutexes(), Ok(0));
        assert!(h.sched.mutex(m).unwrap().is_available());
    }

    #[test]
    fn test_task_waiting_on_two_mutexes_wakes_when_it_owns_both() {
        let mut h = Harness::new();
        let m0 = h.sched.create_mutex().unwrap();
        let m1 = h.sched.create_mutex().unwrap();
        let a = h.spawn(MutexMask::NONE.with(m0));
        let b = h.spawn(MutexMask::NONE.with(m1));
        let c = h.spawn(MutexMask::NONE.with(m0).with(m1));
        h.start();

        h.run(a);
        h.sched.acquire_mutexes().unwrap();
        h.run(b);
        h.sched.acquire_mutexes().unwrap();
        h.run(c);
        assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Blocked));

        h.run(a);
        assert_eq!(h.sched.release_mutexes(), Ok(0));
        assert_eq!(h.sched.mutex(m0).unwrap().owner(), Some(c));
        assert_eq!(h.sched.task(c).state, TaskState::Blocked);

        h.run(b);
        assert_eq!(h.sched.release_mutexes(), Ok(1));
        assert_eq!(h.sched.mutex(m1).unwrap().owner(), Some(c));
        assert_eq!(h.sched.task(c).state, TaskState::Active);
    }

    #[test]
    fn test_undeclared_mutex_is_skipped() {
        let mut h = Harness::new();
        let a = h.spawn(MutexMask::from_indices(&[1]));
        h.start();
        h.run(a);
        assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Granted));
    }

    #[test]
    fn test_acquire_needs_running_task() {
        let mut h = Harness::new();
        h.sched.create_mutex().unwrap();
        h.spawn(MutexMask::from_indices(&[0]));
        assert_eq!(h.sched.acquire_mutexes(), Err(KernelError::NoCurrentTask));
        assert_eq!(h.sched.release_mutexes(), Err(KernelError::NoCurrentTask));
    }

    #[test]
    fn test_mutexes_need_init() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.create_mutex(), Err(KernelError::NotInitialized));
        assert_eq!(sched.mutex_count(), 0);
    }

    #[test]
    fn test_every_other_task_fits_in_a_wait_queue() {
        let mut h = Harness::new();
        let m = h.sched.create_mutex().unwrap();
        let ids: std::vec::Vec<_> = (0..MAX_TASKS)
            .map(|_| h.spawn(MutexMask::NONE.with(m)))
            .collect();
        h.start();

        h.run(ids[0]);
        h.sched.acquire_mutexes().unwrap();
        for &id in &ids[1..] {
            h.run(id);
            assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Blocked));
            assert_eq!(h.sched.acquire_mutexes(), Ok(Acquisition::Blocked));
        }
        let waiters: std::vec::Vec<_> = h.sched.mutex(m).unwrap().waiters().collect();
        assert_eq!(waiters, ids[1..]);
    }

    #[test]
    fn test_mutexes_cannot_be_created_after_start() {
        let mut h = Harness::new();
        h.spawn(MutexMask::NONE);
        h.start();
        assert_eq!(h.sched.create_mutex(), Err(KernelError::AlreadyStarted));
    }
}
