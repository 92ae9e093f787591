// task.rs - task control blocks and the cooperative scheduler
//
// A fixed array of TCBs indexed by task id. Slot 0 is the kernel/idle
// task and is RUNNING from initialisation. Scheduling is a priority pick
// at explicit suspension points: wake due sleepers, choose the READY task
// with the numerically smallest priority (ties to the smallest id), fall
// back to idle.

pub const MAX_TASKS: usize = 8;
pub const IDLE_PRIORITY: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
}

/// Saved register image for cooperative switching. r13 is SP, r14 LR,
/// r15 the resume PC.
#[derive(Debug, Clone, Default)]
pub struct Regs {
    pub r: [u32; 16],
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

pub const REG_SP: usize = 13;
pub const REG_LR: usize = 14;
pub const REG_PC: usize = 15;

/// Placement of a loaded image, all offsets relative to `base`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemLayout {
    pub base: u32,
    pub total_size: u32,
    pub text_start: u32,
    pub text_size: u32,
    pub rodata_start: u32,
    pub rodata_size: u32,
    pub data_start: u32,
    pub data_size: u32,
    pub bss_start: u32,
    pub bss_size: u32,
    pub heap_start: u32,
    pub heap_size: u32,
    pub heap_used: u32,
    pub stack_top: u32,
    pub stack_size: u32,
}

#[derive(Debug, Clone)]
pub struct Tcb {
    pub id: u32,
    pub name: String,
    pub state: TaskState,
    pub priority: u8,
    pub mem: MemLayout,
    pub entry: u32,
    pub wake_at: u64,
    pub exit_code: i32,
    pub regs: Regs,
}

impl Tcb {
    fn empty(id: u32) -> Tcb {
        Tcb {
            id,
            name: String::new(),
            state: TaskState::Free,
            priority: IDLE_PRIORITY,
            mem: MemLayout::default(),
            entry: 0,
            wake_at: 0,
            exit_code: 0,
            regs: Regs::default(),
        }
    }
}

#[derive(Debug)]
pub struct TaskTable {
    tasks: Vec<Tcb>,
    current: u32,
}

impl TaskTable {
    pub fn new() -> TaskTable {
        let mut tasks: Vec<Tcb> = (0..MAX_TASKS as u32).map(Tcb::empty).collect();
        tasks[0].name = "kernel".into();
        tasks[0].state = TaskState::Running;
        tasks[0].priority = IDLE_PRIORITY;
        TaskTable { tasks, current: 0 }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn get(&self, id: u32) -> &Tcb {
        &self.tasks[id as usize]
    }

    pub fn get_mut(&mut self, id: u32) -> &mut Tcb {
        &mut self.tasks[id as usize]
    }

    /// Claims a free slot (never slot 0). The slot starts BLOCKED so the
    /// scheduler ignores it until the loader finishes.
    pub fn alloc(&mut self) -> Option<u32> {
        for i in 1..MAX_TASKS {
            if self.tasks[i].state == TaskState::Free {
                self.tasks[i] = Tcb::empty(i as u32);
                self.tasks[i].state = TaskState::Blocked;
                return Some(i as u32);
            }
        }
        None
    }

    /// Returns a slot to FREE without the zombie transition (load
    /// failures).
    pub fn release(&mut self, id: u32) {
        if id != 0 {
            self.tasks[id as usize] = Tcb::empty(id);
        }
    }

    pub fn set_ready(&mut self, id: u32, priority: u8) {
        let t = self.get_mut(id);
        t.priority = priority;
        t.state = TaskState::Ready;
    }

    /// Moves the calling task to SLEEPING. Sleeping in kernel context is
    /// a no-op.
    pub fn sleep(&mut self, id: u32, wake_at: u64) {
        if id == 0 {
            return;
        }
        let t = self.get_mut(id);
        t.wake_at = wake_at;
        t.state = TaskState::Sleeping;
    }

    /// One scheduler step: wake due sleepers, pick the best READY task,
    /// switch. Returns the id now RUNNING (0 when only idle remains).
    pub fn tick(&mut self, now_ms: u64) -> u32 {
        for t in self.tasks.iter_mut().skip(1) {
            if t.state == TaskState::Sleeping && now_ms >= t.wake_at {
                t.state = TaskState::Ready;
            }
        }

        let mut next: u32 = 0;
        let mut best = IDLE_PRIORITY;
        for t in self.tasks.iter().skip(1) {
            if t.state == TaskState::Ready && t.priority < best {
                best = t.priority;
                next = t.id;
            }
        }

        if next != self.current {
            let cur = self.current as usize;
            if self.tasks[cur].state == TaskState::Running {
                self.tasks[cur].state = TaskState::Ready;
            }
            self.current = next;
        }
        self.tasks[next as usize].state = TaskState::Running;
        next
    }

    /// Any task besides idle still holding a slot.
    pub fn user_tasks_alive(&self) -> bool {
        self.tasks
            .iter()
            .skip(1)
            .any(|t| !matches!(t.state, TaskState::Free | TaskState::Zombie))
    }

    /// Earliest pending wake time, if any task sleeps.
    pub fn next_wake(&self) -> Option<u64> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Sleeping)
            .map(|t| t.wake_at)
            .min()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        TaskTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_zero_is_the_kernel() {
        let t = TaskTable::new();
        assert_eq!(t.get(0).state, TaskState::Running);
        assert_eq!(t.get(0).priority, IDLE_PRIORITY);
        assert_eq!(t.current(), 0);
        assert!(!t.user_tasks_alive());
    }

    #[test]
    fn alloc_skips_slot_zero_and_exhausts() {
        let mut t = TaskTable::new();
        let mut ids = Vec::new();
        while let Some(id) = t.alloc() {
            ids.push(id);
        }
        assert_eq!(ids.len(), MAX_TASKS - 1);
        assert!(ids.iter().all(|&i| i != 0));
        t.release(ids[0]);
        assert_eq!(t.alloc(), Some(ids[0]));
    }

    #[test]
    fn priority_pick_with_id_tiebreak() {
        let mut t = TaskTable::new();
        let a = t.alloc().unwrap();
        let b = t.alloc().unwrap();
        let c = t.alloc().unwrap();
        t.set_ready(a, 20);
        t.set_ready(b, 10);
        t.set_ready(c, 10);

        // b and c tie at 10; the smaller id wins.
        assert_eq!(t.tick(0), b);
        assert_eq!(t.get(b).state, TaskState::Running);
        assert_eq!(t.get(a).state, TaskState::Ready);

        // The running task is not READY, so the next tick picks c.
        assert_eq!(t.tick(0), c);
        assert_eq!(t.get(b).state, TaskState::Ready);
    }

    #[test]
    fn idle_is_the_fallback() {
        let mut t = TaskTable::new();
        let a = t.alloc().unwrap();
        t.set_ready(a, 5);
        assert_eq!(t.tick(0), a);
        t.sleep(a, 100);
        assert_eq!(t.tick(0), 0);
        assert_eq!(t.get(0).state, TaskState::Running);
    }

    #[test]
    fn sleepers_wake_at_their_time() {
        let mut t = TaskTable::new();
        let a = t.alloc().unwrap();
        t.set_ready(a, 5);
        assert_eq!(t.tick(0), a);
        t.sleep(a, 50);

        assert_eq!(t.tick(10), 0);
        assert_eq!(t.get(a).state, TaskState::Sleeping);
        assert_eq!(t.next_wake(), Some(50));
        // Wakes no earlier than wake_at.
        assert_eq!(t.tick(50), a);
        assert_eq!(t.get(a).state, TaskState::Running);
    }

    #[test]
    fn kernel_sleep_is_a_noop() {
        let mut t = TaskTable::new();
        t.sleep(0, 1000);
        assert_eq!(t.get(0).state, TaskState::Running);
    }
}
