// mimic-rt - cooperative runtime for MIMI programs
//
// A Machine owns everything the reference kernel kept in one static
// struct: the two memory pools and their arenas, the task table, the
// filesystem collaborator, the console, the board and the boot clock.
// Loaded programs execute on the Thumb interpreter; task switches happen
// only at the explicit suspension points (syscalls, exit, return).

pub mod exec;
pub mod fs;
pub mod loader;
pub mod pool;
pub mod syscall;
pub mod task;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

use mimi::err::ErrCode;
use mimi::format::Arch;

use exec::Event;
use fs::FileSys;
use loader::{lock, LoadCtx};
use pool::Pool;
use syscall::{Board, NullBoard, SysOutcome};
use task::{TaskTable, TaskState, REG_LR, REG_PC, REG_SP};

/// Arena sizing for the smaller reference target.
pub const KERNEL_HEAP: u32 = 50 * 1024;
pub const USER_HEAP: u32 = 180 * 1024;

/// The running target's instruction set.
pub const ARCH: Arch = Arch::CortexM0Plus;

pub struct Machine {
    pub kernel_pool: Mutex<Pool>,
    pub user_pool: Mutex<Pool>,
    pub kernel_mem: Vec<u8>,
    pub user_mem: Vec<u8>,
    pub tasks: TaskTable,
    pub fs: Box<dyn FileSys>,
    pub board: Box<dyn Board>,
    pub console_out: Vec<u8>,
    pub console_in: VecDeque<u8>,
    boot: Instant,
}

impl Machine {
    pub fn new(fs: Box<dyn FileSys>) -> Machine {
        Machine::with_board(fs, Box::new(NullBoard))
    }

    pub fn with_board(fs: Box<dyn FileSys>, board: Box<dyn Board>) -> Machine {
        Machine {
            kernel_pool: Mutex::new(Pool::new("kernel", 0, KERNEL_HEAP)),
            user_pool: Mutex::new(Pool::new("user", 0, USER_HEAP)),
            kernel_mem: vec![0; KERNEL_HEAP as usize],
            user_mem: vec![0; USER_HEAP as usize],
            tasks: TaskTable::new(),
            fs,
            board,
            console_out: Vec::new(),
            console_in: VecDeque::new(),
            boot: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }

    /// Loads a MIMI from the filesystem into a fresh task slot. On success
    /// the task is READY with its registers parked at the entry point.
    pub fn load_task(&mut self, path: &str, priority: u8) -> Result<u32, ErrCode> {
        let id = self.tasks.alloc().ok_or(ErrCode::Nomem)?;
        let mut tcb = self.tasks.get(id).clone();

        let loaded = loader::load(
            LoadCtx {
                fs: self.fs.as_mut(),
                user_pool: &self.user_pool,
                user_mem: &mut self.user_mem,
                kernel_pool: &self.kernel_pool,
                kernel_mem: &mut self.kernel_mem,
            },
            path,
            &mut tcb,
            ARCH,
        );
        if let Err(e) = loaded {
            self.tasks.release(id);
            return Err(e);
        }

        tcb.regs = task::Regs::default();
        tcb.regs.r[REG_SP] = tcb.mem.base + tcb.mem.stack_top;
        tcb.regs.r[REG_LR] = exec::RETURN_TO;
        tcb.regs.r[REG_PC] = tcb.entry & !1;
        *self.tasks.get_mut(id) = tcb;
        self.tasks.set_ready(id, priority);
        info!("[LOAD] task {id} '{}' ready", self.tasks.get(id).name);
        Ok(id)
    }

    /// ZOMBIE transition plus reclamation of everything the task owns.
    pub fn kill(&mut self, id: u32) {
        if id == 0 || self.tasks.get(id).state == TaskState::Free {
            return;
        }
        self.tasks.get_mut(id).state = TaskState::Zombie;
        lock(&self.user_pool).free_all_owned_by(id);
        self.tasks.release(id);
    }

    /// Cooperative dispatch until every user task is gone. Returns the
    /// exit code of the last task to finish. `fuel` bounds the total
    /// number of interpreted instructions.
    pub fn run(&mut self, mut fuel: u64) -> Result<i32, ErrCode> {
        let mut last_exit = 0i32;
        loop {
            if !self.tasks.user_tasks_alive() {
                return Ok(last_exit);
            }
            let id = self.tasks.tick(self.now_ms());
            if id == 0 {
                // Only idle is runnable; wait for the nearest sleeper.
                if self.tasks.next_wake().is_none() {
                    return Err(ErrCode::Busy);
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            let mut regs = self.tasks.get(id).regs.clone();
            let outcome = loop {
                match exec::run(&mut regs, &mut self.user_mem, &mut fuel) {
                    Event::Svc(_) => match syscall::dispatch(self, id, &regs) {
                        SysOutcome::Continue(ret) => {
                            regs.r[0] = ret as u32;
                        }
                        other => break Ok(other),
                    },
                    Event::Returned => break Ok(SysOutcome::Exit(regs.r[0] as i32)),
                    Event::Fault(e) => break Err(e),
                    Event::OutOfFuel => break Err(ErrCode::Busy),
                }
            };

            match outcome {
                Ok(SysOutcome::Continue(_)) => unreachable!("handled inline"),
                Ok(SysOutcome::Yield) => {
                    regs.r[0] = 0;
                    self.tasks.get_mut(id).regs = regs;
                    self.tasks.get_mut(id).state = TaskState::Ready;
                }
                Ok(SysOutcome::Sleep(wake_at)) => {
                    regs.r[0] = 0;
                    self.tasks.get_mut(id).regs = regs;
                    self.tasks.sleep(id, wake_at);
                }
                Ok(SysOutcome::Exit(code)) => {
                    info!("[TASK] {id} exited with {code}");
                    last_exit = code;
                    self.tasks.get_mut(id).exit_code = code;
                    self.kill(id);
                }
                Err(e) => {
                    warn!("[TASK] {id} faulted: {e}");
                    self.kill(id);
                    return Err(e);
                }
            }
        }
    }

    /// Drains everything written through putchar/puts.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.console_out)
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.console_in.extend(bytes.iter().copied());
    }
}
