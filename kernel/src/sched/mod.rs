//! Task management and cooperative scheduling

pub mod scheduler;
pub mod task;

pub use scheduler::{SchedStats, Scheduler, SwitchPlan};
pub use task::{
    build_user_entry_stack, task_create_elf, KernelStack, Task, TaskId, TaskState,
    KERNEL_STACK_SIZE, USER_EFLAGS,
};

use spin::Mutex;

/// Global scheduler instance
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Id of the task currently on the CPU.
pub fn current_task_id() -> Option<TaskId> {
    SCHEDULER.lock().current()
}

/// Cooperative yield: pick the next Ready task and switch to it. The plan
/// is computed under the lock and executed after it is dropped.
pub fn yield_cpu() {
    let plan = SCHEDULER.lock().schedule();
    if let Some(plan) = plan {
        execute_switch(plan);
    }
}

/// Park the current task (state -> Waiting) and yield.
pub fn block_current() {
    SCHEDULER.lock().block_current();
    yield_cpu();
}

/// Make a parked task runnable again.
pub fn wake(id: TaskId) {
    SCHEDULER.lock().wake(id);
}

/// Terminate the current task and hand the CPU onward.
pub fn exit_current(code: i32) {
    SCHEDULER.lock().exit_current(code);
    yield_cpu();
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn execute_switch(plan: SwitchPlan) {
    // SAFETY: the plan was produced by the scheduler for this CPU; the
    // target ESP/CR3 belong to a live TCB.
    unsafe {
        task::switch_context(plan.prev_esp as *mut u32, plan.next_esp as u32, plan.next_cr3);
    }
}

/// Host builds switch bookkeeping only; there is no stack to swap.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn execute_switch(plan: SwitchPlan) {
    crate::arch::write_cr3(plan.next_cr3);
}
