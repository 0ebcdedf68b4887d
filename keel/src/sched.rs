//! Cooperative scheduler
//!
//! One main loop runs the registered tasks; one timer interrupt runs due timers. The dispatch loop
//! spins for timers that are almost due instead of leaving and re-entering the interrupt, but
//! bounds how long it may keep the main loop starved. Fatal errors from either side are recorded
//! in the [`ShutdownState`] and handled by the main loop.
use crate::hal::TimerBackend;
use crate::registry::Registry;
use crate::shutdown::{
    shutdown, Shutdown, ShutdownReporter, ShutdownState, TIMER_IN_PAST, TIMER_QUEUE_FULL,
    TIMER_RESERVED_ID, TIMER_TOO_CLOSE,
};
use crate::tick::Tick;
use crate::timer::{Callback, TimerAction, TimerEntry, TimerFn, TimerId, TimerQueue};
use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use critical_section::Mutex;

/// Timing constants of the dispatch loop, in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPolicy {
    /// Timers due sooner than this are waited for inside the dispatch loop
    pub min_try_ticks: u32,
    /// Re-arm delay when the dispatch loop yields to busy tasks
    pub defer_repeat_ticks: u32,
    /// Dispatch budget granted after yielding to busy tasks
    pub repeat_ticks: u32,
    /// Dispatch budget while tasks are idle
    pub idle_repeat_ticks: u32,
    /// How late a timer may be found once the budget is spent
    pub past_margin_ticks: u32,
    /// Period of the built in wrap timer
    pub wrap_ticks: u32,
}

impl TimerPolicy {
    pub const fn from_ticks_per_us(ticks_per_us: u32) -> Self {
        Self {
            min_try_ticks: 2 * ticks_per_us,
            defer_repeat_ticks: 5 * ticks_per_us,
            repeat_ticks: 100 * ticks_per_us,
            idle_repeat_ticks: 500 * ticks_per_us,
            past_margin_ticks: 1000 * ticks_per_us,
            wrap_ticks: 2000 * ticks_per_us,
        }
    }

    /// Overrides the wrap timer period, e.g. for 16 bit counters that wrap sooner
    pub const fn with_wrap_ticks(mut self, wrap_ticks: u32) -> Self {
        self.wrap_ticks = wrap_ticks;
        self
    }
}

/// Single bit wake flag, settable from interrupt context
pub struct TaskWake {
    wake: AtomicBool,
}

impl TaskWake {
    pub const fn new() -> Self {
        Self {
            wake: AtomicBool::new(false),
        }
    }

    pub(crate) fn set(&self) {
        self.wake.store(true, Ordering::Release);
    }

    /// Consumes the flag, returning whether it was set
    pub fn check(&self) -> bool {
        if !self.wake.load(Ordering::Acquire) {
            return false;
        }
        self.wake.store(false, Ordering::Release);
        true
    }
}

impl Default for TaskWake {
    fn default() -> Self {
        Self::new()
    }
}

const TS_IDLE: u8 = 0;
const TS_REQUESTED: u8 = 1;
const TS_RUNNING: u8 = 2;

pub struct Scheduler<'a, C: 'static, B, const N: usize = 32> {
    backend: B,
    shutdown: &'a ShutdownState,
    policy: TimerPolicy,
    timers: Mutex<RefCell<TimerQueue<C, N>>>,
    repeat_until: Mutex<Cell<Tick>>,
    tasks_status: AtomicU8,
}

impl<'a, C: 'static, B: TimerBackend, const N: usize> Scheduler<'a, C, B, N> {
    pub const fn new(backend: B, shutdown: &'a ShutdownState, policy: TimerPolicy) -> Self {
        Self {
            backend,
            shutdown,
            policy,
            timers: Mutex::new(RefCell::new(TimerQueue::new())),
            repeat_until: Mutex::new(Cell::new(Tick(0))),
            tasks_status: AtomicU8::new(TS_REQUESTED),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn policy(&self) -> &TimerPolicy {
        &self.policy
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        self.shutdown
    }

    /// Converts microseconds to ticks of the backend clock
    pub fn timer_from_us(&self, us: u32) -> u32 {
        us.wrapping_mul(self.backend.ticks_per_us())
    }

    /// Arms the wrap timer and the dispatch budget; `run` calls this itself
    pub fn start(&self) {
        let now = self.backend.now();
        self.set_repeat_until(now + self.policy.idle_repeat_ticks);
        self.install_wrap_timer(now);
    }

    fn install_wrap_timer(&self, now: Tick) {
        let waketime = now + self.policy.wrap_ticks;
        critical_section::with(|cs| {
            let mut timers = self.timers.borrow_ref_mut(cs);
            timers.reset();
            // The wrap timer never competes for space with itself
            let _ = timers.insert(TimerEntry {
                id: TimerId::WRAP,
                waketime,
                callback: Callback::Wrap,
            });
        });
        self.kick();
    }

    fn kick(&self) {
        if let Some(head) = critical_section::with(|cs| self.timers.borrow_ref(cs).head()) {
            self.backend.arm(head);
        }
    }

    fn set_repeat_until(&self, t: Tick) {
        critical_section::with(|cs| self.repeat_until.borrow(cs).set(t));
    }

    /// Signals the main loop that some task has work
    pub fn wake_tasks(&self) {
        self.tasks_status.store(TS_REQUESTED, Ordering::Release);
    }

    /// Sets `wake` and wakes the main loop
    pub fn wake_task(&self, wake: &TaskWake) {
        self.wake_tasks();
        wake.set();
    }

    /// Consumes a task's wake flag
    pub fn check_wake(&self, wake: &TaskWake) -> bool {
        wake.check()
    }

    /// Whether the main loop has pending work
    pub fn tasks_busy(&self) -> bool {
        self.tasks_status.load(Ordering::Acquire) != TS_IDLE
    }

    /// Busy unless the tasks went idle since the previous call
    fn check_set_tasks_busy(&self) -> bool {
        critical_section::with(|_| {
            if self.tasks_status.load(Ordering::Acquire) != TS_IDLE {
                return true;
            }
            self.tasks_status.store(TS_REQUESTED, Ordering::Release);
            false
        })
    }

    /// Schedules `func` at `waketime`, replacing a pending timer with the same id
    ///
    /// [`TimerId::WRAP`] belongs to the scheduler and is refused.
    pub fn add_timer(&self, id: TimerId, waketime: Tick, func: TimerFn<C>) -> Result<(), Shutdown> {
        if id == TimerId::WRAP {
            return Err(shutdown(TIMER_RESERVED_ID));
        }
        let entry = TimerEntry {
            id,
            waketime,
            callback: Callback::User(func),
        };
        let is_head = critical_section::with(|cs| self.timers.borrow_ref_mut(cs).insert(entry))
            .map_err(|_| shutdown(TIMER_QUEUE_FULL))?;
        if is_head {
            if waketime.is_before(self.backend.now()) {
                self.try_shutdown(TIMER_TOO_CLOSE);
            }
            self.backend.arm(waketime);
        }
        Ok(())
    }

    /// Cancels a pending timer; returns whether it was queued
    pub fn del_timer(&self, id: TimerId) -> bool {
        critical_section::with(|cs| self.timers.borrow_ref_mut(cs).remove(id))
    }

    pub fn timer_pending(&self, id: TimerId) -> bool {
        critical_section::with(|cs| self.timers.borrow_ref(cs).contains(id))
    }

    /// Number of queued timers, the wrap timer included
    pub fn queued_timers(&self) -> usize {
        critical_section::with(|cs| self.timers.borrow_ref(cs).len())
    }

    fn head(&self) -> Option<Tick> {
        critical_section::with(|cs| self.timers.borrow_ref(cs).head())
    }

    /// Runs the head timer, returning the wake time of the new head
    fn dispatch_one(&self, context: &mut C) -> Result<Option<Tick>, Shutdown> {
        let entry = critical_section::with(|cs| self.timers.borrow_ref_mut(cs).pop_head());
        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let action = match entry.callback {
            Callback::Wrap => {
                self.wake_tasks();
                TimerAction::Reschedule(entry.waketime + self.policy.wrap_ticks)
            }
            Callback::User(func) => func(context, entry.id, entry.waketime)?,
        };
        critical_section::with(|cs| -> Result<Option<Tick>, Shutdown> {
            let mut timers = self.timers.borrow_ref_mut(cs);
            if let TimerAction::Reschedule(waketime) = action {
                timers
                    .insert(TimerEntry { waketime, ..entry })
                    .map_err(|_| shutdown(TIMER_QUEUE_FULL))?;
            }
            Ok(timers.head())
        })
    }

    /// Runs due timers; the body of the timer interrupt
    pub fn timer_dispatch(&self, context: &mut C) -> Result<(), Shutdown> {
        let mut repeat_until = critical_section::with(|cs| self.repeat_until.borrow(cs).get());
        match self.head() {
            None => return Ok(()),
            Some(head) if self.backend.now().is_before(head) => {
                self.backend.arm(head);
                return Ok(());
            }
            Some(_) => {}
        }
        loop {
            let next = match self.dispatch_one(context)? {
                Some(next) => next,
                None => return Ok(()),
            };
            let now = self.backend.now();
            let mut diff = next.diff(now);
            if diff > self.policy.min_try_ticks as i32 {
                self.backend.arm(next);
                return Ok(());
            }
            if repeat_until.is_before(now) {
                if diff < -(self.policy.past_margin_ticks as i32) {
                    return Err(shutdown(TIMER_IN_PAST));
                }
                if self.check_set_tasks_busy() {
                    trace!("timer dispatch yielding to tasks");
                    self.set_repeat_until(now + self.policy.repeat_ticks);
                    self.backend.arm(now + self.policy.defer_repeat_ticks);
                    return Ok(());
                }
                repeat_until = now + self.policy.idle_repeat_ticks;
                self.set_repeat_until(repeat_until);
            }
            while diff > 0 {
                core::hint::spin_loop();
                diff = next.diff(self.backend.now());
            }
        }
    }

    /// Timer interrupt entry; a failure becomes a shutdown request for the main loop
    pub fn timer_irq(&self, context: &mut C) {
        if let Err(e) = self.timer_dispatch(context) {
            self.try_shutdown(e.reason());
        }
    }

    /// Runs the timer interrupt from the main loop on polled backends
    pub fn irq_poll(&self, context: &mut C) {
        if self.backend.irq_pending() {
            self.timer_irq(context);
        }
    }

    /// Records a shutdown to be processed by the main loop
    pub fn try_shutdown(&self, reason: &'static str) {
        if self.shutdown.request(reason) {
            warn!("shutdown requested: {}", reason);
        }
        self.wake_tasks();
    }

    /// Records a shutdown and processes it before returning
    pub fn request_shutdown<const R: usize>(
        &self,
        context: &mut C,
        registry: &Registry<C, R>,
        reporter: &impl ShutdownReporter,
        reason: &'static str,
    ) {
        self.try_shutdown(reason);
        self.process_shutdown(context, registry, reporter);
    }

    /// Runs a pending shutdown: drop user timers, run shutdown callbacks, report
    ///
    /// Does nothing unless a request is pending, so the callbacks run once per shutdown.
    pub fn process_shutdown<const R: usize>(
        &self,
        context: &mut C,
        registry: &Registry<C, R>,
        reporter: &impl ShutdownReporter,
    ) {
        let reason = match self.shutdown.begin() {
            Some(reason) => reason,
            None => return,
        };
        let clock = self.backend.now();
        error!("entering shutdown: {}", reason);
        self.install_wrap_timer(clock);
        registry.run_shutdown(context);
        self.shutdown.complete();
        reporter.report_shutdown(clock, reason);
    }

    /// Host requested exit from shutdown
    pub fn clear_shutdown(&self) -> Result<(), Shutdown> {
        if self.shutdown.clear()? {
            info!("shutdown cleared");
        }
        Ok(())
    }

    /// One main loop pass: poll timers, sleep if nothing is requested, run every task
    ///
    /// Tasks are skipped while a shutdown is pending; the caller processes it first.
    pub fn run_pass<const R: usize>(
        &self,
        context: &mut C,
        registry: &Registry<C, R>,
    ) -> Result<(), Shutdown> {
        self.irq_poll(context);
        if self.shutdown.is_pending() {
            return Ok(());
        }
        self.set_repeat_until(self.backend.now() + self.policy.idle_repeat_ticks);
        let idle = critical_section::with(|_| {
            if self.tasks_status.load(Ordering::Acquire) == TS_REQUESTED {
                return false;
            }
            self.tasks_status.store(TS_IDLE, Ordering::Release);
            true
        });
        if idle {
            while self.tasks_status.load(Ordering::Acquire) != TS_REQUESTED {
                self.backend.idle_wait();
                self.irq_poll(context);
            }
            if self.shutdown.is_pending() {
                return Ok(());
            }
        }
        self.tasks_status.store(TS_RUNNING, Ordering::Release);
        registry.run_tasks(context)
    }

    /// The firmware main loop
    pub fn run<const R: usize>(
        &self,
        context: &mut C,
        registry: &Registry<C, R>,
        reporter: &impl ShutdownReporter,
    ) -> ! {
        self.start();
        if let Err(e) = registry.run_init(context) {
            self.try_shutdown(e.reason());
        }
        loop {
            self.process_shutdown(context, registry, reporter);
            if let Err(e) = self.run_pass(context, registry) {
                self.try_shutdown(e.reason());
            }
        }
    }
}
