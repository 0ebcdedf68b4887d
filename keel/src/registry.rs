//! Init, task and shutdown callback lists
//!
//! Components register their callbacks explicitly while the firmware starts up. Each list runs in
//! registration order.
use crate::shutdown::Shutdown;
use core::fmt;

/// Run once at boot
pub type InitFn<C> = fn(&mut C) -> Result<(), Shutdown>;
/// Run once per main loop pass
pub type TaskFn<C> = fn(&mut C) -> Result<(), Shutdown>;
/// Run once when entering shutdown; must not rely on normal operation
pub type ShutdownFn<C> = fn(&mut C);

struct Entry<F> {
    name: &'static str,
    func: F,
}

/// Returned by [`RegistryBuilder::build`] when a list overflowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegistryFull {
    /// The first callback that did not fit
    pub name: &'static str,
}

impl fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no room to register {}", self.name)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RegistryFull {}

pub struct Registry<C: 'static, const N: usize = 16> {
    init: heapless::Vec<Entry<InitFn<C>>, N>,
    tasks: heapless::Vec<Entry<TaskFn<C>>, N>,
    shutdown: heapless::Vec<Entry<ShutdownFn<C>>, N>,
}

impl<C: 'static, const N: usize> Registry<C, N> {
    pub fn builder() -> RegistryBuilder<C, N> {
        RegistryBuilder {
            registry: Registry {
                init: heapless::Vec::new(),
                tasks: heapless::Vec::new(),
                shutdown: heapless::Vec::new(),
            },
            overflow: None,
        }
    }

    /// Runs every init callback, stopping at the first failure
    pub fn run_init(&self, context: &mut C) -> Result<(), Shutdown> {
        for entry in &self.init {
            debug!("init {}", entry.name);
            (entry.func)(context)?;
        }
        Ok(())
    }

    /// Runs every task once, stopping at the first failure
    pub fn run_tasks(&self, context: &mut C) -> Result<(), Shutdown> {
        for entry in &self.tasks {
            (entry.func)(context)?;
        }
        Ok(())
    }

    /// Runs every shutdown callback
    pub fn run_shutdown(&self, context: &mut C) {
        for entry in &self.shutdown {
            debug!("shutdown callback {}", entry.name);
            (entry.func)(context);
        }
    }
}

pub struct RegistryBuilder<C: 'static, const N: usize> {
    registry: Registry<C, N>,
    overflow: Option<&'static str>,
}

impl<C: 'static, const N: usize> RegistryBuilder<C, N> {
    pub fn init(mut self, name: &'static str, func: InitFn<C>) -> Self {
        if self.registry.init.push(Entry { name, func }).is_err() {
            self.overflow.get_or_insert(name);
        }
        self
    }

    pub fn task(mut self, name: &'static str, func: TaskFn<C>) -> Self {
        if self.registry.tasks.push(Entry { name, func }).is_err() {
            self.overflow.get_or_insert(name);
        }
        self
    }

    pub fn shutdown(mut self, name: &'static str, func: ShutdownFn<C>) -> Self {
        if self.registry.shutdown.push(Entry { name, func }).is_err() {
            self.overflow.get_or_insert(name);
        }
        self
    }

    pub fn build(self) -> Result<Registry<C, N>, RegistryFull> {
        match self.overflow {
            Some(name) => Err(RegistryFull { name }),
            None => Ok(self.registry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown;

    #[derive(Default)]
    struct Log(Vec<&'static str>);

    fn init_a(log: &mut Log) -> Result<(), Shutdown> {
        log.0.push("init_a");
        Ok(())
    }

    fn init_fails(log: &mut Log) -> Result<(), Shutdown> {
        log.0.push("init_fails");
        Err(shutdown("init failed"))
    }

    fn task_a(log: &mut Log) -> Result<(), Shutdown> {
        log.0.push("task_a");
        Ok(())
    }

    fn task_b(log: &mut Log) -> Result<(), Shutdown> {
        log.0.push("task_b");
        Ok(())
    }

    fn off_a(log: &mut Log) {
        log.0.push("off_a");
    }

    fn off_b(log: &mut Log) {
        log.0.push("off_b");
    }

    #[test]
    fn runs_in_registration_order() {
        let registry = Registry::<Log, 4>::builder()
            .init("a", init_a)
            .task("b", task_b)
            .task("a", task_a)
            .shutdown("b", off_b)
            .shutdown("a", off_a)
            .build()
            .unwrap();
        let mut log = Log::default();
        registry.run_init(&mut log).unwrap();
        registry.run_tasks(&mut log).unwrap();
        registry.run_shutdown(&mut log);
        assert_eq!(log.0, ["init_a", "task_b", "task_a", "off_b", "off_a"]);
    }

    #[test]
    fn init_stops_at_failure() {
        let registry = Registry::<Log, 4>::builder()
            .init("fails", init_fails)
            .init("a", init_a)
            .build()
            .unwrap();
        let mut log = Log::default();
        assert_eq!(registry.run_init(&mut log), Err(shutdown("init failed")));
        assert_eq!(log.0, ["init_fails"]);
    }

    #[test]
    fn overflow_names_first_rejected() {
        let result = Registry::<Log, 1>::builder()
            .task("a", task_a)
            .task("b", task_b)
            .shutdown("c", off_a)
            .shutdown("d", off_b)
            .build();
        assert_eq!(result.err(), Some(RegistryFull { name: "b" }));
    }
}
