use super::ThreadId;
use crate::errors::ThreadResult;
use core::any::Any;

/// Thread creation options.
///
/// The only option is a name used in log output and [`super::ThreadInfo`];
/// it has no effect on scheduling.
#[derive(Debug, Clone, Default)]
pub struct ThreadBuilder {
    name: Option<String>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Create a green thread on the current OS thread's runtime.
    ///
    /// The thread becomes Ready immediately; it first runs when the current
    /// thread yields, blocks, exits or is preempted. Its return value is
    /// handed to the thread that joins it.
    pub fn spawn<F, T>(self, f: F) -> ThreadResult<ThreadId>
    where
        F: FnOnce() -> T + 'static,
        T: Any,
    {
        let entry = Box::new(move || Box::new(f()) as Box<dyn Any>);
        crate::kernel::with_runtime(|rt| rt.spawn(self.name, entry))
    }
}
