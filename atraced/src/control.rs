//! Wires `atrace_consumer::ControlApi` to a live `Consumer`: the in-process
//! seam spec.md §1 calls out as the explicit boundary for the (out-of-scope)
//! subscriber control wire protocol. A real socket-framed control channel
//! would drive this same trait from parsed `TRACE ...` commands (spec.md
//! §6); `atraced` has no such listener, so `main` drives it directly from
//! startup CLI flags instead.

use atrace_common::function_table;
use atrace_common::CallerId;
use atrace_consumer::{Consumer, ControlApi, ControlError, Filter, LineSink, Mode, StatusReport, SubscriberId};
use atrace_platform::{CurrentTask, InterruptGuard, NamedLock};

pub struct Daemon<'a, N, G, T, S: LineSink> {
    pub consumer: Consumer<'a, N, G, T, S>,
}

impl<'a, N, G, T, S> Daemon<'a, N, G, T, S>
where
    N: NamedLock,
    G: InterruptGuard,
    T: CurrentTask,
    S: LineSink,
{
    pub fn new(consumer: Consumer<'a, N, G, T, S>) -> Self {
        Self { consumer }
    }
}

/// All-or-nothing name validation (spec.md §4.1): every name in `names` must
/// resolve before any of `apply` runs against any of them.
fn validate_names(names: &[String]) -> Result<(), ControlError> {
    for name in names {
        if function_table::find_by_func_name(name).is_none() {
            return Err(ControlError::NotFound(name.clone()));
        }
    }
    Ok(())
}

impl<'a, N, G, T, S> ControlApi for Daemon<'a, N, G, T, S>
where
    N: NamedLock,
    G: InterruptGuard,
    T: CurrentTask,
    S: LineSink + Default,
{
    type Error = ControlError;

    fn status(&mut self) -> Result<StatusReport, ControlError> {
        Ok(self.consumer.status_report())
    }

    fn start(&mut self, filter: Filter) -> Result<SubscriberId, ControlError> {
        Ok(self
            .consumer
            .subscribers_mut()
            .register(filter, Mode::FreeSubscribe, S::default()))
    }

    fn run(&mut self, filter: Filter, task: CallerId) -> Result<SubscriberId, ControlError> {
        let mode = self.consumer.begin_run(task);
        Ok(self.consumer.subscribers_mut().register(filter, mode, S::default()))
    }

    fn stop(&mut self, id: SubscriberId) -> Result<(), ControlError> {
        self.consumer.remove_subscriber(id);
        Ok(())
    }

    fn enable(&mut self, names: Vec<String>) -> Result<(), ControlError> {
        if names.is_empty() {
            self.consumer.set_global_enable(true);
            return Ok(());
        }
        validate_names(&names)?;
        for name in &names {
            self.consumer.set_patch_enabled(name, true);
        }
        Ok(())
    }

    fn disable(&mut self, names: Vec<String>) -> Result<(), ControlError> {
        if names.is_empty() {
            self.consumer.set_global_enable(false);
            return Ok(());
        }
        validate_names(&names)?;
        for name in &names {
            self.consumer.set_patch_enabled(name, false);
        }
        Ok(())
    }
}
