//! Background task bookkeeping for one connector: every timer and listener
//! shares a cancellation token and is joined (or aborted) on shutdown.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Aborted,
}

pub struct TaskSet {
    cancel: CancellationToken,
    tasks: Vec<TaskHandle>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl TaskSet {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    /// Token handed to every task; cancelled first on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<Fut>(&mut self, name: impl Into<Cow<'static, str>>, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = TaskHandle::new(name, tokio::spawn(fut));
        trace!(target: "ethica::tasks", task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(TaskHandle::name).collect()
    }

    /// Cancel, then give each task up to `grace` to finish before aborting it.
    pub async fn shutdown_with_grace(self, grace: Duration) -> Vec<(String, TaskOutcome)> {
        self.cancel.cancel();
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            let TaskHandle { name, mut handle } = task;
            let name = name.into_owned();
            let outcome = if grace.is_zero() {
                handle.abort();
                join_outcome(&name, handle.await)
            } else {
                let sleeper = tokio::time::sleep(grace);
                tokio::pin!(sleeper);
                tokio::select! {
                    res = &mut handle => join_outcome(&name, res),
                    _ = &mut sleeper => {
                        debug!(target: "ethica::tasks", task = %name, "grace elapsed; aborting");
                        handle.abort();
                        match handle.await {
                            Ok(()) => TaskOutcome::Completed,
                            Err(_) => TaskOutcome::Aborted,
                        }
                    }
                }
            };
            outcomes.push((name, outcome));
        }
        outcomes
    }
}

fn join_outcome(
    name: &str,
    res: Result<(), tokio::task::JoinError>,
) -> TaskOutcome {
    match res {
        Ok(()) => TaskOutcome::Completed,
        Err(err) => {
            debug!(target: "ethica::tasks", task = %name, ?err, "task exited with error");
            TaskOutcome::Aborted
        }
    }
}
