//! Executors for work the component runtime defers, such as enabling or
//! disabling components from inside a lifecycle callback.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

pub trait AsyncWorkService: Send + Sync {
    fn post(&self, task: WorkItem);
}

/// Runs every task on the calling thread before `post` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorkService;

impl AsyncWorkService for InlineWorkService {
    fn post(&self, task: WorkItem) {
        task();
    }
}

/// Runs each task on a fresh named thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadWorkService;

impl AsyncWorkService for ThreadWorkService {
    fn post(&self, task: WorkItem) {
        let spawned = std::thread::Builder::new()
            .name("svckit-work".into())
            .spawn(task);
        if let Err(err) = spawned {
            tracing::error!(error = %err, "Failed to spawn component work thread");
        }
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioWorkService {
    handle: tokio::runtime::Handle,
}

impl TokioWorkService {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl AsyncWorkService for TokioWorkService {
    fn post(&self, task: WorkItem) {
        drop(self.handle.spawn_blocking(task));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    Inline,
    #[default]
    Thread,
    Tokio,
}

/// Builds the executor for `mode`. `Tokio` outside a runtime falls back to threads.
pub fn work_service(mode: WorkMode) -> Arc<dyn AsyncWorkService> {
    match mode {
        WorkMode::Inline => Arc::new(InlineWorkService),
        WorkMode::Thread => Arc::new(ThreadWorkService),
        WorkMode::Tokio => match TokioWorkService::current() {
            Some(service) => Arc::new(service),
            None => {
                tracing::warn!("No tokio runtime available, component work falls back to threads");
                Arc::new(ThreadWorkService)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn inline_runs_before_returning() {
        let (tx, rx) = mpsc::channel();
        InlineWorkService.post(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn thread_service_runs_elsewhere() {
        let (tx, rx) = mpsc::channel();
        ThreadWorkService.post(Box::new(move || {
            tx.send(std::thread::current().name().map(str::to_owned)).unwrap()
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("svckit-work"));
    }

    #[tokio::test]
    async fn tokio_service_uses_current_runtime() {
        let service = work_service(WorkMode::Tokio);
        let (tx, rx) = tokio::sync::oneshot::channel();
        service.post(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.await.unwrap(), 7);
    }
}
