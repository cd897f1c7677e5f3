use crate::error::{Result, WsError};

/// Unit of work handed to an executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs streaming handlers off the I/O-dispatch thread
///
/// A job may block for as long as its message takes to arrive, so an
/// executor must not cap the number of concurrently running jobs below the
/// number of concurrently streamed messages it is expected to serve.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, name: String, job: Job) -> Result<()>;
}

/// Executor that runs every job on its own named OS thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, name: String, job: Job) -> Result<()> {
        std::thread::Builder::new()
            .name(name)
            .spawn(job)
            .map(|_| ())
            .map_err(|e| WsError::Configuration(format!("failed to spawn worker: {}", e)))
    }
}
