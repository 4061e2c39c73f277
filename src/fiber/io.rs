use super::future::Completer;
use crate::error::Result;

use crossbeam::channel::{Receiver, Sender};
use log::debug;

/// A blocking job submitted to the IO executor.
type Job = Box<dyn FnOnce() + Send>;

/// A small thread pool for blocking file IO (writes, fsync). Dispatchers
/// never block on files; they submit jobs here and results re-enter the
/// owning dispatcher through fiber future completion.
pub struct IoExecutor {
    tx: Sender<Job>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl IoExecutor {
    pub fn new(name: &str, threads: usize) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded::<Job>();
        let threads = (0..threads)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        debug!("io worker exited");
                    })
                    .expect("failed to spawn io worker")
            })
            .collect();
        Self { tx, threads }
    }

    /// Returns a Send + Clone handle for submitting jobs.
    pub fn handle(&self) -> IoHandle {
        IoHandle { tx: self.tx.clone() }
    }

    /// Stops the executor, waiting for queued jobs to finish.
    pub fn stop(mut self) {
        drop(self.tx);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// A handle for submitting blocking jobs to the IO executor.
#[derive(Clone)]
pub struct IoHandle {
    tx: Sender<Job>,
}

impl IoHandle {
    /// Runs a job on the executor.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        // A send failure means the executor has stopped; the job's completer
        // (if any) is dropped, completing its future with Error::Abort.
        let _ = self.tx.send(Box::new(job));
    }

    /// Runs a fallible job and completes the given fiber future with its
    /// result.
    pub fn submit<T: Send + 'static>(
        &self,
        completer: Completer<T>,
        job: impl FnOnce() -> Result<T> + Send + 'static,
    ) {
        self.execute(move || completer.complete(job()));
    }
}
