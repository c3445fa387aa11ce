use crate::{Result, XrError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Locks `m`, recovering the data if a worker panicked while holding it.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cloneable view of a worker's running flag, handed to the thread body.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns one worker thread and its cooperative stop flag.
///
/// The worker polls [`RunFlag::is_running`] between blocking calls that
/// have a timeout; [`ThreadHelper::stop`] clears the flag and joins, so the
/// worker is gone before any state it borrows is freed.
#[derive(Debug)]
pub struct ThreadHelper {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadHelper {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn flag(&self) -> RunFlag {
        RunFlag(self.running.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.thread.is_some()
    }

    /// Spawns the worker. Fails if one is already running.
    pub fn start<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(RunFlag) + Send + 'static,
    {
        if self.thread.is_some() {
            return Err(XrError::InvalidArgument(format!(
                "thread '{}' already started",
                name
            )));
        }

        self.running.store(true, Ordering::Release);
        let flag = self.flag();
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body(flag))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                XrError::ThreadSpawn(format!("{}: {}", name, e))
            })?;

        self.thread = Some(thread);
        Ok(())
    }

    /// Clears the running flag and joins the worker. Safe to call twice.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}

impl Default for ThreadHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadHelper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_stop_joins() {
        let mut helper = ThreadHelper::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        helper
            .start("test-worker", move |flag| {
                while flag.is_running() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                let _ = tx.send(());
            })
            .unwrap();
        assert!(helper.is_running());
        helper.stop();
        assert!(!helper.is_running());
        assert!(rx.try_recv().is_ok());
        helper.stop();
    }

    #[test]
    fn test_double_start_fails() {
        let mut helper = ThreadHelper::new();
        helper.start("a", |_| {}).unwrap();
        assert!(helper.start("a", |_| {}).is_err());
    }
}
