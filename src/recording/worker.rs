//! Thread helpers shared by the session workers

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::errors::RecorderError;

/// Spawn a named worker thread
pub(crate) fn spawn_named<F, T>(name: &str, body: F) -> Result<JoinHandle<T>, RecorderError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| RecorderError::Configuration(format!("Failed to spawn {}: {}", name, e)))
}

/// A worker thread whose exit can be awaited with a deadline
///
/// The thread holds the sending half of `exited` until it returns or
/// unwinds, so the receiver disconnects exactly when the body is done.
pub(crate) struct WorkerHandle<T> {
    handle: JoinHandle<T>,
    exited: Receiver<()>,
}

impl<T> WorkerHandle<T> {
    pub(crate) fn thread(&self) -> &Thread {
        self.handle.thread()
    }
}

/// Spawn a named worker that signals its exit over a channel
pub(crate) fn spawn_worker<F, T>(name: &str, body: F) -> Result<WorkerHandle<T>, RecorderError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (exit_signal, exited) = crossbeam_channel::bounded::<()>(1);
    let handle = spawn_named(name, move || {
        let _exit_signal = exit_signal;
        body()
    })?;
    Ok(WorkerHandle { handle, exited })
}

/// Outcome of waiting on a worker for a bounded time
#[derive(Debug)]
pub(crate) enum JoinOutcome<T> {
    Finished(T),
    Panicked(String),
    /// Still running after the timeout. The handle is dropped (detached).
    TimedOut,
}

/// Join `worker`, giving up after `timeout`
pub(crate) fn join_with_timeout<T>(worker: WorkerHandle<T>, timeout: Duration) -> JoinOutcome<T> {
    if let Err(RecvTimeoutError::Timeout) = worker.exited.recv_timeout(timeout) {
        return JoinOutcome::TimedOut;
    }
    match worker.handle.join() {
        Ok(value) => JoinOutcome::Finished(value),
        Err(payload) => JoinOutcome::Panicked(panic_message(payload.as_ref())),
    }
}

/// Run one teardown step, converting both errors and panics into a message
pub(crate) fn guarded<T, F>(step: &str, f: F) -> Result<T, String>
where
    F: FnOnce() -> Result<T, RecorderError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::warn!("Teardown step '{}' failed: {}", step, e);
            Err(e.to_string())
        }
        Err(payload) => {
            let message = format!("panicked: {}", panic_message(payload.as_ref()));
            log::warn!("Teardown step '{}' {}", step, message);
            Err(message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_finished_worker() {
        let handle = spawn_worker("test-worker", || 7).unwrap();
        match join_with_timeout(handle, Duration::from_secs(1)) {
            JoinOutcome::Finished(v) => assert_eq!(v, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_times_out() {
        let handle = spawn_worker("slow-worker", || thread::sleep(Duration::from_millis(300))).unwrap();
        assert!(matches!(
            join_with_timeout(handle, Duration::from_millis(20)),
            JoinOutcome::TimedOut
        ));
    }

    #[test]
    fn test_join_reports_panic_without_waiting_for_timeout() {
        let handle = spawn_worker("panicking-worker", || -> u32 { panic!("worker blew up") }).unwrap();
        let started = std::time::Instant::now();
        match join_with_timeout(handle, Duration::from_secs(5)) {
            JoinOutcome::Panicked(message) => assert!(message.contains("worker blew up")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_join_wakes_as_soon_as_worker_exits() {
        let handle = spawn_worker("short-worker", || {
            thread::sleep(Duration::from_millis(20));
            "done"
        })
        .unwrap();
        let started = std::time::Instant::now();
        match join_with_timeout(handle, Duration::from_secs(10)) {
            JoinOutcome::Finished(v) => assert_eq!(v, "done"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_guarded_captures_error_and_panic() {
        assert_eq!(guarded("ok", || Ok(3)), Ok(3));
        let err = guarded::<(), _>("fails", || Err(RecorderError::Muxing("boom".into()))).unwrap_err();
        assert!(err.contains("boom"));
        let err = guarded::<(), _>("panics", || panic!("host crashed")).unwrap_err();
        assert!(err.contains("host crashed"));
    }
}
