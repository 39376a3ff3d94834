//! `ThreadWorker`: runs a caller-supplied task on a dedicated OS thread and
//! reports its outcome through a [`Future`](super::Future).
//!
//! Grounded on `spotflow::utils::thread` (join-on-drop thread helper) and on
//! §4.1's "ThreadWorker: runs a caller-supplied task on a dedicated execution
//! context; sets done=true, records result/exception, releases waiters."

use std::thread;

use super::{new_pair, Future};

/// Spawns `task` on a new thread and returns a [`Future`] that completes with
/// its result. A panic inside `task` is caught and reported as a stored error
/// rather than poisoning the worker thread's caller.
pub fn spawn_thread_worker<T, F>(name: impl Into<String>, task: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let (future, completer) = new_pair::<T>();
    let builder = thread::Builder::new().name(name.into());
    let spawned = builder.spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task))
            .unwrap_or_else(|payload| Err(panic_to_error(payload)));
        completer.complete(result);
    });
    if let Err(err) = spawned {
        // Thread creation itself failed; complete synchronously so callers
        // still observe a done future instead of hanging forever.
        let (future, completer) = new_pair::<T>();
        completer.complete(Err(anyhow::Error::new(err).context("spawning thread worker failed")));
        return future;
    }
    future
}

fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "thread worker panicked".to_string());
    anyhow::anyhow!(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_with_task_result() {
        let future = spawn_thread_worker("test-worker", || Ok(7));
        future.wait(None);
        assert_eq!(future.result().unwrap().unwrap(), 7);
    }

    #[test]
    fn completes_with_task_error() {
        let future: Future<()> =
            spawn_thread_worker("test-worker", || Err(anyhow::anyhow!("task failed")));
        future.wait(None);
        assert!(future.result().unwrap().unwrap_err().to_string().contains("task failed"));
    }

    #[test]
    fn catches_panics_as_errors() {
        let future: Future<()> = spawn_thread_worker("test-worker", || panic!("boom"));
        future.wait(None);
        assert!(future.result().unwrap().is_err());
    }
}
