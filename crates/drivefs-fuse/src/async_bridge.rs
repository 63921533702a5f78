//! Shared runtime for FUSE callbacks.
//!
//! Callbacks arrive on the fuser session thread and are synchronous. Each
//! one is spawned onto this runtime and replies from its task, so a slow
//! upload never blocks unrelated lookups.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Runtime};

use drivefs_core::{DriveError, DriveResult};

/// Stores the creation result so that initialization errors surface
/// without panicking.
static RUNTIME: OnceLock<Result<Runtime, String>> = OnceLock::new();

const WORKER_THREADS: usize = 4;

/// Initialize the runtime. Later calls return the same runtime.
pub fn init_runtime() -> DriveResult<&'static Runtime> {
    let result = RUNTIME.get_or_init(|| {
        Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("drivefs-fuse-worker")
            .enable_all()
            .build()
            .map_err(|e| e.to_string())
    });
    match result {
        Ok(rt) => Ok(rt),
        Err(e) => Err(DriveError::Other(format!(
            "Failed to create FUSE async runtime: {}",
            e
        ))),
    }
}

pub fn runtime() -> DriveResult<&'static Runtime> {
    match RUNTIME.get() {
        Some(Ok(rt)) => Ok(rt),
        Some(Err(e)) => Err(DriveError::Other(format!(
            "FUSE runtime failed to initialize: {}",
            e
        ))),
        None => Err(DriveError::Other(
            "FUSE runtime not initialized - call init_runtime first".to_string(),
        )),
    }
}

/// Spawn a request task.
pub fn spawn<F>(future: F) -> DriveResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let rt = runtime()?;
    rt.spawn(future);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // ====== Runtime ======

    #[test]
    fn test_runtime_init_idempotent() {
        let rt1 = init_runtime().unwrap();
        let rt2 = init_runtime().unwrap();
        assert!(std::ptr::eq(rt1, rt2));
        assert!(runtime().is_ok());
    }

    // ====== Spawn ======

    #[test]
    fn test_spawned_requests_run_concurrently() {
        init_runtime().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        // The slow task must not hold up the fast ones.
        let slow = Arc::clone(&counter);
        let slow_tx = tx.clone();
        spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            slow.fetch_add(100, Ordering::SeqCst);
            let _ = slow_tx.send("slow");
        })
        .unwrap();
        for _ in 0..5 {
            let fast = Arc::clone(&counter);
            let fast_tx = tx.clone();
            spawn(async move {
                fast.fetch_add(1, Ordering::SeqCst);
                let _ = fast_tx.send("fast");
            })
            .unwrap();
        }
        drop(tx);

        let order: Vec<_> = rx.iter().collect();
        assert_eq!(order.len(), 6);
        assert_eq!(order.last(), Some(&"slow"));
        assert_eq!(counter.load(Ordering::SeqCst), 105);
    }

    #[test]
    fn test_spawn_from_many_threads() {
        init_runtime().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        let _ = tx.send(i);
                    })
                })
            })
            .collect();
        drop(tx);
        for t in threads {
            t.join().unwrap().unwrap();
        }
        let mut results: Vec<_> = rx.iter().collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }
}
