//! Task spawning and timers for native and wasm targets.

use std::future::Future;
use std::time::Duration;

/// Runs `future` in the background on the browser's microtask queue.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Runs `future` in the background. Uses the caller's tokio runtime when
/// there is one, otherwise a shared runtime on a dedicated thread.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }
    match background_handle() {
        Some(handle) => {
            handle.spawn(future);
        }
        None => log::error!(
            target: "firestore::runtime",
            "No runtime available to run a background task; dropping it"
        ),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn background_handle() -> Option<&'static tokio::runtime::Handle> {
    use std::sync::OnceLock;
    use tokio::runtime::{Builder, Handle};

    static BACKGROUND: OnceLock<Option<Handle>> = OnceLock::new();

    BACKGROUND
        .get_or_init(|| {
            let runtime = match Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    log::error!(target: "firestore::runtime", "Failed to build background runtime: {err}");
                    return None;
                }
            };
            let handle = runtime.handle().clone();
            let spawned = std::thread::Builder::new()
                .name("firestore-background".to_string())
                .spawn(move || runtime.block_on(std::future::pending::<()>()));
            match spawned {
                Ok(_) => Some(handle),
                Err(err) => {
                    log::error!(target: "firestore::runtime", "Failed to start background thread: {err}");
                    None
                }
            }
        })
        .as_ref()
}

/// Waits for `duration`. A zero duration completes without yielding to a
/// timer.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    #[cfg(target_arch = "wasm32")]
    gloo_timers::future::sleep(duration).await;
    #[cfg(not(target_arch = "wasm32"))]
    tokio::time::sleep(duration).await;
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawns_outside_of_a_runtime() {
        let (sender, receiver) = mpsc::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(5)).await;
            let _ = sender.send(42);
        });
        assert_eq!(receiver.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        tokio::time::timeout(Duration::from_millis(50), sleep(Duration::ZERO))
            .await
            .unwrap();
    }
}
