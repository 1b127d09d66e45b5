//! Background receive tasks and handler isolation.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long `stop` waits for a listener before aborting it.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback run on the listener task for every delivery.
pub type Handler<T> = Box<dyn FnMut(T) -> HandlerResult + Send>;

/// Runs the handler; errors and panics are logged, never propagated.
pub(crate) fn dispatch<T>(name: &str, handler: &mut Handler<T>, item: T) {
    match catch_unwind(AssertUnwindSafe(|| handler(item))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{}: handler failed: {}", name, e),
        Err(panic) => error!("{}: handler panicked: {}", name, panic_message(&panic)),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// A spawned receive loop bound to a stop signal.
#[derive(Debug)]
pub(crate) struct ListenerTask<R> {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<R>,
}

impl<R: Send + 'static> ListenerTask<R> {
    pub(crate) fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(body(cancel.clone()));
        Self {
            name: name.into(),
            cancel,
            handle,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop and joins it within `grace`, aborting on overrun.
    pub(crate) async fn stop(mut self, grace: Duration) -> Option<R> {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(result)) => {
                debug!("{}: listener stopped", self.name);
                Some(result)
            }
            Ok(Err(e)) => {
                error!("{}: listener task failed: {}", self.name, e);
                None
            }
            Err(_) => {
                warn!("{}: listener did not stop within {:?}, aborting", self.name, grace);
                self.handle.abort();
                None
            }
        }
    }
}

impl<R> Drop for ListenerTask<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_dispatch_isolates_errors_and_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handler: Handler<u32> = Box::new(move |n| {
            sink.lock().unwrap().push(n);
            match n {
                1 => Err("rejected".into()),
                2 => panic!("handler bug"),
                _ => Ok(()),
            }
        });

        dispatch("test", &mut handler, 1);
        dispatch("test", &mut handler, 2);
        dispatch("test", &mut handler, 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stop_joins_cooperative_loop() {
        let task = ListenerTask::spawn("loop", |cancel| async move {
            cancel.cancelled().await;
            7u32
        });
        assert_eq!(task.stop(STOP_GRACE).await, Some(7));
    }

    #[tokio::test]
    async fn test_stop_aborts_stuck_loop() {
        let task = ListenerTask::spawn("stuck", |_cancel| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
        });
        assert!(!task.is_finished());
        assert_eq!(task.stop(Duration::from_millis(20)).await, None);
    }
}
