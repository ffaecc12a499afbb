use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::models::download::TaskSnapshot;

pub type TaskCallback = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

#[derive(Clone)]
pub enum TaskEvent {
    Progress(TaskSnapshot),
    /// Fired once per terminal transition (Completed, Failed or Cancelled).
    Finished(TaskSnapshot),
}

/// Progress and completion subscribers. The lists are only locked long
/// enough to copy them, so a running callback never blocks registration.
#[derive(Default)]
pub struct CallbackRegistry {
    progress: Mutex<Vec<TaskCallback>>,
    completion: Mutex<Vec<TaskCallback>>,
}

impl CallbackRegistry {
    pub fn on_progress(&self, cb: TaskCallback) {
        self.progress.lock().push(cb);
    }

    pub fn on_completion(&self, cb: TaskCallback) {
        self.completion.lock().push(cb);
    }

    fn progress_subscribers(&self) -> Vec<TaskCallback> {
        self.progress.lock().clone()
    }

    fn completion_subscribers(&self) -> Vec<TaskCallback> {
        self.completion.lock().clone()
    }
}

/// Fans events out to subscribers from a dedicated task, in the order the
/// workers produced them. A panicking caller-supplied callback is caught
/// and logged instead of taking a worker down with it.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl EventDispatcher {
    pub fn spawn(registry: Arc<CallbackRegistry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let (subscribers, snapshot) = match &event {
                    TaskEvent::Progress(s) => (registry.progress_subscribers(), s),
                    TaskEvent::Finished(s) => (registry.completion_subscribers(), s),
                };
                for cb in subscribers {
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| cb(snapshot)));
                    if result.is_err() {
                        tracing::warn!(url = %snapshot.url, "download callback panicked");
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn emit(&self, event: TaskEvent) {
        // Only fails when the dispatcher is gone, i.e. runtime shutdown.
        let _ = self.tx.send(event);
    }
}
