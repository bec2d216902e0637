// ── Ordered callback dispatch ──
//
// Each loopback channel owns one dispatcher: an unbounded queue drained by
// a single task on the provider runtime. Jobs run strictly in post order,
// which gives every request object FIFO completion delivery.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Pause(Duration),
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    pub(crate) fn spawn(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Run(f) => f(),
                    Job::Pause(delay) => tokio::time::sleep(delay).await,
                }
            }
        });
        Self { tx }
    }

    /// Queue a job behind everything already posted.
    pub(crate) fn post(&self, job: impl FnOnce() + Send + 'static) {
        // A closed queue means the runtime is gone; nobody is left to notify.
        let _ = self.tx.send(Job::Run(Box::new(job)));
    }

    /// Hold back every later job for `delay`.
    pub(crate) fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            let _ = self.tx.send(Job::Pause(delay));
        }
    }
}
