use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde_json::Value;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{Mailer, Template};

#[derive(Debug, Clone)]
pub struct MailJob {
    pub recipient: String,
    pub template: Template,
    pub data: Value,
}

impl MailJob {
    pub fn new(recipient: impl Into<String>, template: Template, data: Value) -> Self {
        Self {
            recipient: recipient.into(),
            template,
            data,
        }
    }
}

/// Sending half of the mail queue. Cloned into the app state and the sweeper.
#[derive(Clone)]
pub struct MailQueue {
    tx: mpsc::Sender<MailJob>,
    dropped: Arc<AtomicU64>,
}

/// Worker handles; join after every `MailQueue` clone is dropped to drain.
pub struct MailWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl MailQueue {
    pub fn start(mailer: Arc<dyn Mailer>, workers: usize, capacity: usize) -> (Self, MailWorkers) {
        let (tx, rx) = mpsc::channel::<MailJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker(id, Arc::clone(&rx), Arc::clone(&mailer))))
            .collect();
        info!(workers = workers.max(1), capacity, "mail queue started");
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            MailWorkers { handles },
        )
    }

    /// Enqueues without waiting. A full or closed queue drops the job and logs it.
    pub fn dispatch(&self, job: MailJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    recipient = %job.recipient,
                    template = job.template.name(),
                    dropped,
                    "mail queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                error!(
                    recipient = %job.recipient,
                    template = job.template.name(),
                    "mail queue closed, dropping message"
                );
            }
        }
    }

    /// Jobs dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MailWorkers {
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "mail worker panicked");
            }
        }
    }
}

async fn worker(id: usize, rx: Arc<Mutex<mpsc::Receiver<MailJob>>>, mailer: Arc<dyn Mailer>) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        match mailer.send(&job.recipient, job.template, &job.data).await {
            Ok(()) => debug!(worker = id, template = job.template.name(), "mail sent"),
            Err(e) => error!(
                worker = id,
                error = %e,
                recipient = %job.recipient,
                template = job.template.name(),
                "mail delivery failed"
            ),
        }
    }
    debug!(worker = id, "mail worker stopped");
}
