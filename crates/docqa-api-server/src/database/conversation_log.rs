use super::models::ConversationRecord;
use super::Repository;
use flume::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Fire-and-forget conversation logger. Records are queued and written by a
/// background worker; the response path never waits on the log store, and a
/// full queue drops the record with a warning rather than blocking.
#[derive(Clone)]
pub struct ConversationLogger {
    sender: Sender<ConversationRecord>,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 50,
            batch_timeout_ms: 1000,
        }
    }
}

impl ConversationLogger {
    pub fn new(repository: Arc<Repository>, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Starting conversation logger: queue={}, batch={}, timeout={}ms",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms
        );

        tokio::spawn(async move {
            Self::worker_loop(repository, receiver, config).await;
        });

        Self { sender }
    }

    /// Enqueue a record. Never fails the caller.
    pub fn log(&self, record: ConversationRecord) {
        if let Err(e) = self.sender.try_send(record) {
            warn!("Dropping conversation record (queue full?): {}", e);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    async fn worker_loop(
        repository: Arc<Repository>,
        receiver: Receiver<ConversationRecord>,
        config: LoggerConfig,
    ) {
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
        let mut batch: Vec<ConversationRecord> = Vec::with_capacity(config.batch_size);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(record)) => batch.push(record),
                    Ok(Err(_)) => {
                        Self::flush(&repository, &mut batch).await;
                        info!("Conversation logger shutting down (channel closed)");
                        return;
                    }
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            } else {
                Self::flush(&repository, &mut batch).await;
            }
        }
    }

    async fn flush(repository: &Repository, batch: &mut Vec<ConversationRecord>) {
        for record in batch.drain(..) {
            // Best-effort: failures are logged, never surfaced.
            if let Err(e) = repository.append_conversation(&record).await {
                error!("Failed to persist conversation {}: {}", record.id, e);
            }
        }
        debug!("Flushed conversation log batch");
    }
}
