//! Audit Logger
//!
//! Durable, non-blocking event sink. `log()` hands the event to a dedicated
//! writer thread over an unbounded channel and returns immediately; it never
//! fails on the caller's hot path. Sink failures are reported on the tracing
//! fallback channel instead of being propagated.

use crate::audit::event::AuditEvent;
use crate::audit::sinks::AuditSink;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::error;

enum Message {
    Event(AuditEvent),
    Flush(mpsc::Sender<()>),
}

pub struct AuditLogger {
    tx: Option<mpsc::Sender<Message>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AuditLogger {
    pub fn new(mut sinks: Vec<Box<dyn AuditSink>>) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let handle = thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || {
                for message in rx {
                    match message {
                        Message::Event(event) => {
                            let line = match serde_json::to_string(&event) {
                                Ok(line) => line,
                                Err(e) => {
                                    error!("audit event unserializable, dropped: {}", e);
                                    continue;
                                }
                            };
                            for sink in sinks.iter_mut() {
                                if let Err(e) = sink.write_line(&line) {
                                    error!("audit sink '{}' write failed: {}", sink.name(), e);
                                }
                            }
                        }
                        Message::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });

        match handle {
            Ok(handle) => Self {
                tx: Some(tx),
                handle: Some(handle),
            },
            Err(e) => {
                error!("audit writer thread failed to start: {}", e);
                Self {
                    tx: None,
                    handle: None,
                }
            }
        }
    }

    /// Emit one event. Ownership transfers to the logger; this never blocks
    /// and never errors on the caller.
    pub fn log(&self, event: AuditEvent) {
        match &self.tx {
            Some(tx) => {
                if tx.send(Message::Event(event)).is_err() {
                    error!("audit writer gone, event dropped");
                }
            }
            None => error!("audit logger has no writer, event dropped"),
        }
    }

    /// Wait until every event emitted so far has been handed to the sinks.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(5));
        }
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain what is queued and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::AuditStatus;
    use crate::audit::sinks::MemorySink;

    #[test]
    fn events_reach_sinks_in_order() {
        let sink = MemorySink::new();
        let lines = sink.lines();
        let logger = AuditLogger::new(vec![Box::new(sink)]);

        for i in 0..10 {
            logger.log(
                AuditEvent::new("db", format!("req-{}", i), "SELECT 1")
                    .with_success(1, false),
            );
        }
        logger.flush();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 10);
        assert!(lines[0].contains("req-0"));
        assert!(lines[9].contains("req-9"));
    }

    #[test]
    fn drop_drains_queued_events() {
        let sink = MemorySink::new();
        let lines = sink.lines();
        {
            let logger = AuditLogger::new(vec![Box::new(sink)]);
            logger.log(
                AuditEvent::new("db", "req-final", "SELECT 1").with_failure(
                    AuditStatus::Error,
                    "execution_error",
                    "boom".to_string(),
                ),
            );
        }
        assert_eq!(lines.lock().unwrap().len(), 1);
    }
}
