//! Structured per-request audit log plus operational tracing setup.
//!
//! The audit-log half is grounded on `logger.rs::spawn_batch_writer`: a
//! dedicated writer thread draining an mpsc channel, batching up to 100
//! entries or flushing every second, whichever comes first, through a single
//! transaction. The exactly-once-per-request guarantee under client
//! cancellation is grounded on `forward/handlers/openai.rs::StreamUsageFinalizer`
//! — a `Clone + Drop` guard carrying an `Arc<AtomicBool>` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::store::{self, LogEntry};

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct LogRecorder {
    sender: Sender<LogEntry>,
}

impl LogRecorder {
    pub fn spawn(db_path: String) -> Self {
        let (sender, receiver) = std::sync::mpsc::channel::<LogEntry>();
        std::thread::spawn(move || run_batch_writer(db_path, receiver));
        Self { sender }
    }

    pub fn record(&self, entry: LogEntry) {
        if self.sender.send(entry).is_err() {
            tracing::error!("log recorder channel closed, dropping audit log entry");
        }
    }
}

fn run_batch_writer(db_path: String, receiver: Receiver<LogEntry>) {
    let conn = match store::open_conn(&db_path) {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(error = %err, "audit log writer failed to open database, thread exiting");
            return;
        }
    };

    let mut batch = Vec::new();
    loop {
        match receiver.recv_timeout(FLUSH_INTERVAL) {
            Ok(entry) => {
                batch.push(entry);
                while batch.len() < BATCH_SIZE {
                    match receiver.try_recv() {
                        Ok(entry) => batch.push(entry),
                        Err(_) => break,
                    }
                }
                flush(&conn, &mut batch);
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&conn, &mut batch);
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush(&conn, &mut batch);
                break;
            }
        }
    }
}

fn flush(conn: &rusqlite::Connection, batch: &mut Vec<LogEntry>) {
    if batch.is_empty() {
        return;
    }
    match conn.unchecked_transaction() {
        Ok(tx) => {
            for entry in batch.iter() {
                if let Err(err) = store::insert_log(&tx, entry) {
                    tracing::warn!(error = %err, "dropping unwritable audit log entry");
                }
            }
            if let Err(err) = tx.commit() {
                tracing::error!(error = %err, "failed to commit audit log batch");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to open audit log transaction");
        }
    }
    batch.clear();
}

/// Guards exactly-once log emission for a single request across every
/// termination path, including the client dropping the connection mid-stream.
#[derive(Clone)]
pub struct LogFinalizer {
    logged: Arc<AtomicBool>,
    recorder: LogRecorder,
    entry: Arc<Mutex<LogEntry>>,
}

impl LogFinalizer {
    pub fn new(recorder: LogRecorder, entry: LogEntry) -> Self {
        Self {
            logged: Arc::new(AtomicBool::new(false)),
            recorder,
            entry: Arc::new(Mutex::new(entry)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut LogEntry)) {
        if let Ok(mut entry) = self.entry.lock() {
            f(&mut entry);
        }
    }

    /// Logs the entry as-is. Called explicitly on a graceful completion path
    /// (the stream's `[DONE]` tail, or a buffered response being sent) once
    /// the entry has been fully populated.
    pub fn log_once(&self) {
        if self.logged.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(entry) = self.entry.lock() {
            self.recorder.record(entry.clone());
        }
    }
}

impl Drop for LogFinalizer {
    /// If the finalizer is dropped without [`Self::log_once`] ever having
    /// run, the request never reached its graceful completion point — the
    /// client disconnected mid-stream. Mark the entry as a truncated error
    /// before writing it, per the cancellation contract in §5 of the spec.
    fn drop(&mut self) {
        if self.logged.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut entry) = self.entry.lock() {
            entry.synthetic_status = "error".to_string();
            if entry.status_code == 200 {
                entry.status_code = 499;
            }
        }
        if let Ok(entry) = self.entry.lock() {
            self.recorder.record(entry.clone());
        }
    }
}

pub fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> LogEntry {
        LogEntry {
            model: "gemini-pro".to_string(),
            status_code: 200,
            synthetic_status: "ok".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            ..Default::default()
        }
    }

    fn temp_db_path(label: &str) -> String {
        std::env::temp_dir()
            .join(format!("relay_gateway_test_{}_{}.db", label, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn log_finalizer_logs_exactly_once() {
        let db_path = temp_db_path("once");
        let conn = store::open_conn(&db_path).unwrap();
        store::init(&conn).unwrap();
        drop(conn);

        let recorder = LogRecorder::spawn(db_path.clone());
        let finalizer = LogFinalizer::new(recorder, sample_entry());
        finalizer.log_once();
        finalizer.log_once();
        drop(finalizer);

        std::thread::sleep(Duration::from_millis(1200));
        let conn = store::open_conn(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn update_mutates_entry_before_logging() {
        let db_path = temp_db_path("update");
        let conn = store::open_conn(&db_path).unwrap();
        store::init(&conn).unwrap();
        drop(conn);

        let recorder = LogRecorder::spawn(db_path.clone());
        let finalizer = LogFinalizer::new(recorder, sample_entry());
        finalizer.update(|entry| entry.status_code = 502);
        finalizer.log_once();
        let _ = std::fs::remove_file(&db_path);
    }
}
