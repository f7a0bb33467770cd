//! Buffered per-step log writer. Sits between the engine's container tail
//! and a [`LogClient`]: assembles lines, masks secrets, keeps a bounded
//! history for live tails and failure classification, and batches uploads.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::{Line, LogClient, Sink};

/// Lines buffered before a batch is shipped to the client.
const BATCH_SIZE: usize = 100;

/// Seconds between periodic flushes of a partial batch.
const FLUSH_INTERVAL_SECS: u64 = 5;

/// Bound on the retained output history.
const MAX_HISTORY_BYTES: usize = 5 * 1024 * 1024;

const MASK: &str = "**************";

enum Msg {
    Lines(Vec<Line>),
    Close(oneshot::Sender<()>),
}

struct Inner {
    history: Vec<u8>,
    partial: String,
    subs: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    line_no: i64,
    closed: bool,
}

pub struct LiveLog {
    key: String,
    secrets: Vec<String>,
    inner: Mutex<Inner>,
    tx: mpsc::UnboundedSender<Msg>,
}

impl LiveLog {
    /// Opens the stream for `key` and starts the background flusher. When
    /// `upload_on_close` is set the full line history is re-uploaded in one
    /// shot before the stream is closed (indirect upload mode).
    pub fn new(
        client: Arc<dyn LogClient>,
        key: impl Into<String>,
        secrets: Vec<String>,
        upload_on_close: bool,
    ) -> Arc<Self> {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flusher(client, key.clone(), rx, upload_on_close));
        Arc::new(Self {
            key,
            secrets: secrets.into_iter().filter(|s| !s.is_empty()).collect(),
            inner: Mutex::new(Inner {
                history: Vec::new(),
                partial: String::new(),
                subs: Vec::new(),
                line_no: 0,
                closed: false,
            }),
            tx,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The captured output so far, lossily decoded. Used by the failure
    /// classifier after a non-zero exit.
    pub fn snapshot(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut text = String::from_utf8_lossy(&inner.history).into_owned();
        text.push_str(&inner.partial);
        text
    }

    /// Returns history from `offset` plus a channel that yields data written
    /// after this call. The channel ends when the log is closed.
    pub fn tail(&self, offset: usize) -> (Vec<u8>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut inner = self.inner.lock().unwrap();
        let start = offset.min(inner.history.len());
        let old = inner.history[start..].to_vec();
        let (tx, rx) = mpsc::unbounded_channel();
        if !inner.closed {
            inner.subs.push(tx);
        }
        (old, rx)
    }

    /// Flushes buffered lines, optionally uploads the consolidated log, and
    /// closes the client stream. Idempotent.
    pub async fn close(&self) {
        let flush = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.subs.clear();
            if inner.partial.is_empty() {
                None
            } else {
                let out = std::mem::take(&mut inner.partial);
                let pos = inner.line_no;
                inner.line_no += 1;
                Some(Line::output(pos, out))
            }
        };
        if let Some(line) = flush {
            let _ = self.tx.send(Msg::Lines(vec![line]));
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Msg::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), MASK);
            }
        }
        masked
    }
}

impl Sink for LiveLog {
    fn write(&self, data: &[u8]) {
        let text = self.mask(&String::from_utf8_lossy(data));
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        inner.history.extend_from_slice(text.as_bytes());
        if inner.history.len() > MAX_HISTORY_BYTES {
            let excess = inner.history.len() - MAX_HISTORY_BYTES;
            inner.history.drain(..excess);
        }

        inner
            .subs
            .retain(|sub| sub.send(text.as_bytes().to_vec()).is_ok());

        inner.partial.push_str(&text);
        let mut batch = Vec::new();
        while let Some(idx) = inner.partial.find('\n') {
            let rest = inner.partial.split_off(idx + 1);
            let mut out = std::mem::replace(&mut inner.partial, rest);
            out.truncate(out.len() - 1);
            let pos = inner.line_no;
            inner.line_no += 1;
            batch.push(Line::output(pos, out));
        }
        if !batch.is_empty() {
            let _ = self.tx.send(Msg::Lines(batch));
        }
    }
}

async fn flusher(
    client: Arc<dyn LogClient>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    upload_on_close: bool,
) {
    if let Err(err) = client.open(&key).await {
        warn!(key = %key, error = %err, "could not open log stream");
    }

    let mut pending: Vec<Line> = Vec::new();
    let mut all: Vec<Line> = Vec::new();
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(Msg::Lines(mut lines)) => {
                        if upload_on_close {
                            all.extend(lines.iter().cloned());
                        }
                        pending.append(&mut lines);
                        if pending.len() >= BATCH_SIZE {
                            flush(client.as_ref(), &key, &mut pending).await;
                        }
                    }
                    Some(Msg::Close(ack)) => {
                        flush(client.as_ref(), &key, &mut pending).await;
                        if upload_on_close {
                            if let Err(err) = client.upload(&key, &all).await {
                                warn!(key = %key, error = %err, "consolidated log upload failed");
                            }
                        }
                        if let Err(err) = client.close(&key).await {
                            warn!(key = %key, error = %err, "could not close log stream");
                        }
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        flush(client.as_ref(), &key, &mut pending).await;
                        let _ = client.close(&key).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(client.as_ref(), &key, &mut pending).await;
            }
        }
    }
}

async fn flush(client: &dyn LogClient, key: &str, pending: &mut Vec<Line>) {
    if pending.is_empty() {
        return;
    }
    let lines = std::mem::take(pending);
    if let Err(err) = client.write(key, &lines).await {
        warn!(key = %key, error = %err, "log batch write failed");
    }
}
