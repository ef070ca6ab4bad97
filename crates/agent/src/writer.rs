// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The sample queue and file-writer task (spec.md §4.2 tasks 3-4, §5
//! "Backpressure"). Samples are pre-formatted bytes (CR/LF-terminated rows
//! for text agents, raw blocks for binary agents); the writer doesn't know
//! or care which.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Soft cap on queued samples, approximating "1 s worth" at a generous
/// 200 Hz device rate (spec.md §5): beyond this the oldest sample is
/// dropped so a stalled disk can't grow the process unbounded.
const QUEUE_SOFT_CAP: usize = 200;

/// Bounded sample queue that drops the oldest entry on overflow instead of
/// blocking the producer or failing a bounded-channel send.
#[derive(Clone)]
pub struct SampleQueue {
    inner: Arc<Mutex<VecDeque<Vec<u8>>>>,
    notify: Arc<Notify>,
    dropped_since_warn: Arc<AtomicBool>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(QUEUE_SOFT_CAP))),
            notify: Arc::new(Notify::new()),
            dropped_since_warn: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn push(&self, sample: Vec<u8>) {
        let mut queue = self.inner.lock().await;
        if queue.len() >= QUEUE_SOFT_CAP {
            queue.pop_front();
            if !self.dropped_since_warn.swap(true, Ordering::Relaxed) {
                tracing::warn!("sample queue over soft cap, dropping oldest samples");
            }
        } else {
            self.dropped_since_warn.store(false, Ordering::Relaxed);
        }
        queue.push_back(sample);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(sample) = self.inner.lock().await.pop_front() {
                return sample;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Command sent from the main supervisor to the file-writer task on
/// NEW_CAPTURE / END_CAPTURE (spec.md §4.2 "File rotation invariant").
pub enum FileCmd {
    /// Flush and close the current file (if any), then open `path` and
    /// write `header` (if any) as the first bytes.
    Rotate { path: PathBuf, header: Option<Vec<u8>> },
    /// Flush and close the current file without opening a new one.
    Close,
}

pub struct FileWriter {
    pub cmds: mpsc::UnboundedSender<FileCmd>,
    pub queue: SampleQueue,
}

pub fn spawn(output_file_name: String, shutdown: CancellationToken) -> FileWriter {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<FileCmd>();
    let queue = SampleQueue::new();
    let task_queue = queue.clone();

    tokio::spawn(async move {
        let mut current: Option<File> = None;

        async fn close(file: &mut Option<File>) {
            if let Some(mut f) = file.take() {
                let _ = f.flush().await;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    close(&mut current).await;
                    break;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(FileCmd::Rotate { path, header }) => {
                            close(&mut current).await;
                            match File::create(&path.join(&output_file_name)).await {
                                Ok(mut f) => {
                                    if let Some(h) = header {
                                        if let Err(e) = f.write_all(&h).await {
                                            tracing::warn!(error = %e, "failed writing segment header");
                                        }
                                    }
                                    current = Some(f);
                                }
                                Err(e) => {
                                    tracing::error!(path = %path.display(), error = %e, "failed to open segment file");
                                }
                            }
                        }
                        Some(FileCmd::Close) => close(&mut current).await,
                        None => break,
                    }
                }
                sample = task_queue.pop() => {
                    if let Some(f) = current.as_mut() {
                        if let Err(e) = f.write_all(&sample).await {
                            tracing::warn!(error = %e, "failed writing sample");
                        }
                    }
                }
            }
        }
    });

    FileWriter { cmds: cmd_tx, queue }
}
