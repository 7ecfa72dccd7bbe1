// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tailing of a single log file.
//!
//! A [`LineReader`] owns its file handle for its whole life. Every time it runs dry it
//! reopens the file by path and compares the new size (and on unix the inode) with the
//! offset it has consumed so far. It also keeps the first bytes it consumed as a
//! fingerprint, checked before every read:
//!
//! - the file shrank, was replaced or its head changed: reading restarts at offset 0;
//! - otherwise reading resumes at the consumed offset.
//!
//! A line is only consumed once its terminator is seen. An unterminated tail is read
//! again on the next poll and, if it is still dangling after [`MAX_EMPTY_POLLS`] polls,
//! shipped as is.
//!
//! Each line is submitted to the topic's work channel and the reader waits for the
//! acknowledgment before moving on, resubmitting the same payload after every failure.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::{Delivery, WorkSender};

/// Consecutive empty polls after which a dangling unterminated line is shipped.
pub const MAX_EMPTY_POLLS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Start from the beginning of the file instead of its end.
    pub read_all: bool,
    /// Wait between two reads that found nothing new.
    pub poll_interval: Duration,
    /// Wait before resubmitting a failed delivery.
    pub retry_backoff: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            read_all: false,
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
enum ReadOutcome {
    Line(Vec<u8>),
    /// Nothing terminated is available. `partial` holds the unterminated tail, if any.
    Eof { partial: Option<Vec<u8>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Continue,
    Restart,
}

type FileId = Option<(u64, u64)>;

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata) -> FileId {
    None
}

/// Leading bytes compared on every reopen to detect a file rewritten in place.
const FINGERPRINT_SIZE: usize = 1000;

/// Open handle on a tailed file plus the offset consumed so far.
#[derive(Debug)]
struct TailedFile {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    id: FileId,
    /// The first `min(offset, FINGERPRINT_SIZE)` bytes consumed.
    head: Vec<u8>,
    /// Second handle on the same file, used to check `head` without moving `reader`.
    head_file: File,
    /// Set when `offset` moved without the reader following it.
    resync: bool,
}

async fn read_head(file: &mut File, len: u64) -> io::Result<Vec<u8>> {
    let mut head = Vec::new();
    file.seek(SeekFrom::Start(0)).await?;
    (&mut *file).take(len).read_to_end(&mut head).await?;
    Ok(head)
}

impl TailedFile {
    async fn open(path: &Path, read_all: bool) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let id = file_id(&file.metadata().await?);
        let mut offset = 0;
        if !read_all {
            offset = file.seek(SeekFrom::End(0)).await?;
            debug!("{}: reading from EOF", path.display());
        }
        let head = read_head(&mut file, offset.min(FINGERPRINT_SIZE as u64)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let head_file = File::open(path).await?;

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset,
            id,
            head,
            head_file,
            resync: false,
        })
    }

    async fn read_line(&mut self) -> io::Result<ReadOutcome> {
        if self.resync {
            self.reader.seek(SeekFrom::Start(self.offset)).await?;
            self.resync = false;
        }
        // A rewritten head is left to `reopen`, which restarts from 0.
        if !self.head_intact().await? {
            return Ok(ReadOutcome::Eof { partial: None });
        }

        let mut buf = Vec::new();
        let read = match self.reader.read_until(b'\n', &mut buf).await {
            Ok(read) => read,
            Err(e) => {
                if let Err(seek) = self.reader.seek(SeekFrom::Start(self.offset)).await {
                    debug!(
                        "{}: failed to rewind to offset {}: {}",
                        self.path.display(),
                        self.offset,
                        seek
                    );
                    self.resync = true;
                }
                return Err(e);
            }
        };

        if read == 0 {
            return Ok(ReadOutcome::Eof { partial: None });
        }
        if buf.last() == Some(&b'\n') {
            self.consume(&buf);
            return Ok(ReadOutcome::Line(buf));
        }

        // Not consumed: read it again, hopefully terminated, on the next poll.
        self.reader.seek(SeekFrom::Start(self.offset)).await?;
        Ok(ReadOutcome::Eof {
            partial: Some(buf),
        })
    }

    async fn head_intact(&mut self) -> io::Result<bool> {
        if self.head.is_empty() {
            return Ok(true);
        }
        let len = self.head.len() as u64;
        Ok(read_head(&mut self.head_file, len).await? == self.head)
    }

    fn consume(&mut self, bytes: &[u8]) {
        let room = FINGERPRINT_SIZE.saturating_sub(self.head.len());
        if room > 0 {
            self.head.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
        self.offset += bytes.len() as u64;
    }

    /// Reopens the file by path, restarting at 0 if it was truncated, replaced or
    /// rewritten in place.
    async fn reopen(&mut self) -> io::Result<Resume> {
        let recorded = self.offset;
        let mut file = File::open(&self.path).await?;
        let size = file.seek(SeekFrom::End(0)).await?;
        let id = file_id(&file.metadata().await?);

        let resume = if size < recorded {
            info!(
                "{}: file shrank from {} to {} bytes, reading from the start",
                self.path.display(),
                recorded,
                size
            );
            Resume::Restart
        } else if id != self.id {
            info!("{}: file was replaced, reading from the start", self.path.display());
            Resume::Restart
        } else if read_head(&mut file, self.head.len() as u64).await? != self.head {
            info!("{}: file was rewritten, reading from the start", self.path.display());
            Resume::Restart
        } else {
            Resume::Continue
        };

        if resume == Resume::Restart {
            self.offset = 0;
            self.head.clear();
        }
        file.seek(SeekFrom::Start(self.offset)).await?;
        self.head_file = File::open(&self.path).await?;
        self.reader = BufReader::new(file);
        self.id = id;
        self.resync = false;
        Ok(resume)
    }

    /// Marks `bytes`, found right past the consumed offset, as consumed. The reader
    /// catches up on the next read.
    fn skip(&mut self, bytes: &[u8]) {
        self.consume(bytes);
        self.resync = true;
    }
}

/// Tails one file and submits its lines to the topic's delivery workers.
pub struct LineReader {
    path: PathBuf,
    topic: Arc<str>,
    tx: WorkSender,
    cancel: CancellationToken,
    options: ReaderOptions,
}

impl LineReader {
    #[must_use]
    pub fn new(
        path: PathBuf,
        topic: Arc<str>,
        tx: WorkSender,
        cancel: CancellationToken,
        options: ReaderOptions,
    ) -> Self {
        Self {
            path,
            topic,
            tx,
            cancel,
            options,
        }
    }

    /// Tails the file until the topic is cancelled or the file becomes unreadable.
    pub async fn spin(self) {
        let file = match TailedFile::open(&self.path, self.options.read_all).await {
            Ok(file) => file,
            Err(e) => {
                error!("{}: failed to open: {}", self.path.display(), e);
                return;
            }
        };
        self.tail(file).await;
    }

    async fn tail(self, mut file: TailedFile) {
        info!(
            "reading {} into topic {} from offset {}",
            self.path.display(),
            self.topic,
            file.offset
        );
        let mut retry_count = 0u32;
        let mut pending: Vec<Vec<u8>> = Vec::new();

        while !self.cancel.is_cancelled() {
            let mut outcome = file.read_line().await;
            if !matches!(outcome, Ok(ReadOutcome::Line(_))) {
                if !self.pause(self.options.poll_interval).await {
                    break;
                }
                retry_count += 1;
                outcome = file.read_line().await;
            }

            match outcome {
                Ok(ReadOutcome::Line(line)) => pending.push(line),
                Ok(ReadOutcome::Eof { partial }) => {
                    let resume = match file.reopen().await {
                        Ok(resume) => resume,
                        Err(e) => {
                            error!("{}: reopen failed: {}", self.path.display(), e);
                            return;
                        }
                    };
                    match partial {
                        Some(line) if resume == Resume::Continue && retry_count >= MAX_EMPTY_POLLS => {
                            debug!(
                                "{}: shipping unterminated line after {} polls",
                                self.path.display(),
                                retry_count
                            );
                            file.skip(&line);
                            pending.push(line);
                        }
                        _ => continue,
                    }
                }
                Err(e) => {
                    error!("{}: read failed: {}", self.path.display(), e);
                    return;
                }
            }

            retry_count = 0;
            if !self.deliver(std::mem::take(&mut pending)).await {
                break;
            }
        }

        debug!("{}: reader for topic {} exiting", self.path.display(), self.topic);
    }

    /// Submits `lines` until a worker acknowledges them. Returns false when cancelled.
    async fn deliver(&self, lines: Vec<Vec<u8>>) -> bool {
        if lines.is_empty() {
            return true;
        }
        let lines: Arc<[Vec<u8>]> = lines.into();
        let mut attempt = 1u32;

        loop {
            let (delivery, outcome) = Delivery::new(Arc::clone(&self.topic), Arc::clone(&lines));
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                sent = self.tx.send_async(delivery) => {
                    if sent.is_err() {
                        debug!("work channel for topic {} closed", self.topic);
                        return false;
                    }
                }
            }

            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                outcome = outcome => outcome,
            };
            match outcome {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => warn!(
                    "{}: delivery attempt {} to {} failed, retrying: {}",
                    self.path.display(),
                    attempt,
                    self.topic,
                    e
                ),
                Err(_) => warn!(
                    "{}: delivery attempt {} to {} got no reply, retrying",
                    self.path.display(),
                    attempt,
                    self.topic
                ),
            }

            if !self.pause(self.options.retry_backoff).await {
                return false;
            }
            attempt += 1;
        }
    }

    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = sleep(duration) => true,
        }
    }
}
