//! Per-pool I/O scheduler.
//!
//! One scheduler runs per storage pool: a bounded FIFO queue served by a
//! single worker. Long jobs (image transfer, resize, shrink, snapshot
//! file work) run here so module workers never block. Each task carries
//! its own progress/result channels; one pool-level event is emitted per
//! task at termination.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kestrel_hypervisor::{CellError, ImageTool, Result};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::SessionId;

/// Queue depth per scheduler; enqueue past this fails with `Busy`.
pub const SCHEDULER_QUEUE_DEPTH: usize = 1024;
/// Transfer chunk size on the image channel.
const TRANSFER_CHUNK_SIZE: usize = 1 << 10;
/// Interval between progress emissions during a transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
/// Read buffer for checksum computation.
const CHECKSUM_BUFFER_SIZE: usize = 4 << 20;
#[cfg(unix)]
const VOLUME_FILE_MODE: u32 = 0o666;

const API_VERSION: u32 = 1;
const SIGNATURE_HEADER: &str = "Signature";
const CHECKSUM_FIELD: &str = "checksum";
const IMAGE_FIELD: &str = "image";

/// Streamed progress, 0..=100, monotone per task.
pub type ProgressSender = mpsc::UnboundedSender<u32>;
/// Terminal task outcome; the payload is the transferred byte count.
pub type ResultSender = oneshot::Sender<Result<u64>>;
/// Synchronous reply channel of snapshot tasks.
pub type SnapshotReplySender = oneshot::Sender<Result<()>>;

/// One file of a snapshot operation.
///
/// `current` is the live file. `backing` is the file `current` will be
/// backed by after creation. `backed` is the file `current` currently
/// backs, used at delete time for the merge.
#[derive(Debug, Clone)]
pub struct SnapshotTarget {
    pub current: PathBuf,
    pub backing: Option<PathBuf>,
    pub backed: Option<PathBuf>,
}

/// A queued scheduler task.
pub enum SchedulerTask {
    WriteDiskImage {
        session: SessionId,
        group: Uuid,
        volume: String,
        path: PathBuf,
        image: String,
        host: String,
        port: u16,
        progress: ProgressSender,
        result: ResultSender,
    },
    ReadDiskImage {
        session: SessionId,
        group: Uuid,
        volume: String,
        path: PathBuf,
        image: String,
        image_size: u64,
        target_size: u64,
        host: String,
        port: u16,
        progress: ProgressSender,
        result: ResultSender,
    },
    Resize {
        session: SessionId,
        group: Uuid,
        volume: String,
        path: PathBuf,
        size: u64,
        result: ResultSender,
    },
    Shrink {
        session: SessionId,
        group: Uuid,
        volume: String,
        path: PathBuf,
        result: ResultSender,
    },
    SnapshotCreate {
        group: Uuid,
        snapshot: String,
        targets: Vec<SnapshotTarget>,
        reply: SnapshotReplySender,
    },
    SnapshotRestore {
        group: Uuid,
        snapshot: String,
        targets: Vec<SnapshotTarget>,
        reply: SnapshotReplySender,
    },
    SnapshotDelete {
        group: Uuid,
        snapshot: String,
        targets: Vec<SnapshotTarget>,
        reply: SnapshotReplySender,
    },
}

/// Completion kinds on the pool event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEventKind {
    WriteDiskCompleted,
    ReadDiskCompleted,
    ResizeCompleted,
    ShrinkCompleted,
    SnapshotCreateCompleted,
    SnapshotRestoreCompleted,
    SnapshotDeleteCompleted,
}

/// Pool-level completion event; exactly one per task.
pub struct SchedulerEvent {
    pub kind: SchedulerEventKind,
    pub group: Uuid,
    pub volume: Option<String>,
    pub snapshot: Option<String>,
    pub error: Option<CellError>,
    pub reply: Option<SnapshotReplySender>,
}

/// HTTP client of the cluster-internal image channel.
///
/// Certificate verification is disabled on this channel; it never leaves
/// the cluster network. The scheme is a field so tests can run against a
/// plain-HTTP peer.
#[derive(Clone)]
pub struct ImageServiceClient {
    scheme: String,
    client: reqwest::Client,
}

impl ImageServiceClient {
    pub fn new() -> Result<Self> {
        Self::with_scheme("https")
    }

    pub fn with_scheme(scheme: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| CellError::Internal(format!("build image client: {e}")))?;
        Ok(Self {
            scheme: scheme.to_string(),
            client,
        })
    }

    /// `PUT`/`GET` endpoint of one disk image.
    pub fn image_url(&self, host: &str, port: u16, image: &str) -> String {
        format!(
            "{}://{}:{}/api/v{}/disk_images/{}/file/",
            self.scheme, host, port, API_VERSION, image
        )
    }
}

#[derive(Deserialize)]
struct ImageServerResponse {
    error_code: i64,
    #[serde(default)]
    message: String,
}

/// Handle used to enqueue tasks; cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    name: String,
    tx: mpsc::Sender<SchedulerTask>,
}

impl SchedulerHandle {
    /// Enqueue a task; never blocks. A full queue hands the task back so
    /// the caller can answer its reply channels with [`Self::busy`].
    pub fn submit(&self, task: SchedulerTask) -> std::result::Result<(), SchedulerTask> {
        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(task) => task,
            mpsc::error::TrySendError::Closed(task) => task,
        })
    }

    /// The error reported when [`Self::submit`] hands a task back.
    pub fn busy(&self) -> CellError {
        CellError::Busy(format!("scheduler '{}' queue full", self.name))
    }
}

/// The per-pool scheduler.
pub struct IoScheduler;

impl IoScheduler {
    /// Spawn the worker and return the enqueue handle.
    pub fn start(
        pool: &str,
        imgtool: Arc<dyn ImageTool>,
        client: ImageServiceClient,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(SCHEDULER_QUEUE_DEPTH);
        let name = pool.to_string();
        tokio::spawn(worker(name.clone(), rx, imgtool, client, events));
        SchedulerHandle { name, tx }
    }
}

async fn worker(
    name: String,
    mut rx: mpsc::Receiver<SchedulerTask>,
    imgtool: Arc<dyn ImageTool>,
    client: ImageServiceClient,
    events: mpsc::UnboundedSender<SchedulerEvent>,
) {
    info!(scheduler = %name, "scheduler started");
    while let Some(task) = rx.recv().await {
        handle_task(&name, task, imgtool.as_ref(), &client, &events).await;
    }
    info!(scheduler = %name, "scheduler stopped");
}

async fn handle_task(
    name: &str,
    task: SchedulerTask,
    imgtool: &dyn ImageTool,
    client: &ImageServiceClient,
    events: &mpsc::UnboundedSender<SchedulerEvent>,
) {
    match task {
        SchedulerTask::WriteDiskImage {
            session,
            group,
            volume,
            path,
            image,
            host,
            port,
            progress,
            result,
        } => {
            let outcome =
                write_disk_image(name, client, &path, &image, &host, port, &progress).await;
            if let Err(err) = &outcome {
                warn!(scheduler = %name, session = format_args!("{session:08X}"), error = %err, "write task failed");
            }
            finish_transfer(
                events,
                SchedulerEventKind::WriteDiskCompleted,
                group,
                volume,
                outcome,
                result,
            );
        }
        SchedulerTask::ReadDiskImage {
            session,
            group,
            volume,
            path,
            image,
            image_size,
            target_size,
            host,
            port,
            progress,
            result,
        } => {
            let outcome = read_disk_image(
                name,
                client,
                imgtool,
                &path,
                &image,
                image_size,
                target_size,
                &host,
                port,
                &progress,
            )
            .await;
            if let Err(err) = &outcome {
                warn!(scheduler = %name, session = format_args!("{session:08X}"), error = %err, "read task failed");
            }
            finish_transfer(
                events,
                SchedulerEventKind::ReadDiskCompleted,
                group,
                volume,
                outcome,
                result,
            );
        }
        SchedulerTask::Resize {
            session,
            group,
            volume,
            path,
            size,
            result,
        } => {
            let begin = Instant::now();
            let outcome = imgtool.resize(&path, size).await.map(|_| 0u64);
            match &outcome {
                Ok(_) => info!(
                    scheduler = %name,
                    path = %path.display(),
                    size,
                    elapsed_ms = begin.elapsed().as_millis() as u64,
                    "volume resized"
                ),
                Err(err) => warn!(scheduler = %name, session = format_args!("{session:08X}"), error = %err, "resize task failed"),
            }
            finish_transfer(
                events,
                SchedulerEventKind::ResizeCompleted,
                group,
                volume,
                outcome,
                result,
            );
        }
        SchedulerTask::Shrink {
            session,
            group,
            volume,
            path,
            result,
        } => {
            let begin = Instant::now();
            let outcome = shrink_volume(imgtool, &path).await.map(|_| 0u64);
            match &outcome {
                Ok(_) => info!(
                    scheduler = %name,
                    path = %path.display(),
                    elapsed_ms = begin.elapsed().as_millis() as u64,
                    "volume shrunk"
                ),
                Err(err) => warn!(scheduler = %name, session = format_args!("{session:08X}"), error = %err, "shrink task failed"),
            }
            finish_transfer(
                events,
                SchedulerEventKind::ShrinkCompleted,
                group,
                volume,
                outcome,
                result,
            );
        }
        SchedulerTask::SnapshotCreate {
            group,
            snapshot,
            targets,
            reply,
        } => {
            let outcome = create_snapshot_files(name, imgtool, &targets).await;
            finish_snapshot(
                events,
                SchedulerEventKind::SnapshotCreateCompleted,
                group,
                snapshot,
                outcome,
                reply,
            );
        }
        SchedulerTask::SnapshotRestore {
            group,
            snapshot,
            targets,
            reply,
        } => {
            let outcome = restore_snapshot_files(name, imgtool, &targets).await;
            finish_snapshot(
                events,
                SchedulerEventKind::SnapshotRestoreCompleted,
                group,
                snapshot,
                outcome,
                reply,
            );
        }
        SchedulerTask::SnapshotDelete {
            group,
            snapshot,
            targets,
            reply,
        } => {
            let outcome = delete_snapshot_files(name, imgtool, &targets).await;
            finish_snapshot(
                events,
                SchedulerEventKind::SnapshotDeleteCompleted,
                group,
                snapshot,
                outcome,
                reply,
            );
        }
    }
}

/// Emit the pool event, then the task result; both exactly once.
fn finish_transfer(
    events: &mpsc::UnboundedSender<SchedulerEvent>,
    kind: SchedulerEventKind,
    group: Uuid,
    volume: String,
    outcome: Result<u64>,
    result: ResultSender,
) {
    let _ = events.send(SchedulerEvent {
        kind,
        group,
        volume: Some(volume),
        snapshot: None,
        error: outcome.as_ref().err().cloned(),
        reply: None,
    });
    let _ = result.send(outcome);
}

/// Snapshot tasks reply through the pool event so the module can update
/// its chain index before the caller observes completion.
fn finish_snapshot(
    events: &mpsc::UnboundedSender<SchedulerEvent>,
    kind: SchedulerEventKind,
    group: Uuid,
    snapshot: String,
    outcome: Result<()>,
    reply: SnapshotReplySender,
) {
    if events
        .send(SchedulerEvent {
            kind,
            group,
            volume: None,
            snapshot: Some(snapshot),
            error: outcome.as_ref().err().cloned(),
            reply: Some(reply),
        })
        .is_err()
    {
        warn!("pool event stream closed, snapshot reply dropped");
    }
}

// =============================================================================
// TRANSFERS
// =============================================================================

struct ProgressTicker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressTicker {
    fn spawn(progress: ProgressSender, counter: Arc<AtomicU64>, total: u64) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = interval.tick() => {
                        if total == 0 {
                            continue;
                        }
                        let processed = counter.load(Ordering::Relaxed);
                        let percent = ((processed * 100) / total).min(100) as u32;
                        if progress.send(percent).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, handle }
    }

    /// Stop the ticker before the result is emitted, so progress never
    /// trails the terminal outcome.
    async fn finish(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

fn chunked_file_stream(
    file: tokio::fs::File,
    counter: Arc<AtomicU64>,
) -> impl futures::Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static {
    futures::stream::unfold((file, counter), |(mut file, counter)| async move {
        let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
        match file.read(&mut buffer).await {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                counter.fetch_add(n as u64, Ordering::Relaxed);
                Some((Ok(buffer), (file, counter)))
            }
            Err(err) => Some((Err(err), (file, counter))),
        }
    })
}

async fn write_disk_image(
    name: &str,
    client: &ImageServiceClient,
    path: &Path,
    image: &str,
    host: &str,
    port: u16,
    progress: &ProgressSender,
) -> Result<u64> {
    let metadata = tokio::fs::metadata(path).await?;
    let total = metadata.len();
    let checksum = compute_sha1(name, path).await?;
    let file = tokio::fs::File::open(path).await?;

    let counter = Arc::new(AtomicU64::new(0));
    let ticker = ProgressTicker::spawn(progress.clone(), counter.clone(), total);

    let url = client.image_url(host, port, image);
    debug!(scheduler = %name, url = %url, bytes = total, "uploading disk image");
    let stream = chunked_file_stream(file, counter);
    let form = reqwest::multipart::Form::new()
        .text(CHECKSUM_FIELD, checksum)
        .part(
            IMAGE_FIELD,
            reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(stream))
                .file_name(image.to_string()),
        );

    let response = client.client.put(&url).multipart(form).send().await;
    ticker.finish().await;

    let response = response.map_err(|e| CellError::RemoteFailed(e.to_string()))?;
    let decoded: ImageServerResponse = response
        .json()
        .await
        .map_err(|e| CellError::RemoteFailed(format!("decode image service reply: {e}")))?;
    if decoded.error_code != 0 {
        return Err(CellError::RemoteFailed(decoded.message));
    }
    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn read_disk_image(
    name: &str,
    client: &ImageServiceClient,
    imgtool: &dyn ImageTool,
    path: &Path,
    image: &str,
    image_size: u64,
    target_size: u64,
    host: &str,
    port: u16,
    progress: &ProgressSender,
) -> Result<u64> {
    let url = client.image_url(host, port, image);
    debug!(scheduler = %name, url = %url, "downloading disk image");
    let response = client
        .client
        .get(&url)
        .send()
        .await
        .map_err(|e| CellError::RemoteFailed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(CellError::RemoteFailed(format!(
            "image service answered {}",
            response.status()
        )));
    }
    let signature = response
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(VOLUME_FILE_MODE);
    let mut file = options.open(path).await?;

    let counter = Arc::new(AtomicU64::new(0));
    let ticker = ProgressTicker::spawn(progress.clone(), counter.clone(), image_size);

    let mut stream = response.bytes_stream();
    let outcome: Result<u64> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CellError::RemoteFailed(e.to_string()))?;
            file.write_all(&chunk).await?;
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        file.flush().await?;
        Ok(counter.load(Ordering::Relaxed))
    }
    .await;
    ticker.finish().await;
    drop(file);
    let received = outcome?;

    if let Some(expected) = signature {
        debug!(scheduler = %name, "image data received, checking integrity");
        let computed = compute_sha1(name, path).await?;
        if !computed.eq_ignore_ascii_case(&expected) {
            let _ = tokio::fs::remove_file(path).await;
            return Err(CellError::Corrupted("image checksum mismatch".to_string()));
        }
    }

    if let Err(err) = imgtool.resize(path, target_size).await {
        let _ = tokio::fs::remove_file(path).await;
        return Err(err);
    }
    Ok(received)
}

async fn shrink_volume(imgtool: &dyn ImageTool, path: &Path) -> Result<()> {
    let mut shrunk = path.as_os_str().to_os_string();
    shrunk.push("_shrink");
    let shrunk = PathBuf::from(shrunk);

    imgtool.convert(path, &shrunk).await?;
    tokio::fs::remove_file(path).await?;
    imgtool.rename(&shrunk, path).await?;
    Ok(())
}

// =============================================================================
// SNAPSHOT FILE WORK
// =============================================================================

async fn create_snapshot_files(
    name: &str,
    imgtool: &dyn ImageTool,
    targets: &[SnapshotTarget],
) -> Result<()> {
    for target in targets {
        let backing = target
            .backing
            .as_ref()
            .ok_or_else(|| CellError::Internal("snapshot target without backing".to_string()))?;
        imgtool.rename(&target.current, backing).await?;
        imgtool.create_backed(&target.current, backing).await?;
        debug!(scheduler = %name, current = %target.current.display(), backing = %backing.display(), "snapshot file created");
    }
    Ok(())
}

async fn restore_snapshot_files(
    name: &str,
    imgtool: &dyn ImageTool,
    targets: &[SnapshotTarget],
) -> Result<()> {
    for target in targets {
        let backing = target
            .backing
            .as_ref()
            .ok_or_else(|| CellError::Internal("snapshot target without backing".to_string()))?;
        if !backing.exists() {
            return Err(CellError::InvalidInput(format!(
                "invalid backing path '{}'",
                backing.display()
            )));
        }
        tokio::fs::remove_file(&target.current).await?;
        imgtool.create_backed(&target.current, backing).await?;
        debug!(scheduler = %name, current = %target.current.display(), backing = %backing.display(), "snapshot file restored");
    }
    Ok(())
}

async fn delete_snapshot_files(
    name: &str,
    imgtool: &dyn ImageTool,
    targets: &[SnapshotTarget],
) -> Result<()> {
    for target in targets {
        match &target.backed {
            None => {
                // Orphaned branch file: remove only, keep going on error.
                if let Err(err) = tokio::fs::remove_file(&target.current).await {
                    warn!(scheduler = %name, path = %target.current.display(), error = %err, "delete snapshot file failed");
                } else {
                    debug!(scheduler = %name, path = %target.current.display(), "snapshot file deleted");
                }
            }
            Some(backed) => {
                imgtool.commit(backed).await.map_err(|err| {
                    CellError::ToolFailed(format!(
                        "commit '{}' while deleting snapshot: {err}",
                        backed.display()
                    ))
                })?;
                tokio::fs::remove_file(backed).await?;
                imgtool.rename(&target.current, backed).await?;
                debug!(scheduler = %name, merged = %backed.display(), "snapshot file merged");
            }
        }
    }
    Ok(())
}

// =============================================================================
// CHECKSUM
// =============================================================================

/// SHA-1 of a file, hex-encoded.
pub async fn compute_sha1(name: &str, path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHECKSUM_BUFFER_SIZE];
    let mut total = 0u64;
    let begin = Instant::now();
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buffer[..n]);
    }
    let sum = hex::encode(hasher.finalize());
    debug!(
        scheduler = %name,
        bytes = total,
        elapsed_ms = begin.elapsed().as_millis() as u64,
        "checksum computed"
    );
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_hypervisor::FileImageTool;

    #[tokio::test]
    async fn sha1_matches_known_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample");

        tokio::fs::write(&path, b"").await.unwrap();
        assert_eq!(
            compute_sha1("t", &path).await.unwrap(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );

        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(
            compute_sha1("t", &path).await.unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn image_url_layout() {
        let client = ImageServiceClient::new().unwrap();
        assert_eq!(
            client.image_url("imagehost", 5443, "img-1"),
            "https://imagehost:5443/api/v1/disk_images/img-1/file/"
        );
    }

    #[tokio::test]
    async fn full_queue_rejects_with_busy() {
        let (tx, _rx) = mpsc::channel(2);
        let handle = SchedulerHandle {
            name: "test".to_string(),
            tx,
        };
        let submit = |handle: &SchedulerHandle| {
            let (result, _) = oneshot::channel();
            handle.submit(SchedulerTask::Resize {
                session: 1,
                group: Uuid::new_v4(),
                volume: "v".to_string(),
                path: PathBuf::from("/nonexistent"),
                size: 1,
                result,
            })
        };
        assert!(submit(&handle).is_ok());
        assert!(submit(&handle).is_ok());
        assert!(submit(&handle).is_err());
        assert!(matches!(handle.busy(), CellError::Busy(_)));
    }

    #[tokio::test]
    async fn snapshot_create_renames_and_rebuilds_current() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("vol.qcow2");
        let backing = dir.path().join("vol.s1.qcow2");
        tokio::fs::write(&current, b"live-data").await.unwrap();

        let tool = FileImageTool::new();
        create_snapshot_files(
            "t",
            &tool,
            &[SnapshotTarget {
                current: current.clone(),
                backing: Some(backing.clone()),
                backed: None,
            }],
        )
        .await
        .unwrap();

        assert!(backing.exists());
        assert_eq!(tokio::fs::read(&backing).await.unwrap(), b"live-data");
        // The live file was re-created on top of the snapshot file.
        assert!(current.exists());
    }

    #[tokio::test]
    async fn snapshot_restore_requires_backing() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("vol.qcow2");
        tokio::fs::write(&current, b"live").await.unwrap();

        let tool = FileImageTool::new();
        let missing = dir.path().join("vol.absent.qcow2");
        let err = restore_snapshot_files(
            "t",
            &tool,
            &[SnapshotTarget {
                current: current.clone(),
                backing: Some(missing),
                backed: None,
            }],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CellError::InvalidInput(_)));
        // The live file is untouched when validation fails up front.
        assert!(current.exists());
    }

    #[tokio::test]
    async fn snapshot_delete_merges_into_backed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileImageTool::new();

        // Build: snapshot file backs the live file.
        let current = dir.path().join("vol.qcow2");
        let snapshot_file = dir.path().join("vol.s1.qcow2");
        tokio::fs::write(&current, b"state-at-s1").await.unwrap();
        create_snapshot_files(
            "t",
            &tool,
            &[SnapshotTarget {
                current: current.clone(),
                backing: Some(snapshot_file.clone()),
                backed: None,
            }],
        )
        .await
        .unwrap();
        tokio::fs::write(&current, b"state-after-s1").await.unwrap();

        // Delete s1: the live file merges down, the snapshot file is gone.
        delete_snapshot_files(
            "t",
            &tool,
            &[SnapshotTarget {
                current: snapshot_file.clone(),
                backing: None,
                backed: Some(current.clone()),
            }],
        )
        .await
        .unwrap();

        assert!(!snapshot_file.exists());
        assert_eq!(tokio::fs::read(&current).await.unwrap(), b"state-after-s1");
    }

    #[tokio::test]
    async fn shrink_swaps_the_image_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.qcow2");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let tool = FileImageTool::new();
        shrink_volume(&tool, &path).await.unwrap();

        assert!(path.exists());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload");
        let mut leftover = path.as_os_str().to_os_string();
        leftover.push("_shrink");
        assert!(!PathBuf::from(leftover).exists());
    }
}
