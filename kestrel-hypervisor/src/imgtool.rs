//! Adapter around the external image-manipulation tool.
//!
//! Every invocation is an independent child process; a nonzero exit maps
//! to `ToolFailed` carrying the tool's combined output.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CellError, Result};

const IMAGE_COMMAND: &str = "qemu-img";
const IMAGE_FORMAT_QCOW2: &str = "qcow2";

/// Image-file operations the storage and scheduler layers depend on.
///
/// Kept behind a trait so storage and snapshot logic can run against plain
/// files in tests.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Create an empty qcow2 image of the given virtual size.
    async fn create(&self, path: &Path, size: u64) -> Result<()>;

    /// Create an empty qcow2 image backed by another image.
    async fn create_backed(&self, path: &Path, backing: &Path) -> Result<()>;

    /// Commit an image's deltas into its backing file.
    async fn commit(&self, path: &Path) -> Result<()>;

    /// Re-encode qcow2 → qcow2, dropping unreferenced clusters.
    async fn convert(&self, source: &Path, target: &Path) -> Result<()>;

    /// Resize an image to the given virtual size.
    async fn resize(&self, path: &Path, size: u64) -> Result<()>;

    /// Move an image file, carrying any implementation metadata with it.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| CellError::ToolFailed(format!("rename {}: {e}", from.display())))
    }
}

/// The real tool, shelling out to `qemu-img`.
#[derive(Clone)]
pub struct QemuImg {
    command: String,
}

impl QemuImg {
    pub fn new() -> Self {
        Self {
            command: IMAGE_COMMAND.to_string(),
        }
    }

    /// Override the binary path.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        debug!(command = %self.command, ?args, "invoking image tool");
        let output = Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|e| CellError::ToolFailed(format!("{}: {e}", self.command)))?;
        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if message.is_empty() {
                message = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(CellError::ToolFailed(message));
        }
        Ok(())
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-file implementation for development mode and tests.
///
/// Images are ordinary files; the backing relation lives in a `.backing`
/// sidecar. `create_backed` materializes the backing content into the new
/// file and `commit` copies an image back into its recorded backing, which
/// preserves the observable chain semantics without the real tool.
#[derive(Clone, Default)]
pub struct FileImageTool;

impl FileImageTool {
    pub fn new() -> Self {
        Self
    }

    fn sidecar(path: &Path) -> std::path::PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".backing");
        std::path::PathBuf::from(name)
    }
}

#[async_trait]
impl ImageTool for FileImageTool {
    async fn create(&self, path: &Path, size: u64) -> Result<()> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| CellError::ToolFailed(format!("create {}: {e}", path.display())))?;
        file.set_len(size)
            .await
            .map_err(|e| CellError::ToolFailed(format!("size {}: {e}", path.display())))?;
        Ok(())
    }

    async fn create_backed(&self, path: &Path, backing: &Path) -> Result<()> {
        tokio::fs::copy(backing, path)
            .await
            .map_err(|e| CellError::ToolFailed(format!("backing {}: {e}", backing.display())))?;
        tokio::fs::write(Self::sidecar(path), backing.to_string_lossy().as_bytes())
            .await
            .map_err(|e| CellError::ToolFailed(e.to_string()))?;
        Ok(())
    }

    async fn commit(&self, path: &Path) -> Result<()> {
        let sidecar = Self::sidecar(path);
        let backing = tokio::fs::read_to_string(&sidecar)
            .await
            .map_err(|_| CellError::ToolFailed(format!("no backing file for {}", path.display())))?;
        tokio::fs::copy(path, backing.trim())
            .await
            .map_err(|e| CellError::ToolFailed(format!("commit {}: {e}", path.display())))?;
        Ok(())
    }

    async fn convert(&self, source: &Path, target: &Path) -> Result<()> {
        tokio::fs::copy(source, target)
            .await
            .map_err(|e| CellError::ToolFailed(format!("convert {}: {e}", source.display())))?;
        Ok(())
    }

    async fn resize(&self, path: &Path, size: u64) -> Result<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| CellError::ToolFailed(format!("resize {}: {e}", path.display())))?;
        file.set_len(size)
            .await
            .map_err(|e| CellError::ToolFailed(e.to_string()))?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| CellError::ToolFailed(format!("rename {}: {e}", from.display())))?;
        // The backing pointer travels with the file, as it would inside a
        // real image header; a stale pointer at the destination is dropped.
        let from_sidecar = Self::sidecar(from);
        let to_sidecar = Self::sidecar(to);
        if tokio::fs::metadata(&from_sidecar).await.is_ok() {
            tokio::fs::rename(&from_sidecar, &to_sidecar)
                .await
                .map_err(|e| CellError::ToolFailed(e.to_string()))?;
        } else {
            let _ = tokio::fs::remove_file(&to_sidecar).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    async fn create(&self, path: &Path, size: u64) -> Result<()> {
        self.run(&[
            "create",
            "-f",
            IMAGE_FORMAT_QCOW2,
            &path.to_string_lossy(),
            &size.to_string(),
        ])
        .await
    }

    async fn create_backed(&self, path: &Path, backing: &Path) -> Result<()> {
        self.run(&[
            "create",
            "-f",
            IMAGE_FORMAT_QCOW2,
            "-F",
            IMAGE_FORMAT_QCOW2,
            "-b",
            &backing.to_string_lossy(),
            &path.to_string_lossy(),
        ])
        .await
    }

    async fn commit(&self, path: &Path) -> Result<()> {
        self.run(&["commit", &path.to_string_lossy()]).await
    }

    async fn convert(&self, source: &Path, target: &Path) -> Result<()> {
        self.run(&[
            "convert",
            "-f",
            IMAGE_FORMAT_QCOW2,
            "-O",
            IMAGE_FORMAT_QCOW2,
            &source.to_string_lossy(),
            &target.to_string_lossy(),
        ])
        .await
    }

    async fn resize(&self, path: &Path, size: u64) -> Result<()> {
        self.run(&["resize", &path.to_string_lossy(), &size.to_string()])
            .await
    }
}
