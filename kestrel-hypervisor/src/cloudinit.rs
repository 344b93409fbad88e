//! Cloud-init NoCloud boot ISO synthesis.
//!
//! The cell provisions first-boot credentials and the data-disk mount
//! through a small read-only ISO carrying `meta-data` and `user-data`,
//! generated with the genisoimage tool family.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{CellError, Result};

/// Inputs for one guest's boot ISO.
#[derive(Debug, Clone, Default)]
pub struct BootIsoConfig {
    /// Instance id (guest UUID).
    pub instance_id: String,
    /// Hostname, derived from the guest name.
    pub hostname: String,
    /// Admin account to create.
    pub admin_name: String,
    /// Admin account secret.
    pub admin_secret: String,
    /// Mount path of the first data volume.
    pub data_path: String,
    /// Allow root login over ssh.
    pub root_login_enabled: bool,
}

impl BootIsoConfig {
    /// Render the `meta-data` file.
    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id, self.hostname
        )
    }

    /// Render the `user-data` cloud-config.
    pub fn user_data(&self) -> String {
        let mut lines = vec![
            "#cloud-config".to_string(),
            format!("hostname: {}", self.hostname),
            "manage_etc_hosts: true".to_string(),
            "users:".to_string(),
            format!("  - name: {}", self.admin_name),
            "    groups: wheel".to_string(),
            "    sudo: ALL=(ALL) NOPASSWD:ALL".to_string(),
            "    shell: /bin/bash".to_string(),
            "    lock_passwd: false".to_string(),
            "chpasswd:".to_string(),
            "  expire: false".to_string(),
            "  list: |".to_string(),
            format!("    {}:{}", self.admin_name, self.admin_secret),
            "ssh_pwauth: true".to_string(),
            format!(
                "disable_root: {}",
                if self.root_login_enabled { "false" } else { "true" }
            ),
        ];
        if !self.data_path.is_empty() {
            lines.push("mounts:".to_string());
            lines.push(format!("  - [ /dev/disk1, {} ]", self.data_path));
        }
        lines.push("runcmd:".to_string());
        lines.push("  - systemctl enable qemu-guest-agent".to_string());
        lines.push("  - systemctl start qemu-guest-agent".to_string());
        let mut data = lines.join("\n");
        data.push('\n');
        data
    }
}

/// Generator for NoCloud boot ISOs.
pub struct CloudInitGenerator {
    iso_tool: String,
}

impl Default for CloudInitGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudInitGenerator {
    pub fn new() -> Self {
        Self {
            iso_tool: Self::find_iso_tool(),
        }
    }

    /// Probe for an available ISO tool.
    fn find_iso_tool() -> String {
        for candidate in ["genisoimage", "mkisofs", "xorrisofs"] {
            if Command::new(candidate).arg("--version").output().is_ok() {
                return candidate.to_string();
            }
        }
        "genisoimage".to_string()
    }

    /// Synthesize the ISO at `output_path`.
    pub fn generate(&self, config: &BootIsoConfig, output_path: &Path) -> Result<PathBuf> {
        let staging = tempfile::tempdir()
            .map_err(|e| CellError::Internal(format!("create staging dir: {e}")))?;

        std::fs::write(staging.path().join("meta-data"), config.meta_data())?;
        std::fs::write(staging.path().join("user-data"), config.user_data())?;
        debug!(instance = %config.instance_id, "staged cloud-init data");

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let output = Command::new(&self.iso_tool)
            .args([
                "-output",
                &output_path.to_string_lossy(),
                "-volid",
                "cidata",
                "-joliet",
                "-rock",
                &staging.path().to_string_lossy(),
            ])
            .output()
            .map_err(|e| CellError::ToolFailed(format!("{}: {e}", self.iso_tool)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CellError::ToolFailed(stderr));
        }

        info!(path = %output_path.display(), "boot ISO generated");
        Ok(output_path.to_path_buf())
    }
}
