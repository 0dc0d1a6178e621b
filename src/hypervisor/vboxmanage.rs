//! Subprocess adapter for the VirtualBox `VBoxManage` control tool.

use std::path::{Path, PathBuf};

use super::{GuestCredential, Hypervisor, MediaKind, VmHandle, VmSpec, handle_from_name};
use crate::error::ProvisionError;

/// Well-known install locations probed before falling back to PATH.
#[cfg(windows)]
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files\Oracle\VirtualBox\VBoxManage.exe",
    r"C:\Program Files (x86)\Oracle\VirtualBox\VBoxManage.exe",
];

#[cfg(not(windows))]
const INSTALL_PATHS: &[&str] = &["/usr/bin/VBoxManage", "/usr/local/bin/VBoxManage"];

#[cfg(windows)]
const TOOL_NAME: &str = "VBoxManage.exe";

#[cfg(not(windows))]
const TOOL_NAME: &str = "VBoxManage";

const SATA_CONTROLLER: &str = "SATA";
const IDE_CONTROLLER: &str = "IDE";
const FLOPPY_CONTROLLER: &str = "Floppy";

/// Locate the control tool: well-known install paths first, then PATH.
pub fn locate() -> Option<PathBuf> {
    for candidate in INSTALL_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(TOOL_NAME))
        .find(|p| p.exists())
}

pub struct VBoxManage {
    tool: PathBuf,
}

impl VBoxManage {
    pub fn new() -> Result<Self, ProvisionError> {
        let tool = locate().ok_or_else(|| ProvisionError::Hypervisor {
            operation: "locate".into(),
            detail: format!("{TOOL_NAME} not found in well-known install locations or PATH"),
        })?;
        Ok(Self { tool })
    }

    /// Invoke the tool once, returning stdout. A spawn failure or non-zero
    /// exit becomes a hypervisor error carrying the raw diagnostic text.
    async fn run(&self, operation: &str, args: &[&str]) -> Result<String, ProvisionError> {
        tracing::debug!(operation, ?args, "invoking hypervisor tool");

        let output = tokio::process::Command::new(&self.tool)
            .args(args)
            .output()
            .await
            .map_err(|e| ProvisionError::Hypervisor {
                operation: operation.to_string(),
                detail: format!("failed to launch {}: {e}", self.tool.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(ProvisionError::Hypervisor {
                operation: operation.to_string(),
                detail: format!("{} ({diagnostic})", output.status),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Hypervisor for VBoxManage {
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmHandle, ProvisionError> {
        self.run(
            "createvm",
            &[
                "createvm",
                "--name",
                &spec.name,
                "--ostype",
                "Debian_64",
                "--register",
            ],
        )
        .await?;

        let memory = spec.memory_mb.to_string();
        let cpus = spec.cpus.to_string();
        self.run(
            "modifyvm",
            &[
                "modifyvm",
                &spec.name,
                "--memory",
                &memory,
                "--cpus",
                &cpus,
                "--boot1",
                "disk",
                "--boot2",
                "dvd",
                "--audio-enabled",
                "off",
            ],
        )
        .await?;

        Ok(handle_from_name(&spec.name))
    }

    async fn destroy_vm(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        self.run(
            "unregistervm",
            &["unregistervm", handle.name(), "--delete"],
        )
        .await?;
        Ok(())
    }

    async fn attach_disk(
        &self,
        handle: &VmHandle,
        path: &Path,
        size_mb: u64,
    ) -> Result<(), ProvisionError> {
        let path_str = path.display().to_string();

        if !path.exists() {
            let size = size_mb.to_string();
            self.run(
                "createmedium",
                &[
                    "createmedium",
                    "disk",
                    "--filename",
                    &path_str,
                    "--size",
                    &size,
                    "--format",
                    "VDI",
                ],
            )
            .await?;
        }

        self.run(
            "storagectl",
            &[
                "storagectl",
                handle.name(),
                "--name",
                SATA_CONTROLLER,
                "--add",
                "sata",
                "--controller",
                "IntelAhci",
                "--portcount",
                "2",
            ],
        )
        .await?;

        self.run(
            "storageattach",
            &[
                "storageattach",
                handle.name(),
                "--storagectl",
                SATA_CONTROLLER,
                "--port",
                "0",
                "--device",
                "0",
                "--type",
                "hdd",
                "--medium",
                &path_str,
            ],
        )
        .await?;
        Ok(())
    }

    async fn attach_removable_media(
        &self,
        handle: &VmHandle,
        path: &Path,
        kind: MediaKind,
    ) -> Result<(), ProvisionError> {
        let path_str = path.display().to_string();
        match kind {
            MediaKind::Dvd => {
                self.run(
                    "storagectl",
                    &[
                        "storagectl",
                        handle.name(),
                        "--name",
                        IDE_CONTROLLER,
                        "--add",
                        "ide",
                    ],
                )
                .await?;
                self.run(
                    "storageattach",
                    &[
                        "storageattach",
                        handle.name(),
                        "--storagectl",
                        IDE_CONTROLLER,
                        "--port",
                        "1",
                        "--device",
                        "0",
                        "--type",
                        "dvddrive",
                        "--medium",
                        &path_str,
                    ],
                )
                .await?;
            }
            MediaKind::Floppy => {
                self.run(
                    "storagectl",
                    &[
                        "storagectl",
                        handle.name(),
                        "--name",
                        FLOPPY_CONTROLLER,
                        "--add",
                        "floppy",
                    ],
                )
                .await?;
                self.run(
                    "storageattach",
                    &[
                        "storageattach",
                        handle.name(),
                        "--storagectl",
                        FLOPPY_CONTROLLER,
                        "--port",
                        "0",
                        "--device",
                        "0",
                        "--type",
                        "fdd",
                        "--medium",
                        &path_str,
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn configure_network_adapter(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        // NIC 1: NAT carries the SSH port forward and outbound traffic.
        // NIC 2: host-only, where the guest-side static IP lives.
        self.run(
            "modifyvm",
            &[
                "modifyvm",
                handle.name(),
                "--nic1",
                "nat",
                "--cableconnected1",
                "on",
                "--nic2",
                "hostonly",
                "--hostonlyadapter2",
                "vboxnet0",
            ],
        )
        .await?;
        Ok(())
    }

    async fn configure_port_forward(
        &self,
        handle: &VmHandle,
        host_port: u16,
        guest_port: u16,
    ) -> Result<(), ProvisionError> {
        let rule = format!("guestssh,tcp,127.0.0.1,{host_port},,{guest_port}");
        self.run(
            "modifyvm",
            &["modifyvm", handle.name(), "--natpf1", &rule],
        )
        .await?;
        Ok(())
    }

    async fn start(&self, handle: &VmHandle, headless: bool) -> Result<(), ProvisionError> {
        let kind = if headless { "headless" } else { "gui" };
        self.run("startvm", &["startvm", handle.name(), "--type", kind])
            .await?;
        Ok(())
    }

    async fn stop(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        self.run("controlvm", &["controlvm", handle.name(), "poweroff"])
            .await?;
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<String>, ProvisionError> {
        let output = self.run("list vms", &["list", "vms"]).await?;
        Ok(parse_vm_list(&output))
    }

    async fn run_guest_command(
        &self,
        handle: &VmHandle,
        credential: &GuestCredential,
        command: &str,
    ) -> Result<String, ProvisionError> {
        self.run(
            "guestcontrol run",
            &[
                "guestcontrol",
                handle.name(),
                "run",
                "--username",
                credential.username(),
                "--password",
                credential.password(),
                "--wait-stdout",
                "--wait-stderr",
                "--",
                "/bin/sh",
                "-c",
                command,
            ],
        )
        .await
    }
}

/// Parse `VBoxManage list vms` output: one VM per line, `"name" {uuid}`.
/// Unparseable lines are skipped rather than failing the listing.
fn parse_vm_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix('"')?;
            let end = rest.find('"')?;
            Some(rest[..end].to_string())
        })
        .collect()
}
