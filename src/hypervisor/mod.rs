//! Abstraction over the external hypervisor control tool.
//!
//! Two implementations: [`vboxmanage::VBoxManage`] shells out to the real
//! CLI, and the test-only scripted fake makes the orchestrator's state
//! machine unit-testable without a hypervisor installed.

pub mod vboxmanage;

#[cfg(test)]
pub mod fake;

use std::path::Path;

use crate::error::ProvisionError;

/// Opaque identifier correlating a logical VM to the hypervisor's own
/// bookkeeping. Only the hypervisor client creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle(String);

impl VmHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware description for a new VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub memory_mb: u64,
    pub cpus: u32,
}

/// Which guest account executes a command over the guest-exec channel.
#[derive(Debug, Clone)]
pub enum GuestCredential {
    Root { password: String },
    User { name: String, password: String },
}

impl GuestCredential {
    pub fn username(&self) -> &str {
        match self {
            GuestCredential::Root { .. } => "root",
            GuestCredential::User { name, .. } => name,
        }
    }

    pub fn password(&self) -> &str {
        match self {
            GuestCredential::Root { password } => password,
            GuestCredential::User { password, .. } => password,
        }
    }
}

/// Kind of removable medium to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Installation DVD image.
    Dvd,
    /// Answer-file floppy image for the unattended installer.
    Floppy,
}

/// Capability surface of the external hypervisor CLI. Every operation is
/// one (or a short fixed series of) synchronous subprocess invocation(s);
/// a non-zero exit surfaces as [`ProvisionError::Hypervisor`] carrying the
/// tool's raw diagnostic text.
///
/// `create_vm` on an already-registered name is NOT atomic: callers must
/// destroy a same-named VM first (the orchestrator's destroy-before-create
/// step).
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Hypervisor {
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmHandle, ProvisionError>;
    async fn destroy_vm(&self, handle: &VmHandle) -> Result<(), ProvisionError>;
    async fn attach_disk(
        &self,
        handle: &VmHandle,
        path: &Path,
        size_mb: u64,
    ) -> Result<(), ProvisionError>;
    async fn attach_removable_media(
        &self,
        handle: &VmHandle,
        path: &Path,
        kind: MediaKind,
    ) -> Result<(), ProvisionError>;
    async fn configure_network_adapter(&self, handle: &VmHandle) -> Result<(), ProvisionError>;
    async fn configure_port_forward(
        &self,
        handle: &VmHandle,
        host_port: u16,
        guest_port: u16,
    ) -> Result<(), ProvisionError>;
    async fn start(&self, handle: &VmHandle, headless: bool) -> Result<(), ProvisionError>;
    async fn stop(&self, handle: &VmHandle) -> Result<(), ProvisionError>;
    async fn list_vms(&self) -> Result<Vec<String>, ProvisionError>;
    async fn run_guest_command(
        &self,
        handle: &VmHandle,
        credential: &GuestCredential,
        command: &str,
    ) -> Result<String, ProvisionError>;
}

/// Build a handle for a VM known to exist under `name` (listing, teardown).
/// Provisioning code receives its handle from `create_vm` instead.
pub fn handle_from_name(name: &str) -> VmHandle {
    VmHandle(name.to_string())
}
