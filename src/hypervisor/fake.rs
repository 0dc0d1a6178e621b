//! In-memory scripted hypervisor for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use super::{GuestCredential, Hypervisor, MediaKind, VmHandle, VmSpec, handle_from_name};
use crate::error::ProvisionError;

#[derive(Default)]
struct FakeState {
    vms: Vec<String>,
    /// Scripted results for run_guest_command, consumed front to back.
    /// When exhausted, commands succeed with empty output.
    guest_results: VecDeque<Result<String, String>>,
    /// Flat log of every operation, for asserting call order.
    ops: Vec<String>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a VM, as if left over from an earlier run.
    pub fn with_existing_vm(self, name: &str) -> Self {
        self.state.lock().unwrap().vms.push(name.to_string());
        self
    }

    /// Script the next guest-command results, in order.
    pub fn script_guest_results(&self, results: Vec<Result<String, String>>) {
        self.state.lock().unwrap().guest_results.extend(results);
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.state.lock().unwrap().vms.clone()
    }

    fn log(&self, op: String) {
        self.state.lock().unwrap().ops.push(op);
    }
}

impl Hypervisor for FakeHypervisor {
    async fn create_vm(&self, spec: &VmSpec) -> Result<VmHandle, ProvisionError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("create {}", spec.name));
        if state.vms.contains(&spec.name) {
            return Err(ProvisionError::Hypervisor {
                operation: "createvm".into(),
                detail: format!("machine '{}' already exists", spec.name),
            });
        }
        state.vms.push(spec.name.clone());
        Ok(handle_from_name(&spec.name))
    }

    async fn destroy_vm(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("destroy {}", handle.name()));
        let before = state.vms.len();
        state.vms.retain(|n| n != handle.name());
        if state.vms.len() == before {
            return Err(ProvisionError::Hypervisor {
                operation: "unregistervm".into(),
                detail: format!("no machine named '{}'", handle.name()),
            });
        }
        Ok(())
    }

    async fn attach_disk(
        &self,
        handle: &VmHandle,
        path: &Path,
        size_mb: u64,
    ) -> Result<(), ProvisionError> {
        self.log(format!(
            "attach-disk {} {} {size_mb}",
            handle.name(),
            path.display()
        ));
        Ok(())
    }

    async fn attach_removable_media(
        &self,
        handle: &VmHandle,
        path: &Path,
        kind: MediaKind,
    ) -> Result<(), ProvisionError> {
        self.log(format!(
            "attach-media {} {} {kind:?}",
            handle.name(),
            path.display()
        ));
        Ok(())
    }

    async fn configure_network_adapter(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        self.log(format!("configure-network {}", handle.name()));
        Ok(())
    }

    async fn configure_port_forward(
        &self,
        handle: &VmHandle,
        host_port: u16,
        guest_port: u16,
    ) -> Result<(), ProvisionError> {
        self.log(format!(
            "port-forward {} {host_port}->{guest_port}",
            handle.name()
        ));
        Ok(())
    }

    async fn start(&self, handle: &VmHandle, headless: bool) -> Result<(), ProvisionError> {
        self.log(format!("start {} headless={headless}", handle.name()));
        Ok(())
    }

    async fn stop(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        self.log(format!("stop {}", handle.name()));
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<String>, ProvisionError> {
        Ok(self.state.lock().unwrap().vms.clone())
    }

    async fn run_guest_command(
        &self,
        handle: &VmHandle,
        _credential: &GuestCredential,
        command: &str,
    ) -> Result<String, ProvisionError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("guest {} {command}", handle.name()));
        match state.guest_results.pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(detail)) => Err(ProvisionError::Hypervisor {
                operation: "guestcontrol run".into(),
                detail,
            }),
            None => Ok(String::new()),
        }
    }
}
