//! VM lifecycle state machine.
//!
//! `VmState` tracks where the single VM of a run is in its lifecycle.
//! Transitions only move forward; the one exception is the destructive
//! destroy-before-create reset back to `Absent` that makes re-runs
//! idempotent. The orchestrator drives a strictly sequential pipeline:
//! every step is a full barrier before the next begins.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ProvisioningConfig;
use crate::error::ProvisionError;
use crate::hypervisor::{Hypervisor, MediaKind, VmHandle, VmSpec, handle_from_name};
use crate::paths;

/// Guest port the forwarded SSH rule targets.
const GUEST_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No VM registered under this name.
    Absent,
    /// Registered and configured, media attached, never started.
    Created,
    /// Start issued, firmware/installer boot underway.
    Booting,
    /// Unattended install running. No observable signal besides time.
    InstallInProgress,
    /// The forwarded SSH port answered twice across the grace period.
    GuestReachable,
    /// Guest-side configuration commands have been executed.
    Configured,
    /// A fatal error stopped the pipeline.
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Absent => "absent",
            VmState::Created => "created",
            VmState::Booting => "booting",
            VmState::InstallInProgress => "install-in-progress",
            VmState::GuestReachable => "guest-reachable",
            VmState::Configured => "configured",
            VmState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── readiness probing ───────────────────────────────────────────────

/// A single connectivity observation against the guest's readiness signal.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ReadinessProbe {
    async fn probe(&mut self) -> bool;
}

/// Probes the forwarded SSH port on localhost. The sole readiness signal
/// available before any agent exists in the guest.
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(ssh_port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], ssh_port)),
            timeout: Duration::from_secs(5),
        }
    }
}

impl ReadinessProbe for TcpProbe {
    async fn probe(&mut self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Timing of the install-completion wait loop.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub ceiling: Duration,
    pub grace: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            ceiling: Duration::from_secs(2400),
            grace: Duration::from_secs(60),
        }
    }
}

/// Poll until the guest answers, debounced across a one-time grace period.
///
/// The port can open transiently while the installer is still finalizing
/// services, so a single successful probe is not readiness: after the
/// first success, wait `grace` once without re-polling, then require one
/// more success. A failed probe before the ceiling is the normal waiting
/// condition, not an error; exceeding the ceiling is a fatal timeout.
pub async fn wait_for_guest<P: ReadinessProbe>(
    probe: &mut P,
    policy: &WaitPolicy,
) -> Result<(), ProvisionError> {
    let deadline = tokio::time::Instant::now() + policy.ceiling;
    let mut port_seen = false;

    loop {
        if probe.probe().await {
            if port_seen {
                return Ok(());
            }
            tracing::info!(
                grace_secs = policy.grace.as_secs(),
                "port answered, waiting for install to finalize"
            );
            port_seen = true;
            tokio::time::sleep(policy.grace).await;
            continue;
        }

        if tokio::time::Instant::now() + policy.poll_interval > deadline {
            return Err(ProvisionError::InstallTimeout {
                waited_secs: policy.ceiling.as_secs(),
            });
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}

// ── run lock ────────────────────────────────────────────────────────

/// Advisory lock file keyed by VM name. A second run against the same
/// name fails fast instead of racing the destroy/create sequence.
/// Released on drop; a crashed run leaves the file behind, which the
/// error message points at.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(work_dir: &Path, vm_name: &str) -> Result<Self, ProvisionError> {
        std::fs::create_dir_all(work_dir).map_err(|e| ProvisionError::Io {
            context: format!("creating directory {}", work_dir.display()),
            source: e,
        })?;

        let path = paths::lock_path(work_dir, vm_name);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ProvisionError::LockHeld {
                    path: path.display().to_string(),
                })
            }
            Err(e) => Err(ProvisionError::Io {
                context: format!("creating lock file {}", path.display()),
                source: e,
            }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ── orchestrator ────────────────────────────────────────────────────

/// Drives one VM through `Absent → Created → Booting → InstallInProgress
/// → GuestReachable`. Holds the handle by reference only; all hypervisor
/// state changes go through the client.
pub struct Orchestrator<'a, H: Hypervisor> {
    hv: &'a H,
    config: &'a ProvisioningConfig,
    state: VmState,
}

impl<'a, H: Hypervisor> Orchestrator<'a, H> {
    pub fn new(hv: &'a H, config: &'a ProvisioningConfig) -> Self {
        Self {
            hv,
            config,
            state: VmState::Absent,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    fn advance(&mut self, next: VmState) {
        tracing::info!(from = %self.state, to = %next, "vm state");
        self.state = next;
    }

    fn fail<T>(&mut self, err: ProvisionError) -> Result<T, ProvisionError> {
        self.advance(VmState::Failed);
        Err(err)
    }

    /// `Absent → Created`: destroy any stale VM of the same name, then
    /// create, configure hardware and networking, and attach the disk
    /// plus install and answer media.
    pub async fn create(
        &mut self,
        install_medium: &Path,
        answer_file: &Path,
    ) -> Result<VmHandle, ProvisionError> {
        let config = self.config;

        // Destroy-before-create: create_vm is not atomic on a name
        // collision, and a leftover VM would carry a stale spec.
        let existing = match self.hv.list_vms().await {
            Ok(names) => names,
            Err(e) => return self.fail(e),
        };
        if existing.iter().any(|n| n == &config.vm_name) {
            tracing::info!(name = %config.vm_name, "destroying stale VM before create");
            let stale = handle_from_name(&config.vm_name);
            if let Err(e) = self.hv.destroy_vm(&stale).await {
                return self.fail(e);
            }
        }

        let spec = VmSpec {
            name: config.vm_name.clone(),
            memory_mb: config.memory_mb,
            cpus: config.cpus,
        };

        let result: Result<VmHandle, ProvisionError> = async {
            let handle = self.hv.create_vm(&spec).await?;
            self.hv.configure_network_adapter(&handle).await?;
            self.hv
                .configure_port_forward(&handle, config.ssh_port, GUEST_SSH_PORT)
                .await?;
            let disk = paths::disk_path(&config.work_dir, &config.vm_name);
            self.hv.attach_disk(&handle, &disk, config.disk_mb).await?;
            self.hv
                .attach_removable_media(&handle, install_medium, MediaKind::Dvd)
                .await?;
            self.hv
                .attach_removable_media(&handle, answer_file, MediaKind::Floppy)
                .await?;
            Ok(handle)
        }
        .await;

        match result {
            Ok(handle) => {
                self.advance(VmState::Created);
                Ok(handle)
            }
            Err(e) => self.fail(e),
        }
    }

    /// `Created → Booting → InstallInProgress`: start headless. There is
    /// no install-progress signal; time in this state is all we observe.
    pub async fn boot(&mut self, handle: &VmHandle) -> Result<(), ProvisionError> {
        if let Err(e) = self.hv.start(handle, true).await {
            return self.fail(e);
        }
        self.advance(VmState::Booting);
        self.advance(VmState::InstallInProgress);
        Ok(())
    }

    /// `InstallInProgress → GuestReachable` via the debounced poll loop.
    pub async fn wait_ready<P: ReadinessProbe>(
        &mut self,
        probe: &mut P,
        policy: &WaitPolicy,
    ) -> Result<(), ProvisionError> {
        match wait_for_guest(probe, policy).await {
            Ok(()) => {
                self.advance(VmState::GuestReachable);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// `GuestReachable → Configured`. The caller runs the guest command
    /// sequence in between; the transition only records that it happened
    /// (individual command failures are outcomes, not fatal errors).
    pub fn mark_configured(&mut self) {
        self.advance(VmState::Configured);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::hypervisor::fake::FakeHypervisor;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        results: VecDeque<bool>,
    }

    impl ScriptedProbe {
        fn new(results: &[bool]) -> Self {
            Self {
                results: results.iter().copied().collect(),
            }
        }
    }

    impl ReadinessProbe for ScriptedProbe {
        async fn probe(&mut self) -> bool {
            // Past the scripted window the port stays in its final state.
            match self.results.len() {
                0 => false,
                1 => *self.results.front().unwrap(),
                _ => self.results.pop_front().unwrap(),
            }
        }
    }

    fn policy() -> WaitPolicy {
        WaitPolicy::default()
    }

    // ── create ──

    #[tokio::test]
    async fn create_registers_configures_and_attaches() {
        let config = test_config();
        let hv = FakeHypervisor::new();
        let mut orch = Orchestrator::new(&hv, &config);

        let handle = orch
            .create(Path::new("/work/netinst.iso"), Path::new("/work/preseed.cfg"))
            .await
            .unwrap();

        assert_eq!(handle.name(), "debian-vm");
        assert_eq!(orch.state(), VmState::Created);
        assert_eq!(hv.vm_names(), vec!["debian-vm"]);

        let ops = hv.ops();
        assert_eq!(ops[0], "create debian-vm");
        assert!(ops[1].starts_with("configure-network"));
        assert!(ops[2].starts_with("port-forward debian-vm 2222->22"));
        assert!(ops[3].starts_with("attach-disk"));
        assert!(ops[4].contains("netinst.iso"));
        assert!(ops[5].contains("preseed.cfg"));
    }

    #[tokio::test]
    async fn create_destroys_stale_vm_first() {
        let config = test_config();
        let hv = FakeHypervisor::new().with_existing_vm("debian-vm");
        let mut orch = Orchestrator::new(&hv, &config);

        orch.create(Path::new("/i.iso"), Path::new("/a.cfg"))
            .await
            .unwrap();

        // Exactly one VM exists afterwards, carrying the latest spec.
        assert_eq!(hv.vm_names(), vec!["debian-vm"]);
        let ops = hv.ops();
        assert_eq!(ops[0], "destroy debian-vm");
        assert_eq!(ops[1], "create debian-vm");
    }

    #[tokio::test]
    async fn create_twice_leaves_one_vm() {
        let config = test_config();
        let hv = FakeHypervisor::new();

        let mut first = Orchestrator::new(&hv, &config);
        first
            .create(Path::new("/i.iso"), Path::new("/a.cfg"))
            .await
            .unwrap();

        let mut second = Orchestrator::new(&hv, &config);
        second
            .create(Path::new("/i.iso"), Path::new("/a.cfg"))
            .await
            .unwrap();

        assert_eq!(hv.vm_names(), vec!["debian-vm"]);
    }

    #[tokio::test]
    async fn boot_moves_through_booting_to_install() {
        let config = test_config();
        let hv = FakeHypervisor::new();
        let mut orch = Orchestrator::new(&hv, &config);
        let handle = orch
            .create(Path::new("/i.iso"), Path::new("/a.cfg"))
            .await
            .unwrap();

        orch.boot(&handle).await.unwrap();
        assert_eq!(orch.state(), VmState::InstallInProgress);
        assert!(hv.ops().last().unwrap().contains("headless=true"));
    }

    // ── wait_for_guest timing (paused clock) ──

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out_at_ceiling() {
        let mut probe = ScriptedProbe::new(&[false]);
        let start = tokio::time::Instant::now();
        let err = wait_for_guest(&mut probe, &policy()).await.unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::InstallTimeout { waited_secs: 2400 }
        ));
        // Timeout fires after exactly the ceiling of simulated time.
        assert_eq!(start.elapsed(), Duration::from_secs(2400));
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_requires_second_success_after_grace() {
        // [fail, fail, success, success]: ready only on the second
        // success, with the grace delay observed between them.
        let mut probe = ScriptedProbe::new(&[false, false, true, true]);
        let start = tokio::time::Instant::now();
        wait_for_guest(&mut probe, &policy()).await.unwrap();

        // 2 failed polls (30s each) + grace (60s) = 120s.
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_success_does_not_declare_ready() {
        // Port opens transiently once, then closes again for good.
        let mut probe = ScriptedProbe::new(&[true, false]);
        let err = wait_for_guest(&mut probe, &policy()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InstallTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_port_reopens_after_grace() {
        // Success, grace, a dip, then stable: declared ready on the next
        // success without a second grace wait.
        let mut probe = ScriptedProbe::new(&[true, false, true]);
        let start = tokio::time::Instant::now();
        wait_for_guest(&mut probe, &policy()).await.unwrap();
        // grace (60s) + one failed poll (30s) = 90s.
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_failure_marks_failed() {
        let config = test_config();
        let hv = FakeHypervisor::new();
        let mut orch = Orchestrator::new(&hv, &config);
        let mut probe = ScriptedProbe::new(&[false]);

        let err = orch.wait_ready(&mut probe, &policy()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InstallTimeout { .. }));
        assert_eq!(orch.state(), VmState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_success_reaches_guest_reachable() {
        let config = test_config();
        let hv = FakeHypervisor::new();
        let mut orch = Orchestrator::new(&hv, &config);
        let mut probe = ScriptedProbe::new(&[true, true]);

        orch.wait_ready(&mut probe, &policy()).await.unwrap();
        assert_eq!(orch.state(), VmState::GuestReachable);
    }

    // ── run lock ──

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let _held = RunLock::acquire(dir.path(), "vm").unwrap();
        let err = RunLock::acquire(dir.path(), "vm").unwrap_err();
        assert!(matches!(err, ProvisionError::LockHeld { .. }));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _held = RunLock::acquire(dir.path(), "vm").unwrap();
        }
        RunLock::acquire(dir.path(), "vm").unwrap();
    }

    #[test]
    fn locks_are_keyed_by_vm_name() {
        let dir = tempfile::tempdir().unwrap();
        let _a = RunLock::acquire(dir.path(), "vm-a").unwrap();
        RunLock::acquire(dir.path(), "vm-b").unwrap();
    }
}
