//! Environment validation run before any mutating action.
//!
//! Every check is independent and infallible: a check that cannot gather
//! its information downgrades to a failed (or, for the advisory check,
//! warning) `CheckResult` and the remaining checks still run. The overall
//! verdict is the AND of all non-advisory results.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;
use std::time::Duration;

use console::style;

use crate::config::ProvisioningConfig;
use crate::hypervisor::vboxmanage;

/// Minimum free disk space at the work directory's volume.
const MIN_FREE_BYTES: u64 = 25 * 1024 * 1024 * 1024;

/// Headroom the host must keep beyond the VM's requested memory.
const MEMORY_HEADROOM_MB: u64 = 2048;

/// Connect timeout for the image-host reachability probe.
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    /// Advisory checks warn but never fail the overall verdict.
    pub advisory: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            advisory: false,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            advisory: false,
            detail: detail.into(),
        }
    }

    fn advisory(self) -> Self {
        Self {
            advisory: true,
            ..self
        }
    }
}

/// Ordered results of one preflight run.
#[derive(Debug)]
pub struct PreflightReport {
    pub results: Vec<CheckResult>,
}

impl PreflightReport {
    /// The AND-gate: false iff any non-advisory check failed.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.advisory || r.passed)
    }

    /// One-line summary of the failed non-advisory checks.
    pub fn failure_summary(&self) -> String {
        let failed: Vec<&str> = self
            .results
            .iter()
            .filter(|r| !r.advisory && !r.passed)
            .map(|r| r.name)
            .collect();
        failed.join(", ")
    }
}

/// Run all preflight checks against the host environment.
pub async fn run(config: &ProvisioningConfig) -> PreflightReport {
    let results = vec![
        check_hypervisor_tool(),
        check_completeness(config),
        check_image_host_reachable(&config.iso_url).await,
        check_disk_space(&config.work_dir),
        check_memory(config.memory_mb),
        check_ssh_port_free(config.ssh_port),
        check_virtualization_conflict().advisory(),
    ];
    PreflightReport { results }
}

/// Print the report to stdout, one styled line per check.
pub fn print_report(report: &PreflightReport) {
    for r in &report.results {
        let mark = if r.passed {
            style("ok").green()
        } else if r.advisory {
            style("warn").yellow()
        } else {
            style("FAIL").red()
        };
        println!("[{mark:>4}] {:<24} {}", r.name, r.detail);
    }
}

// ── individual checks ───────────────────────────────────────────────

fn check_hypervisor_tool() -> CheckResult {
    const NAME: &str = "hypervisor tool";
    match vboxmanage::locate() {
        Some(path) => CheckResult::pass(NAME, format!("found {}", path.display())),
        None => CheckResult::fail(
            NAME,
            "VBoxManage not found in well-known install locations or PATH",
        ),
    }
}

fn check_completeness(config: &ProvisioningConfig) -> CheckResult {
    const NAME: &str = "config completeness";
    let mut missing = Vec::new();
    if config.vm_name.is_empty() {
        missing.push("VM_NAME");
    }
    if config.user.is_empty() {
        missing.push("VM_USER");
    }
    if config.user_password.is_empty() {
        missing.push("VM_PASSWORD");
    }
    if config.static_ip.is_empty() {
        missing.push("VM_STATIC_IP");
    }
    if missing.is_empty() {
        CheckResult::pass(NAME, "all required values present")
    } else {
        CheckResult::fail(NAME, format!("missing: {}", missing.join(", ")))
    }
}

async fn check_image_host_reachable(iso_url: &str) -> CheckResult {
    const NAME: &str = "image host reachable";
    let Some(host) = url_host(iso_url) else {
        return CheckResult::fail(NAME, format!("cannot parse host from ISO_URL '{iso_url}'"));
    };

    let connect = tokio::net::TcpStream::connect((host.as_str(), 80u16));
    match tokio::time::timeout(REACHABILITY_TIMEOUT, connect).await {
        Ok(Ok(_)) => CheckResult::pass(NAME, format!("{host}:80 answers")),
        Ok(Err(e)) => CheckResult::fail(NAME, format!("{host}:80 unreachable: {e}")),
        Err(_) => CheckResult::fail(
            NAME,
            format!(
                "{host}:80 unreachable: no answer within {}s",
                REACHABILITY_TIMEOUT.as_secs()
            ),
        ),
    }
}

fn check_disk_space(work_dir: &Path) -> CheckResult {
    const NAME: &str = "free disk space";
    // The work dir may not exist yet on a first run; its volume can't be
    // queried, so fall back to the current one.
    let probe_path = if work_dir.exists() {
        work_dir
    } else {
        Path::new(".")
    };

    match free_space(probe_path) {
        Ok(free) => {
            let free_gib = free / (1024 * 1024 * 1024);
            if free >= MIN_FREE_BYTES {
                CheckResult::pass(NAME, format!("{free_gib} GiB free"))
            } else {
                CheckResult::fail(
                    NAME,
                    format!(
                        "{free_gib} GiB free, need {} GiB",
                        MIN_FREE_BYTES / (1024 * 1024 * 1024)
                    ),
                )
            }
        }
        Err(e) => CheckResult::fail(NAME, format!("cannot query volume: {e}")),
    }
}

fn check_memory(requested_mb: u64) -> CheckResult {
    const NAME: &str = "physical memory";
    let needed_mb = requested_mb + MEMORY_HEADROOM_MB;
    match total_memory_mb() {
        Some(total_mb) if total_mb >= needed_mb => {
            CheckResult::pass(NAME, format!("{total_mb} MB total, {needed_mb} MB needed"))
        }
        Some(total_mb) => CheckResult::fail(
            NAME,
            format!("{total_mb} MB total, need {needed_mb} MB (VM + headroom)"),
        ),
        None => CheckResult::pass(NAME, "cannot determine on this platform, skipping"),
    }
}

fn check_ssh_port_free(port: u16) -> CheckResult {
    const NAME: &str = "ssh forward port";
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr) {
        Ok(_) => CheckResult::pass(NAME, format!("localhost:{port} is free")),
        Err(e) => CheckResult::fail(NAME, format!("localhost:{port} already bound: {e}")),
    }
}

fn check_virtualization_conflict() -> CheckResult {
    const NAME: &str = "virtualization conflict";
    let modules = std::fs::read_to_string("/proc/modules").unwrap_or_default();
    match conflicting_kvm_module(&modules) {
        Some(module) => CheckResult::fail(
            NAME,
            format!("{module} is loaded and may hold VT-x/AMD-V; VM may fall back to software virtualization"),
        ),
        None => CheckResult::pass(NAME, "no conflicting hypervisor module loaded"),
    }
}

// ── host probing helpers ────────────────────────────────────────────

/// Extract the host component from an http(s) URL without a URL crate:
/// strip the scheme, cut at the first `/`, drop any port or userinfo.
fn url_host(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split('/').next()?;
    let host = authority
        .rsplit('@')
        .next()?
        .split(':')
        .next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Free bytes available to unprivileged users on the volume holding `path`.
#[cfg(target_family = "unix")]
fn free_space(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs is a plain C struct of integers, zero is a valid
    // initial value; the call writes into it through a valid pointer.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(target_family = "unix"))]
fn free_space(_path: &Path) -> std::io::Result<u64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "free-space query not supported on this platform",
    ))
}

fn total_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total_kb(&meminfo).map(|kb| kb / 1024)
}

/// Parse the `MemTotal:` line of /proc/meminfo, in kB.
fn parse_meminfo_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// First loaded kvm module found in /proc/modules text, if any.
fn conflicting_kvm_module(modules: &str) -> Option<&'static str> {
    for candidate in ["kvm_intel", "kvm_amd"] {
        if modules
            .lines()
            .any(|l| l.split_whitespace().next() == Some(candidate))
        {
            return Some(candidate);
        }
    }
    None
}
