//! Post-install configuration inside the guest, over the hypervisor's
//! guest-exec channel.
//!
//! The sequence is deliberately best-effort: the command scripts contain
//! idempotent steps that may no-op or warn on a re-run (a package already
//! installed, an interface already up). A failed command is recorded as a
//! failed outcome and the sequence continues; nothing is re-run and
//! nothing aborts early. Callers introspect the outcome list instead of
//! guessing from final-state side effects.

use crate::config::ProvisioningConfig;
use crate::error::ProvisionError;
use crate::hypervisor::{GuestCredential, Hypervisor, VmHandle};

/// Per-command result of a guest command sequence.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub ok: bool,
    pub detail: String,
}

/// Execute `commands` strictly in order under `credential`, one outcome
/// per command. Transport errors are downgraded to failed outcomes here,
/// the only place in the pipeline where a hypervisor error is non-fatal.
pub async fn run_sequence<H: Hypervisor>(
    hv: &H,
    handle: &VmHandle,
    credential: &GuestCredential,
    commands: &[String],
) -> Vec<CommandOutcome> {
    let mut outcomes = Vec::with_capacity(commands.len());

    for command in commands {
        match hv.run_guest_command(handle, credential, command).await {
            Ok(output) => {
                tracing::debug!(%command, "guest command ok");
                outcomes.push(CommandOutcome {
                    command: command.clone(),
                    ok: true,
                    detail: output.trim().to_string(),
                });
            }
            Err(e) => {
                let detail = match &e {
                    ProvisionError::Hypervisor { detail, .. } => detail.clone(),
                    other => other.to_string(),
                };
                tracing::warn!(%command, error = %detail, "guest command failed, continuing");
                outcomes.push(CommandOutcome {
                    command: command.clone(),
                    ok: false,
                    detail,
                });
            }
        }
    }

    outcomes
}

/// Commands that bring up the static IP on the guest's host-only
/// interface. Run as root.
pub fn network_commands(config: &ProvisioningConfig) -> Vec<String> {
    let ip = &config.static_ip;
    let stanza = format!(
        "auto enp0s8\\niface enp0s8 inet static\\n    address {ip}\\n    netmask 255.255.255.0"
    );
    vec![
        "mkdir -p /etc/network/interfaces.d".to_string(),
        format!("printf '{stanza}\\n' > /etc/network/interfaces.d/enp0s8"),
        "ifup enp0s8".to_string(),
    ]
}

/// Commands that install the base package set. Run as root; each step is
/// safe to repeat.
pub fn package_commands(config: &ProvisioningConfig) -> Vec<String> {
    vec![
        "apt-get update".to_string(),
        "apt-get install -y --no-install-recommends sudo openssh-server curl ca-certificates"
            .to_string(),
        format!("usermod -aG sudo {}", config.user),
        "systemctl enable --now ssh".to_string(),
    ]
}
