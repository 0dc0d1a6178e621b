use std::process::Stdio;

use crate::config::ProvisioningConfig;
use crate::error::ProvisionError;

/// Open an interactive SSH session to the provisioned guest through the
/// forwarded port, handing the terminal to the child until it exits.
pub async fn launch_ssh(config: &ProvisioningConfig) -> Result<(), ProvisionError> {
    let port = config.ssh_port.to_string();
    let target = format!("{}@127.0.0.1", config.user);

    println!("Connecting to {target} (port {port})...");

    let status = tokio::process::Command::new("ssh")
        .args([
            "-p",
            &port,
            "-o",
            "StrictHostKeyChecking=accept-new",
            &target,
        ])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| ProvisionError::Io {
            context: "running ssh".into(),
            source: e,
        })?;

    if !status.success() {
        tracing::warn!("ssh exited with {status}");
    }
    Ok(())
}
