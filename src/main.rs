use std::path::PathBuf;

use clap::Parser;
use console::style;
use indicatif::ProgressBar;
use tracing_subscriber::EnvFilter;

use autovm::cli::{Cli, Command};
use autovm::config::{self, ProvisioningConfig};
use autovm::error::ProvisionError;
use autovm::guest;
use autovm::hypervisor::{GuestCredential, Hypervisor, handle_from_name};
use autovm::hypervisor::vboxmanage::VBoxManage;
use autovm::lifecycle::{Orchestrator, ReadinessProbe, RunLock, TcpProbe, WaitPolicy};
use autovm::{answerfile, medium, paths, preflight, session};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("autovm=debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("autovm=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Init creates the config, so handle it before loading one.
    if let Command::Init { defaults } = cli.command {
        return autovm::init::run(defaults, &cli.config).map_err(Into::into);
    }

    let config = config::load(&cli.config)?;

    match cli.command {
        Command::Init { .. } => unreachable!(),
        Command::Preflight => {
            let report = preflight::run(&config).await;
            preflight::print_report(&report);
            if !report.passed() {
                return Err(ProvisionError::Preflight {
                    summary: report.failure_summary(),
                }
                .into());
            }
            println!("{}", style("All preflight checks passed.").green());
        }
        Command::Up {
            reset,
            connect,
            answer_template,
        } => run_up(&config, reset, connect, answer_template).await?,
        Command::Status => run_status(&config).await?,
        Command::Down => {
            let hv = VBoxManage::new()?;
            let handle = handle_from_name(&config.vm_name);
            hv.stop(&handle).await?;
            println!("VM '{}' powered off.", config.vm_name);
        }
        Command::Destroy => run_destroy(&config).await?,
        Command::Ssh => session::launch_ssh(&config).await?,
    }

    Ok(())
}

/// The full provisioning pipeline, strictly sequential.
async fn run_up(
    config: &ProvisioningConfig,
    reset: bool,
    connect: bool,
    answer_template: Option<PathBuf>,
) -> Result<(), ProvisionError> {
    // 1. Preflight gate: nothing mutates until this passes.
    let report = preflight::run(config).await;
    preflight::print_report(&report);
    if !report.passed() {
        return Err(ProvisionError::Preflight {
            summary: report.failure_summary(),
        });
    }

    // 2. One run per VM name at a time.
    let _lock = RunLock::acquire(&config.work_dir, &config.vm_name)?;

    if reset {
        let disk = paths::disk_path(&config.work_dir, &config.vm_name);
        let _ = std::fs::remove_file(&disk);
        let _ = std::fs::remove_file(paths::answer_file_path(&config.work_dir));
        tracing::info!("removed disk and answer file for a fresh install");
    }

    // 3. Installation inputs: medium (download-if-absent) + answer file.
    println!("Ensuring installation medium...");
    let install_medium = medium::ensure_medium(&config.iso_url, &config.work_dir).await?;

    let template = match &answer_template {
        Some(path) => std::fs::read_to_string(path).map_err(|e| ProvisionError::Io {
            context: format!("reading answer template {}", path.display()),
            source: e,
        })?,
        None => answerfile::DEFAULT_TEMPLATE.to_string(),
    };
    let answer_file = answerfile::write_answer_file(
        &config.work_dir,
        &template,
        &answerfile::Credentials {
            username: &config.user,
            user_password: &config.user_password,
            root_password: &config.root_password,
        },
    )?;

    // 4. Create and boot.
    let hv = VBoxManage::new()?;
    let mut orch = Orchestrator::new(&hv, config);

    println!("Creating VM '{}'...", config.vm_name);
    let handle = orch.create(&install_medium, &answer_file).await?;

    println!("Starting unattended install (headless)...");
    orch.boot(&handle).await?;

    // 5. Wait for the guest, with a spinner for the long silence.
    let policy = WaitPolicy::default();
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!(
        "Waiting for the install to finish (up to {} min)...",
        policy.ceiling.as_secs() / 60
    ));
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let mut probe = TcpProbe::new(config.ssh_port);
    let waited = orch.wait_ready(&mut probe, &policy).await;
    spinner.finish_and_clear();
    waited?;
    println!("Guest is reachable on localhost:{}.", config.ssh_port);

    // 6. Guest-side configuration, best-effort per command.
    println!("Configuring guest (networking, packages)...");
    let root = GuestCredential::Root {
        password: config.root_password.clone(),
    };
    let mut commands = guest::network_commands(config);
    commands.extend(guest::package_commands(config));
    let outcomes = guest::run_sequence(&hv, &handle, &root, &commands).await;
    print_outcomes(&outcomes);

    // Confirm the unprivileged account is usable before handing it over.
    let user = GuestCredential::User {
        name: config.user.clone(),
        password: config.user_password.clone(),
    };
    let check = guest::run_sequence(&hv, &handle, &user, &["id".to_string()]).await;
    print_outcomes(&check);
    orch.mark_configured();

    println!(
        "{} ssh -p {} {}@127.0.0.1",
        style("VM is ready. Connect with:").green(),
        config.ssh_port,
        config.user
    );

    if connect {
        session::launch_ssh(config).await?;
    }

    Ok(())
}

fn print_outcomes(outcomes: &[guest::CommandOutcome]) {
    for outcome in outcomes {
        let mark = if outcome.ok {
            style("ok").green()
        } else {
            style("warn").yellow()
        };
        println!("  [{mark:>4}] {}", outcome.command);
        if !outcome.ok {
            println!("         {}", outcome.detail);
        }
    }
    let failed = outcomes.iter().filter(|o| !o.ok).count();
    if failed > 0 {
        println!(
            "{} {failed} command(s) failed; the VM may need manual follow-up.",
            style("note:").yellow()
        );
    }
}

async fn run_status(config: &ProvisioningConfig) -> Result<(), ProvisionError> {
    let name = &config.vm_name;

    let hv = VBoxManage::new()?;
    let registered = hv.list_vms().await?.iter().any(|n| n == name);
    if !registered {
        println!("VM '{name}': not registered");
        return Ok(());
    }

    let mut probe = TcpProbe::new(config.ssh_port);
    if probe.probe().await {
        println!("VM '{name}': registered, ssh answering on localhost:{}", config.ssh_port);
    } else {
        println!("VM '{name}': registered, ssh not answering");
    }
    Ok(())
}

async fn run_destroy(config: &ProvisioningConfig) -> Result<(), ProvisionError> {
    let name = &config.vm_name;
    let hv = VBoxManage::new()?;

    let mut had_vm = false;
    if hv.list_vms().await?.iter().any(|n| n == name) {
        had_vm = true;
        let handle = handle_from_name(name);
        // A running VM cannot be unregistered; stop it first, ignoring
        // the error when it is already off.
        let _ = hv.stop(&handle).await;
        hv.destroy_vm(&handle).await?;
    }

    let mut had_artifacts = false;
    if config.work_dir.exists() {
        had_artifacts = true;
        tokio::fs::remove_dir_all(&config.work_dir)
            .await
            .map_err(|e| ProvisionError::Io {
                context: format!("removing {}", config.work_dir.display()),
                source: e,
            })?;
    }

    match (had_vm, had_artifacts) {
        (true, _) => println!("VM '{name}' destroyed."),
        (false, true) => println!("Removed artifacts for '{name}'."),
        (false, false) => println!("VM '{name}' not found — nothing to destroy."),
    }
    Ok(())
}
