use std::path::Path;

use inquire::{Confirm, CustomType, Text};

use crate::error::ProvisionError;

struct StarterConfig {
    vm_name: String,
    memory_mb: u64,
    disk_mb: u64,
    cpus: u32,
    static_ip: String,
    ssh_port: u16,
    user: String,
    user_password: String,
    root_password: String,
    iso_url: String,
}

const DEFAULT_ISO_URL: &str =
    "https://cdimage.debian.org/debian-cd/current/amd64/iso-cd/debian-13.1.0-amd64-netinst.iso";

/// Write a starter config file, interactively or from defaults.
pub fn run(defaults: bool, output_path: &Path) -> Result<(), ProvisionError> {
    if output_path.exists() {
        if defaults {
            return Err(ProvisionError::Validation {
                message: format!(
                    "{} already exists (use interactive mode to overwrite)",
                    output_path.display()
                ),
            });
        }
        let overwrite = Confirm::new(&format!(
            "{} already exists. Overwrite?",
            output_path.display()
        ))
        .with_default(false)
        .prompt()
        .map_err(map_inquire_err)?;
        if !overwrite {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let config = if defaults {
        default_config()
    } else {
        prompt_config()?
    };

    std::fs::write(output_path, generate_env(&config)).map_err(|e| ProvisionError::Io {
        context: format!("writing {}", output_path.display()),
        source: e,
    })?;

    println!("Created {}", output_path.display());
    println!("Run `autovm preflight` to validate the environment, then `autovm up`.");
    Ok(())
}

fn default_config() -> StarterConfig {
    StarterConfig {
        vm_name: "debian-vm".into(),
        memory_mb: 2048,
        disk_mb: 25000,
        cpus: 2,
        static_ip: "192.168.56.10".into(),
        ssh_port: 2222,
        user: "dev".into(),
        user_password: "changeme".into(),
        root_password: "changeme".into(),
        iso_url: DEFAULT_ISO_URL.into(),
    }
}

fn prompt_config() -> Result<StarterConfig, ProvisionError> {
    let d = default_config();

    let vm_name = Text::new("VM name:")
        .with_default(&d.vm_name)
        .prompt()
        .map_err(map_inquire_err)?;

    let memory_mb: u64 = CustomType::new("Memory (MB):")
        .with_default(d.memory_mb)
        .with_error_message("Please enter a valid number")
        .prompt()
        .map_err(map_inquire_err)?;

    let disk_mb: u64 = CustomType::new("Disk size (MB):")
        .with_default(d.disk_mb)
        .with_error_message("Please enter a valid number")
        .prompt()
        .map_err(map_inquire_err)?;

    let cpus: u32 = CustomType::new("CPUs:")
        .with_default(d.cpus)
        .with_error_message("Please enter a valid number")
        .prompt()
        .map_err(map_inquire_err)?;

    let static_ip = Text::new("Guest static IP:")
        .with_default(&d.static_ip)
        .prompt()
        .map_err(map_inquire_err)?;

    let ssh_port: u16 = CustomType::new("Host SSH forward port:")
        .with_default(d.ssh_port)
        .with_error_message("Please enter a valid port")
        .prompt()
        .map_err(map_inquire_err)?;

    let user = Text::new("Guest username:")
        .with_default(&d.user)
        .prompt()
        .map_err(map_inquire_err)?;

    let user_password = Text::new("Guest user password:")
        .with_default(&d.user_password)
        .prompt()
        .map_err(map_inquire_err)?;

    let root_password = Text::new("Guest root password:")
        .with_default(&d.root_password)
        .prompt()
        .map_err(map_inquire_err)?;

    let iso_url = Text::new("Installer ISO URL:")
        .with_default(&d.iso_url)
        .prompt()
        .map_err(map_inquire_err)?;

    Ok(StarterConfig {
        vm_name,
        memory_mb,
        disk_mb,
        cpus,
        static_ip,
        ssh_port,
        user,
        user_password,
        root_password,
        iso_url,
    })
}

fn generate_env(config: &StarterConfig) -> String {
    format!(
        "# autovm provisioning config\n\
         VM_NAME={}\n\
         VM_MEMORY={}\n\
         VM_DISK_SIZE={}\n\
         VM_CPUS={}\n\
         VM_STATIC_IP={}\n\
         VM_SSH_PORT={}\n\
         VM_USER={}\n\
         VM_PASSWORD={}\n\
         VM_ROOT_PASSWORD={}\n\
         # WORK_DIR defaults to the per-VM data directory when unset\n\
         ISO_URL={}\n",
        config.vm_name,
        config.memory_mb,
        config.disk_mb,
        config.cpus,
        config.static_ip,
        config.ssh_port,
        config.user,
        config.user_password,
        config.root_password,
        config.iso_url,
    )
}

fn map_inquire_err(e: inquire::InquireError) -> ProvisionError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            ProvisionError::Cancelled
        }
        other => ProvisionError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}
