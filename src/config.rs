use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;
use crate::paths;

/// Keys recognized in the flat `KEY=value` config file.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "VM_NAME",
    "VM_MEMORY",
    "VM_DISK_SIZE",
    "VM_CPUS",
    "VM_STATIC_IP",
    "VM_SSH_PORT",
    "VM_USER",
    "VM_PASSWORD",
    "VM_ROOT_PASSWORD",
    "WORK_DIR",
    "ISO_URL",
];

const DEFAULT_SSH_PORT: u16 = 2222;

/// Immutable, fully typed provisioning configuration.
///
/// Built once from the config file and never mutated. Numeric fields are
/// parsed at load time so a malformed value fails here instead of halfway
/// through a provisioning run. String credentials may still be empty at
/// this point; the preflight completeness check reports those.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub vm_name: String,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub cpus: u32,
    pub static_ip: String,
    pub ssh_port: u16,
    pub user: String,
    pub user_password: String,
    pub root_password: String,
    pub work_dir: PathBuf,
    pub iso_url: String,
}

/// Parse the flat key=value format: one entry per line, `#` lines and
/// blank lines ignored, first `=` splits key from value, surrounding
/// whitespace trimmed on both sides.
pub fn parse_env(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    map
}

pub fn load(path: &Path) -> Result<ProvisioningConfig, ProvisionError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProvisionError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let map = parse_env(&contents);
    for key in map.keys() {
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            tracing::warn!(key, "unrecognized config key ignored");
        }
    }

    let config = from_map(&map)?;
    validate(&config)?;
    Ok(config)
}

fn from_map(map: &BTreeMap<String, String>) -> Result<ProvisioningConfig, ProvisionError> {
    let string = |key: &str| map.get(key).cloned().unwrap_or_default();

    let vm_name = string("VM_NAME");
    let work_dir = match map.get("WORK_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => paths::default_work_dir(&vm_name),
    };

    Ok(ProvisioningConfig {
        memory_mb: required_u64(map, "VM_MEMORY")?,
        disk_mb: required_u64(map, "VM_DISK_SIZE")?,
        cpus: required_u64(map, "VM_CPUS")? as u32,
        ssh_port: optional_u16(map, "VM_SSH_PORT", DEFAULT_SSH_PORT)?,
        static_ip: string("VM_STATIC_IP"),
        user: string("VM_USER"),
        user_password: string("VM_PASSWORD"),
        root_password: string("VM_ROOT_PASSWORD"),
        iso_url: string("ISO_URL"),
        vm_name,
        work_dir,
    })
}

fn required_u64(map: &BTreeMap<String, String>, key: &str) -> Result<u64, ProvisionError> {
    let value = map.get(key).ok_or_else(|| ProvisionError::Validation {
        message: format!("missing required key {key}"),
    })?;
    value.parse().map_err(|_| ProvisionError::Validation {
        message: format!("{key} must be a number (got '{value}')"),
    })
}

fn optional_u16(
    map: &BTreeMap<String, String>,
    key: &str,
    default: u16,
) -> Result<u16, ProvisionError> {
    match map.get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ProvisionError::Validation {
            message: format!("{key} must be a port number (got '{value}')"),
        }),
    }
}

fn validate(config: &ProvisioningConfig) -> Result<(), ProvisionError> {
    if config.cpus < 1 {
        return Err(ProvisionError::Validation {
            message: "VM_CPUS must be at least 1".into(),
        });
    }
    if config.memory_mb < 256 {
        return Err(ProvisionError::Validation {
            message: "VM_MEMORY must be at least 256 MB".into(),
        });
    }
    if config.disk_mb < 1024 {
        return Err(ProvisionError::Validation {
            message: "VM_DISK_SIZE must be at least 1024 MB".into(),
        });
    }
    if config.ssh_port == 0 {
        return Err(ProvisionError::Validation {
            message: "VM_SSH_PORT must be non-zero".into(),
        });
    }
    if !config.vm_name.is_empty() {
        validate_name(&config.vm_name)?;
    }
    if !config.static_ip.is_empty() && config.static_ip.parse::<Ipv4Addr>().is_err() {
        return Err(ProvisionError::Validation {
            message: format!(
                "VM_STATIC_IP is not a valid IPv4 address ('{}')",
                config.static_ip
            ),
        });
    }
    if !config.iso_url.is_empty()
        && !config.iso_url.starts_with("http://")
        && !config.iso_url.starts_with("https://")
    {
        return Err(ProvisionError::Validation {
            message: format!("ISO_URL must be an http(s) URL (got '{}')", config.iso_url),
        });
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), ProvisionError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(ProvisionError::Validation {
            message: format!("VM_NAME must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn full_map() -> BTreeMap<String, String> {
        parse_env(
            "VM_NAME=debian-vm\n\
             VM_MEMORY=2048\n\
             VM_DISK_SIZE=25000\n\
             VM_CPUS=2\n\
             VM_STATIC_IP=192.168.56.10\n\
             VM_SSH_PORT=2222\n\
             VM_USER=dev\n\
             VM_PASSWORD=devpass\n\
             VM_ROOT_PASSWORD=rootpass\n\
             WORK_DIR=/tmp/autovm-test\n\
             ISO_URL=https://cdimage.debian.org/debian-cd/netinst.iso\n",
        )
    }

    /// Build a ProvisioningConfig for testing other modules.
    pub fn test_config() -> ProvisioningConfig {
        from_map(&full_map()).unwrap()
    }

    #[test]
    fn parse_env_trims_and_skips_comments() {
        let map = parse_env("VM_NAME=Foo\n# comment\nVM_MEMORY = 2048\n");
        assert_eq!(map.len(), 2);
        assert_eq!(map["VM_NAME"], "Foo");
        assert_eq!(map["VM_MEMORY"], "2048");
    }

    #[test]
    fn parse_env_splits_on_first_equals() {
        let map = parse_env("VM_PASSWORD=a=b=c\n");
        assert_eq!(map["VM_PASSWORD"], "a=b=c");
    }

    #[test]
    fn parse_env_ignores_blank_and_malformed_lines() {
        let map = parse_env("\n\nnot a pair\nVM_NAME=x\n");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn full_config_parses() {
        let config = test_config();
        assert_eq!(config.vm_name, "debian-vm");
        assert_eq!(config.memory_mb, 2048);
        assert_eq!(config.disk_mb, 25000);
        assert_eq!(config.cpus, 2);
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/autovm-test"));
    }

    #[test]
    fn missing_numeric_key_is_validation_error() {
        let mut map = full_map();
        map.remove("VM_MEMORY");
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("VM_MEMORY"));
    }

    #[test]
    fn malformed_number_is_validation_error() {
        let mut map = full_map();
        map.insert("VM_CPUS".into(), "two".into());
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("VM_CPUS"));
    }

    #[test]
    fn ssh_port_defaults_when_absent() {
        let mut map = full_map();
        map.remove("VM_SSH_PORT");
        let config = from_map(&map).unwrap();
        assert_eq!(config.ssh_port, 2222);
    }

    #[test]
    fn missing_strings_default_to_empty() {
        // Emptiness is the preflight completeness check's job, not load's.
        let mut map = full_map();
        map.remove("VM_USER");
        map.remove("VM_STATIC_IP");
        let config = from_map(&map).unwrap();
        assert!(config.user.is_empty());
        assert!(config.static_ip.is_empty());
    }

    #[test]
    fn bad_static_ip_rejected() {
        let mut map = full_map();
        map.insert("VM_STATIC_IP".into(), "not-an-ip".into());
        let config = from_map(&map).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn bad_iso_url_rejected() {
        let mut map = full_map();
        map.insert("ISO_URL".into(), "ftp://example.com/x.iso".into());
        let config = from_map(&map).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn invalid_names_rejected() {
        for name in ["-bad", ".bad", "a/b", "hello world", "vm<inject>"] {
            assert!(validate_name(name).is_err(), "expected '{name}' rejected");
        }
    }

    #[test]
    fn valid_names_accepted() {
        for name in ["debian-vm", "vm.dev", "VM_01", "a"] {
            validate_name(name).unwrap();
        }
    }
}
