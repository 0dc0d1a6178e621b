use std::path::{Path, PathBuf};

/// Default per-VM work directory: `~/.local/share/autovm/<name>/`.
/// Used when the config does not set WORK_DIR.
pub fn default_work_dir(vm_name: &str) -> PathBuf {
    let name = if vm_name.is_empty() { "vm" } else { vm_name };
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("autovm")
        .join(name)
}

/// Path to the VM's virtual disk image.
pub fn disk_path(work_dir: &Path, vm_name: &str) -> PathBuf {
    work_dir.join(format!("{vm_name}.vdi"))
}

/// Path to the rendered answer file.
pub fn answer_file_path(work_dir: &Path) -> PathBuf {
    work_dir.join("preseed.cfg")
}

/// Path to the run lock file for a VM name.
pub fn lock_path(work_dir: &Path, vm_name: &str) -> PathBuf {
    work_dir.join(format!("{vm_name}.lock"))
}
