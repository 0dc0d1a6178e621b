use std::path::{Path, PathBuf};

use crate::error::ProvisionError;
use crate::paths;

/// Tokens replaced verbatim in the answer-file template.
pub const TOKEN_USERNAME: &str = "USERNAME";
pub const TOKEN_USER_PASSWORD: &str = "USERPASSWORD";
pub const TOKEN_ROOT_PASSWORD: &str = "ROOTPASSWORD";

/// Debian preseed template embedded in the binary; `--answer-template`
/// substitutes a file on disk.
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/preseed.cfg");

/// Credentials substituted into the template.
pub struct Credentials<'a> {
    pub username: &'a str,
    pub user_password: &'a str,
    pub root_password: &'a str,
}

/// Literal placeholder substitution, no escaping. Credentials containing
/// the token strings themselves (or characters the installer's format
/// treats specially) produce undefined output; this is a documented
/// constraint of the answer-file mechanism, not something this layer
/// papers over.
pub fn render(template: &str, creds: &Credentials) -> String {
    template
        .replace(TOKEN_USER_PASSWORD, creds.user_password)
        .replace(TOKEN_ROOT_PASSWORD, creds.root_password)
        .replace(TOKEN_USERNAME, creds.username)
}

/// Render the template and write it into the work directory.
pub fn write_answer_file(
    work_dir: &Path,
    template: &str,
    creds: &Credentials,
) -> Result<PathBuf, ProvisionError> {
    std::fs::create_dir_all(work_dir).map_err(|e| ProvisionError::Io {
        context: format!("creating directory {}", work_dir.display()),
        source: e,
    })?;

    let path = paths::answer_file_path(work_dir);
    let rendered = render(template, creds);
    std::fs::write(&path, rendered).map_err(|e| ProvisionError::Io {
        context: format!("writing answer file {}", path.display()),
        source: e,
    })?;

    tracing::info!(path = %path.display(), "rendered answer file");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials<'static> {
        Credentials {
            username: "dev",
            user_password: "hunter2",
            root_password: "toor",
        }
    }

    #[test]
    fn all_tokens_substituted() {
        let out = render("u=USERNAME p=USERPASSWORD r=ROOTPASSWORD", &creds());
        assert_eq!(out, "u=dev p=hunter2 r=toor");
    }

    #[test]
    fn repeated_tokens_all_replaced() {
        let out = render("ROOTPASSWORD ROOTPASSWORD", &creds());
        assert_eq!(out, "toor toor");
    }

    #[test]
    fn unrelated_text_untouched() {
        let out = render("d-i passwd/user-uid string 1000", &creds());
        assert_eq!(out, "d-i passwd/user-uid string 1000");
    }

    #[test]
    fn default_template_carries_all_tokens() {
        assert!(DEFAULT_TEMPLATE.contains(TOKEN_USERNAME));
        assert!(DEFAULT_TEMPLATE.contains(TOKEN_USER_PASSWORD));
        assert!(DEFAULT_TEMPLATE.contains(TOKEN_ROOT_PASSWORD));
    }

    #[test]
    fn default_template_renders_clean() {
        let out = render(DEFAULT_TEMPLATE, &creds());
        assert!(!out.contains(TOKEN_USER_PASSWORD));
        assert!(!out.contains(TOKEN_ROOT_PASSWORD));
        assert!(out.contains("passwd/username string dev"));
    }

    #[test]
    fn write_creates_file_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_answer_file(dir.path(), "USERNAME", &creds()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "dev");
    }
}
