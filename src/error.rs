use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("preflight failed: {summary}")]
    #[diagnostic(help("fix the failed checks above and re-run"))]
    Preflight { summary: String },

    #[error("hypervisor {operation} failed: {detail}")]
    Hypervisor { operation: String, detail: String },

    #[error("failed to download installation medium: {message}")]
    Download {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("guest did not become reachable within {waited_secs}s")]
    #[diagnostic(help(
        "the unattended install may have stalled; check the VM console in the hypervisor GUI"
    ))]
    InstallTimeout { waited_secs: u64 },

    #[error("another provisioning run holds the lock for this VM ({path})")]
    LockHeld { path: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}
