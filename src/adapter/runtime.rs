use crate::config::FrameworkConfig;
use crate::error::AdapterError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

const SETUP_MARKER: &str = ".sprintbench_setup_complete";

/// Prefix-compatible comparison of two commit hashes
pub fn commits_match(expected: &str, actual: &str) -> bool {
    let expected = expected.trim().to_ascii_lowercase();
    let actual = actual.trim().to_ascii_lowercase();
    if expected.is_empty() || actual.is_empty() {
        return false;
    }
    actual.starts_with(&expected) || expected.starts_with(&actual)
}

async fn git(checkout: &Path, args: &[&str]) -> Result<String, AdapterError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(checkout)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AdapterError::Setup(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        return Err(AdapterError::Setup(format!(
            "git {} failed in {}: {}",
            args.join(" "),
            checkout.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Check the checkout's HEAD against the pinned commit
pub async fn verify_commit(checkout: &Path, expected: &str) -> Result<String, AdapterError> {
    let actual = git(checkout, &["rev-parse", "HEAD"]).await?;
    if !commits_match(expected, &actual) {
        return Err(AdapterError::CommitMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("{} is at pinned commit {}", checkout.display(), actual);
    Ok(actual)
}

/// Clone and set up the shared per-framework checkout once.
///
/// Later calls find the setup marker and return immediately.
pub async fn prepare_runtime(checkout: &Path, framework: &FrameworkConfig) -> Result<(), AdapterError> {
    if checkout.join(SETUP_MARKER).exists() {
        return Ok(());
    }

    if !checkout.exists() {
        let url = framework.repo_url.as_deref().ok_or_else(|| {
            AdapterError::Setup(format!(
                "checkout {} does not exist and no repo_url is configured",
                checkout.display()
            ))
        })?;
        if let Some(parent) = checkout.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Cloning {} into {}", url, checkout.display());
        let status = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(checkout)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| AdapterError::Setup(format!("failed to run git clone: {}", e)))?;
        if !status.success() {
            return Err(AdapterError::Setup(format!("git clone of {} failed", url)));
        }
        git(checkout, &["checkout", "--detach", &framework.commit]).await?;
    }

    for command in &framework.setup_commands {
        info!("Setup in {}: {}", checkout.display(), command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(checkout)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AdapterError::Setup(format!("failed to run '{}': {}", command, e)))?;
        if !output.status.success() {
            return Err(AdapterError::Setup(format!(
                "setup command '{}' failed: {}",
                command,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
    }

    std::fs::write(checkout.join(SETUP_MARKER), &framework.commit)?;
    Ok(())
}
