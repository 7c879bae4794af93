//! Platform-specific service lifecycle management
//!
//! Install, uninstall, and query the listener as a per-user auto-start
//! service: a systemd user unit on Linux, a LaunchAgent on macOS and an
//! on-logon scheduled task on Windows.

use std::path::PathBuf;
use std::process::Command;

use crate::{Error, Result};

/// Service status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Service is running
    Running,
    /// Service is installed but not running
    Stopped,
    /// Service is not installed
    NotInstalled,
    /// Status could not be determined
    Unknown(String),
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::NotInstalled => write!(f, "not installed"),
            Self::Unknown(msg) => write!(f, "unknown ({msg})"),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the hark binary
    pub binary_path: PathBuf,
    /// Extra arguments passed to the listener
    pub extra_args: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("hark"),
            extra_args: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Command line the service manager runs
    fn program_arguments(&self) -> Vec<String> {
        std::iter::once(self.binary_path.display().to_string())
            .chain(self.extra_args.iter().cloned())
            .collect()
    }
}

/// Install hark as an auto-start service, replacing any existing install
///
/// # Errors
///
/// Returns error if service installation fails
pub fn install_service(config: &ServiceConfig) -> Result<()> {
    #[cfg(target_os = "macos")]
    return install_launchd(config);

    #[cfg(target_os = "linux")]
    return install_systemd(config);

    #[cfg(windows)]
    return install_task(config);

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        let _ = config;
        Err(Error::Service(
            "service installation not supported on this platform".to_string(),
        ))
    }
}

/// Uninstall the hark service; succeeds if it was never installed
///
/// # Errors
///
/// Returns error if service removal fails
pub fn uninstall_service() -> Result<()> {
    #[cfg(target_os = "macos")]
    return uninstall_launchd();

    #[cfg(target_os = "linux")]
    return uninstall_systemd();

    #[cfg(windows)]
    return uninstall_task();

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    Err(Error::Service(
        "service management not supported on this platform".to_string(),
    ))
}

/// Query hark service status
///
/// # Errors
///
/// Returns error if status cannot be determined
pub fn service_status() -> Result<ServiceStatus> {
    #[cfg(target_os = "macos")]
    return launchd_status();

    #[cfg(target_os = "linux")]
    return systemd_status();

    #[cfg(windows)]
    return task_status();

    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    Ok(ServiceStatus::Unknown(
        "platform not supported".to_string(),
    ))
}

/// Get the service log file path
#[must_use]
pub fn log_path() -> Option<PathBuf> {
    log_dir().map(|dir| dir.join("hark.log"))
}

fn log_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".hark").join("logs"))
}

fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Service(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Service(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// --- macOS (launchd) ---

#[cfg(target_os = "macos")]
const LAUNCHD_LABEL: &str = "dev.omni.hark";

#[cfg(target_os = "macos")]
fn plist_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home)
        .join("Library/LaunchAgents")
        .join(format!("{LAUNCHD_LABEL}.plist"))
}

#[cfg(target_os = "macos")]
fn render_plist(config: &ServiceConfig, log_dir: &std::path::Path) -> String {
    let arguments: String = config
        .program_arguments()
        .iter()
        .map(|arg| format!("        <string>{}</string>\n", xml_escape(arg)))
        .collect();
    let stdout_log = xml_escape(&log_dir.join("hark.log").display().to_string());
    let stderr_log = xml_escape(&log_dir.join("hark.err.log").display().to_string());

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <dict>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>StandardOutPath</key>
    <string>{stdout_log}</string>
    <key>StandardErrorPath</key>
    <string>{stderr_log}</string>
</dict>
</plist>"#
    )
}

#[cfg(target_os = "macos")]
fn install_launchd(config: &ServiceConfig) -> Result<()> {
    let log_dir = log_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    std::fs::create_dir_all(&log_dir)?;

    let path = plist_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Replace a previous install
    if path.exists() {
        let _ = Command::new("launchctl").arg("unload").arg(&path).output();
    }

    std::fs::write(&path, render_plist(config, &log_dir))?;
    run_command("launchctl", &["load", "-w", &path.display().to_string()])?;

    tracing::info!(path = %path.display(), "installed LaunchAgent");
    Ok(())
}

#[cfg(target_os = "macos")]
fn uninstall_launchd() -> Result<()> {
    let path = plist_path();

    if path.exists() {
        let _ = Command::new("launchctl").arg("unload").arg(&path).output();
        std::fs::remove_file(&path)?;
        tracing::info!("uninstalled LaunchAgent");
    }

    Ok(())
}

#[cfg(target_os = "macos")]
fn launchd_status() -> Result<ServiceStatus> {
    if !plist_path().exists() {
        return Ok(ServiceStatus::NotInstalled);
    }

    let output = Command::new("launchctl")
        .args(["list", LAUNCHD_LABEL])
        .output()
        .map_err(|e| Error::Service(format!("failed to run launchctl: {e}")))?;

    if output.status.success() {
        Ok(ServiceStatus::Running)
    } else {
        Ok(ServiceStatus::Stopped)
    }
}

/// Escape text for a plist `<string>` element
#[cfg(any(target_os = "macos", test))]
fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

// --- Linux (systemd) ---

/// Quote one `ExecStart=` word
///
/// `%` and `$` are doubled so systemd does not expand them; words with
/// whitespace, quotes, backslashes or `;` are wrapped in double quotes.
#[cfg(any(target_os = "linux", test))]
fn systemd_quote(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");
    let needs_quotes = escaped.is_empty()
        || escaped.contains(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if !needs_quotes {
        return escaped;
    }

    let mut quoted = String::with_capacity(escaped.len() + 2);
    quoted.push('"');
    for c in escaped.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(target_os = "linux")]
const SYSTEMD_SERVICE: &str = "hark";

#[cfg(target_os = "linux")]
fn service_file_path() -> PathBuf {
    let config_dir = directories::BaseDirs::new()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });

    config_dir
        .join("systemd/user")
        .join(format!("{SYSTEMD_SERVICE}.service"))
}

#[cfg(target_os = "linux")]
fn render_unit(config: &ServiceConfig, log_file: &std::path::Path) -> String {
    let exec_start = config
        .program_arguments()
        .iter()
        .map(|arg| systemd_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let log_file = log_file.display();

    format!(
        r"[Unit]
Description=Hark wake-word listener
After=sound.target

[Service]
Type=simple
ExecStart={exec_start}
Restart=on-failure
RestartSec=5
Environment=RUST_LOG=info
StandardOutput=append:{log_file}
StandardError=append:{log_file}

[Install]
WantedBy=default.target
"
    )
}

#[cfg(target_os = "linux")]
fn install_systemd(config: &ServiceConfig) -> Result<()> {
    let log_dir = log_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    std::fs::create_dir_all(&log_dir)?;

    let path = service_file_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, render_unit(config, &log_dir.join("hark.log")))?;

    run_command("systemctl", &["--user", "daemon-reload"])?;
    run_command("systemctl", &["--user", "enable", SYSTEMD_SERVICE])?;
    // Pick up a replaced unit if it was already running
    run_command("systemctl", &["--user", "restart", SYSTEMD_SERVICE])?;

    tracing::info!(path = %path.display(), "installed systemd user service");
    Ok(())
}

#[cfg(target_os = "linux")]
fn uninstall_systemd() -> Result<()> {
    let _ = run_command("systemctl", &["--user", "disable", "--now", SYSTEMD_SERVICE]);

    let path = service_file_path();
    if path.exists() {
        std::fs::remove_file(&path)?;
        let _ = run_command("systemctl", &["--user", "daemon-reload"]);
        tracing::info!("uninstalled systemd user service");
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn systemd_status() -> Result<ServiceStatus> {
    if !service_file_path().exists() {
        return Ok(ServiceStatus::NotInstalled);
    }

    let output = Command::new("systemctl")
        .args(["--user", "is-active", SYSTEMD_SERVICE])
        .output()
        .map_err(|e| Error::Service(format!("failed to run systemctl: {e}")))?;

    let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
    match status.as_str() {
        "active" => Ok(ServiceStatus::Running),
        "inactive" | "failed" => Ok(ServiceStatus::Stopped),
        other => Ok(ServiceStatus::Unknown(other.to_string())),
    }
}

// --- Windows (Task Scheduler) ---

#[cfg(windows)]
const TASK_NAME: &str = "Hark";

#[cfg(windows)]
fn install_task(config: &ServiceConfig) -> Result<()> {
    let command = config
        .program_arguments()
        .iter()
        .map(|arg| format!("\"{arg}\""))
        .collect::<Vec<_>>()
        .join(" ");

    // /F replaces an existing task of the same name
    run_command(
        "schtasks",
        &["/Create", "/SC", "ONLOGON", "/TN", TASK_NAME, "/TR", &command, "/F"],
    )?;

    tracing::info!(task = TASK_NAME, "installed scheduled task");
    Ok(())
}

#[cfg(windows)]
fn uninstall_task() -> Result<()> {
    if matches!(task_status()?, ServiceStatus::NotInstalled) {
        return Ok(());
    }

    let _ = run_command("schtasks", &["/End", "/TN", TASK_NAME]);
    run_command("schtasks", &["/Delete", "/TN", TASK_NAME, "/F"])?;
    tracing::info!(task = TASK_NAME, "uninstalled scheduled task");
    Ok(())
}

#[cfg(windows)]
fn task_status() -> Result<ServiceStatus> {
    let output = Command::new("schtasks")
        .args(["/Query", "/TN", TASK_NAME, "/FO", "LIST"])
        .output()
        .map_err(|e| Error::Service(format!("failed to run schtasks: {e}")))?;

    if !output.status.success() {
        return Ok(ServiceStatus::NotInstalled);
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    if listing.contains("Running") {
        Ok(ServiceStatus::Running)
    } else {
        Ok(ServiceStatus::Stopped)
    }
}
