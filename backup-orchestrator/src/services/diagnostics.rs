//! Preflight diagnostics.
//!
//! Three independent probes decide whether the environment can take a backup:
//! the dump tool answers `--version`, the connection string is a PostgreSQL
//! URL, and the backup directory is writable.

use crate::config::ToolSettings;
use crate::services::process::{truncate_message, CommandSpec, ProcessError, ProcessRunner};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ToolCheck {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionCheck {
    pub ok: bool,
    pub message: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checks {
    pub tool: ToolCheck,
    pub connection: ConnectionCheck,
    pub permissions: PermissionCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub ready: bool,
    pub checks: Checks,
}

impl DiagnosticsReport {
    fn new(checks: Checks) -> Self {
        let ready = checks.tool.ok && checks.connection.ok && checks.permissions.ok;
        Self { ready, checks }
    }

    /// Message of the first failing probe, in tool/connection/permissions order.
    pub fn first_failure(&self) -> Option<&str> {
        let c = &self.checks;
        [
            (c.tool.ok, c.tool.message.as_str()),
            (c.connection.ok, c.connection.message.as_str()),
            (c.permissions.ok, c.permissions.message.as_str()),
        ]
        .into_iter()
        .find(|(ok, _)| !ok)
        .map(|(_, message)| message)
    }
}

pub struct DiagnosticsService {
    runner: Arc<dyn ProcessRunner>,
    tools: ToolSettings,
}

impl DiagnosticsService {
    pub fn new(runner: Arc<dyn ProcessRunner>, tools: ToolSettings) -> Self {
        Self { runner, tools }
    }

    pub async fn report(&self, backup_dir: &Path) -> DiagnosticsReport {
        let (tool, permissions) = tokio::join!(self.check_tool(), check_write_permission(backup_dir));
        DiagnosticsReport::new(Checks {
            tool,
            connection: check_connection_string(self.tools.database_url.expose()),
            permissions,
        })
    }

    pub async fn system_ready(&self, backup_dir: &Path) -> bool {
        self.report(backup_dir).await.ready
    }

    pub async fn check_tool(&self) -> ToolCheck {
        let name = &self.tools.dump_tool;
        let program = locate_tool(name).await;
        let path = Some(program.display().to_string());
        let cmd = CommandSpec::new(&program).arg("--version");

        match self.runner.run(&cmd, self.tools.probe_timeout).await {
            Ok(out) if out.success() => {
                let version = out.stdout.lines().next().unwrap_or("").trim().to_string();
                ToolCheck {
                    ok: true,
                    message: format!("{name} is available ({version})"),
                    path,
                    version: Some(version),
                }
            }
            Ok(out) => ToolCheck {
                ok: false,
                message: format!(
                    "{name} --version exited with {}: {}",
                    out.exit_code.map_or("a signal".to_string(), |c| format!("code {c}")),
                    truncate_message(&out.stderr, 200)
                ),
                path,
                version: None,
            },
            Err(ProcessError::NotFound(_)) => ToolCheck {
                ok: false,
                message: format!("{name} was not found in PATH or known installation directories"),
                path: None,
                version: None,
            },
            Err(ProcessError::Timeout(t)) => ToolCheck {
                ok: false,
                message: format!("{name} did not respond within {} seconds", t.as_secs()),
                path,
                version: None,
            },
            Err(e) => ToolCheck {
                ok: false,
                message: format!("{name} could not be executed: {e}"),
                path,
                version: None,
            },
        }
    }
}

pub fn check_connection_string(raw: &str) -> ConnectionCheck {
    let fail = |message: String| ConnectionCheck {
        ok: false,
        message,
        host: None,
        port: None,
        database: None,
        user: None,
    };

    if raw.trim().is_empty() {
        return fail("DATABASE_URL is not configured".into());
    }
    let url = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(e) => return fail(format!("Connection string could not be parsed: {e}")),
    };
    if !matches!(url.scheme(), "postgresql" | "postgres") {
        return fail(format!(
            "Connection string must use the postgresql:// scheme, found '{}://'",
            url.scheme()
        ));
    }
    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return fail("Connection string has no host".into()),
    };
    let database = url.path().trim_start_matches('/').to_string();
    if database.is_empty() {
        return fail("Connection string has no database name".into());
    }
    let user = Some(url.username().to_string()).filter(|u| !u.is_empty());

    ConnectionCheck {
        ok: true,
        message: format!("Connection string is valid ({host}/{database})"),
        port: Some(url.port().unwrap_or(5432)),
        host: Some(host),
        database: Some(database),
        user,
    }
}

pub async fn check_write_permission(dir: &Path) -> PermissionCheck {
    let path = dir.display().to_string();
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        return PermissionCheck {
            ok: false,
            message: format!("Cannot create backup directory {path}: {e}"),
            path,
        };
    }

    let sentinel = dir.join(format!(".write-test-{}", uuid::Uuid::new_v4()));
    let result = async {
        tokio::fs::write(&sentinel, b"ok").await?;
        tokio::fs::remove_file(&sentinel).await
    }
    .await;

    match result {
        Ok(()) => PermissionCheck {
            ok: true,
            message: format!("Backup directory {path} is writable"),
            path,
        },
        Err(e) => PermissionCheck {
            ok: false,
            message: format!("Backup directory {path} is not writable: {e}"),
            path,
        },
    }
}

/// [`resolve_tool`] off the async runtime, falling back to the bare name so the
/// runner reports it as missing.
pub async fn locate_tool(name: &str) -> PathBuf {
    let lookup = name.to_string();
    tokio::task::spawn_blocking(move || resolve_tool(&lookup))
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Locate a client tool: PATH first, then the usual PostgreSQL install dirs.
pub fn resolve_tool(name: &str) -> Option<PathBuf> {
    let as_path = Path::new(name);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }
    if let Ok(found) = which::which(name) {
        return Some(found);
    }

    let exe = if cfg!(windows) { format!("{name}.exe") } else { name.to_string() };
    known_install_dirs()
        .into_iter()
        .map(|dir| dir.join(&exe))
        .find(|candidate| candidate.is_file())
}

/// Versioned subdirectories of `root`, newest first.
fn versioned_dirs(root: &Path, prefix: &str, suffix: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
                .map(|e| e.path().join(suffix))
                .collect()
        })
        .unwrap_or_default();
    dirs.sort_by_key(|p| {
        p.parent()
            .and_then(|v| v.file_name())
            .and_then(|v| v.to_string_lossy().trim_start_matches(prefix).parse::<u32>().ok())
            .unwrap_or(0)
    });
    dirs.reverse();
    dirs
}

fn known_install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if cfg!(target_os = "linux") {
        dirs.extend(versioned_dirs(Path::new("/usr/lib/postgresql"), "", "bin"));
        dirs.extend(versioned_dirs(Path::new("/usr"), "pgsql-", "bin"));
        dirs.push(PathBuf::from("/usr/local/pgsql/bin"));
    } else if cfg!(target_os = "macos") {
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from("/opt/homebrew/opt/libpq/bin"));
        dirs.push(PathBuf::from("/usr/local/opt/libpq/bin"));
        dirs.push(PathBuf::from("/Applications/Postgres.app/Contents/Versions/latest/bin"));
    } else if cfg!(windows) {
        dirs.extend(versioned_dirs(Path::new(r"C:\Program Files\PostgreSQL"), "", "bin"));
    }
    dirs
}
