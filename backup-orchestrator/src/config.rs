use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Connection string of the database being backed up.
///
/// Never printed in full: `Debug` and `Display` mask the password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionString(String);

impl ConnectionString {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// The URL with its password stripped, suitable for a `--dbname` argument.
    pub fn without_password(&self) -> String {
        match url::Url::parse(&self.0) {
            Ok(mut url) => {
                let _ = url.set_password(None);
                url.to_string()
            }
            Err(_) => self.0.clone(),
        }
    }

    pub fn password(&self) -> Option<String> {
        url::Url::parse(&self.0)
            .ok()
            .and_then(|u| u.password().map(|p| p.to_string()))
            .filter(|p| !p.is_empty())
    }

    fn redacted(&self) -> String {
        match url::Url::parse(&self.0) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("****"));
                }
                url.to_string()
            }
            Err(_) => "<unparseable connection string>".into(),
        }
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionString({})", self.redacted())
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Dump/restore tool settings shared by the executor, restore and diagnostics.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub database_url: ConnectionString,
    pub dump_tool: String,
    pub restore_tool: String,
    pub dump_timeout: Duration,
    pub restore_timeout: Duration,
    pub probe_timeout: Duration,
    pub encrypt_args: Vec<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            database_url: ConnectionString::default(),
            dump_tool: "pg_dump".into(),
            restore_tool: "pg_restore".into(),
            dump_timeout: Duration::from_secs(3600),
            restore_timeout: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(5),
            encrypt_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_path: PathBuf,
    pub tools: ToolSettings,
    pub stuck_job_ceiling: Duration,
    pub stats_refresh: Duration,
    pub log_level: String,
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            store_path: PathBuf::from(
                std::env::var("BACKUP_STORE_PATH").unwrap_or_else(|_| "./data/backups.db".into()),
            ),
            tools: ToolSettings {
                database_url: ConnectionString::new(std::env::var("DATABASE_URL").unwrap_or_default()),
                dump_tool: std::env::var("DUMP_TOOL").unwrap_or_else(|_| "pg_dump".into()),
                restore_tool: std::env::var("RESTORE_TOOL").unwrap_or_else(|_| "pg_restore".into()),
                dump_timeout: env_secs("DUMP_TIMEOUT_SECS", 3600),
                restore_timeout: env_secs("RESTORE_TIMEOUT_SECS", 3600),
                probe_timeout: env_secs("TOOL_PROBE_TIMEOUT_SECS", 5),
                encrypt_args: std::env::var("DUMP_ENCRYPT_ARGS")
                    .map(|v| v.split_whitespace().map(String::from).collect())
                    .unwrap_or_default(),
            },
            stuck_job_ceiling: env_secs("STUCK_JOB_CEILING_SECS", 6 * 3600),
            stats_refresh: env_secs("STATS_REFRESH_SECS", 300),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}
