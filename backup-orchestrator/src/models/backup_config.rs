use crate::error::{BackupError, Result};
use crate::models::to_db_time;
use chrono::{Utc, Weekday};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ── Frequency ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Hourly,
    #[serde(rename = "EVERY_6H")]
    Every6h,
    #[serde(rename = "EVERY_12H")]
    Every12h,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Every6h => "every_6h",
            Frequency::Every12h => "every_12h",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "every_6h" => Ok(Frequency::Every6h),
            "every_12h" => Ok(Frequency::Every12h),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}

// ── ExecutionTime ──

/// Wall-clock `HH:MM` at which daily/weekly/monthly backups fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutionTime {
    hour: u32,
    minute: u32,
}

impl ExecutionTime {
    pub fn new(hour: u32, minute: u32) -> std::result::Result<Self, String> {
        if hour > 23 || minute > 59 {
            return Err(format!("execution time {hour:02}:{minute:02} is out of range"));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }
}

impl FromStr for ExecutionTime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("execution time '{s}' must use the HH:MM format");
        let (h, m) = s.split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 || !h.chars().chain(m.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let hour = h.parse().map_err(|_| invalid())?;
        let minute = m.parse().map_err(|_| invalid())?;
        ExecutionTime::new(hour, minute)
    }
}

impl TryFrom<String> for ExecutionTime {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutionTime> for String {
    fn from(t: ExecutionTime) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ExecutionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

// ── BackupConfiguration ──

pub const RETENTION_DAYS_RANGE: std::ops::RangeInclusive<u32> = 1..=365;
pub const MAX_BACKUPS_RANGE: std::ops::RangeInclusive<u32> = 1..=100;
pub const COMPRESSION_LEVEL_RANGE: std::ops::RangeInclusive<u8> = 1..=9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfiguration {
    pub automatic_enabled: bool,
    pub frequency: Frequency,
    pub execution_time: ExecutionTime,
    #[serde(default = "default_weekly_day")]
    pub weekly_day: Weekday,
    pub retention_days: u32,
    pub max_backups: u32,
    pub store_local: bool,
    pub store_remote: bool,
    pub local_path: String,
    pub encrypt: bool,
    pub compress: bool,
    pub compression_level: u8,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    #[serde(default)]
    pub notification_emails: BTreeSet<String>,
    #[serde(default)]
    pub excluded_tables: BTreeSet<String>,
}

fn default_weekly_day() -> Weekday {
    Weekday::Sun
}

impl Default for BackupConfiguration {
    /// Daily at 02:00, keeping 30 days and at most 50 backups.
    fn default() -> Self {
        Self {
            automatic_enabled: true,
            frequency: Frequency::Daily,
            execution_time: ExecutionTime { hour: 2, minute: 0 },
            weekly_day: default_weekly_day(),
            retention_days: 30,
            max_backups: 50,
            store_local: true,
            store_remote: false,
            local_path: "./backups".into(),
            encrypt: false,
            compress: true,
            compression_level: 6,
            notify_on_success: false,
            notify_on_failure: true,
            notification_emails: BTreeSet::new(),
            excluded_tables: BTreeSet::new(),
        }
    }
}

impl BackupConfiguration {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(BackupError::Validation(msg));

        if !RETENTION_DAYS_RANGE.contains(&self.retention_days) {
            return fail(format!("retentionDays must be between 1 and 365, got {}", self.retention_days));
        }
        if !MAX_BACKUPS_RANGE.contains(&self.max_backups) {
            return fail(format!("maxBackups must be between 1 and 100, got {}", self.max_backups));
        }
        if !COMPRESSION_LEVEL_RANGE.contains(&self.compression_level) {
            return fail(format!("compressionLevel must be between 1 and 9, got {}", self.compression_level));
        }
        if !self.store_local && !self.store_remote {
            return fail("at least one of storeLocal or storeRemote must be enabled".into());
        }
        if self.local_path.trim().is_empty() {
            return fail("localPath must not be empty".into());
        }
        for email in &self.notification_emails {
            let valid = email
                .split_once('@')
                .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'));
            if !valid {
                return fail(format!("'{email}' is not a valid notification address"));
            }
        }
        for table in &self.excluded_tables {
            let valid = !table.is_empty()
                && table
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '*'));
            if !valid {
                return fail(format!("'{table}' is not a valid table name"));
            }
        }
        Ok(())
    }
}

// ── Persistence ──

fn row_to_config(row: &Row) -> rusqlite::Result<BackupConfiguration> {
    let text_err = |column: &str, e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, format!("{column}: {e}").into())
    };
    let frequency: String = row.get("frequency")?;
    let execution_time: String = row.get("execution_time")?;
    let weekly_day: u8 = row.get("weekly_day")?;
    let emails: String = row.get("notification_emails")?;
    let excluded: String = row.get("excluded_tables")?;

    Ok(BackupConfiguration {
        automatic_enabled: row.get("automatic_enabled")?,
        frequency: frequency.parse().map_err(|e| text_err("frequency", e))?,
        execution_time: execution_time.parse().map_err(|e| text_err("execution_time", e))?,
        weekly_day: weekday_from_sunday(weekly_day),
        retention_days: row.get("retention_days")?,
        max_backups: row.get("max_backups")?,
        store_local: row.get("store_local")?,
        store_remote: row.get("store_remote")?,
        local_path: row.get("local_path")?,
        encrypt: row.get("encrypt")?,
        compress: row.get("compress")?,
        compression_level: row.get("compression_level")?,
        notify_on_success: row.get("notify_on_success")?,
        notify_on_failure: row.get("notify_on_failure")?,
        notification_emails: serde_json::from_str(&emails).map_err(|e| text_err("notification_emails", e.to_string()))?,
        excluded_tables: serde_json::from_str(&excluded).map_err(|e| text_err("excluded_tables", e.to_string()))?,
    })
}

fn weekday_from_sunday(n: u8) -> Weekday {
    match n % 7 {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    }
}

pub fn find_active(conn: &Connection) -> Result<Option<BackupConfiguration>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_configuration WHERE id = 1")?;
    let mut rows = stmt.query_map([], row_to_config)?;
    Ok(rows.next().transpose()?)
}

/// Replace the active configuration row as a whole.
pub fn replace(conn: &mut Connection, config: &BackupConfiguration) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM backup_configuration", [])?;
    write_row(&tx, "INSERT", config)?;
    tx.commit()?;
    Ok(())
}

/// Store `config` only when no active row exists. Returns false when one did.
pub fn insert_if_absent(conn: &Connection, config: &BackupConfiguration) -> Result<bool> {
    Ok(write_row(conn, "INSERT OR IGNORE", config)? > 0)
}

fn write_row(conn: &Connection, verb: &str, config: &BackupConfiguration) -> Result<usize> {
    let sql = format!(
        "{verb} INTO backup_configuration (id, automatic_enabled, frequency, execution_time, weekly_day,
            retention_days, max_backups, store_local, store_remote, local_path, encrypt, compress,
            compression_level, notify_on_success, notify_on_failure, notification_emails, excluded_tables, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
    );
    let changed = conn.execute(
        &sql,
        params![
            config.automatic_enabled,
            config.frequency.as_str(),
            config.execution_time.to_string(),
            config.weekly_day.num_days_from_sunday(),
            config.retention_days,
            config.max_backups,
            config.store_local,
            config.store_remote,
            config.local_path,
            config.encrypt,
            config.compress,
            config.compression_level,
            config.notify_on_success,
            config.notify_on_failure,
            serde_json::to_string(&config.notification_emails)?,
            serde_json::to_string(&config.excluded_tables)?,
            to_db_time(&Utc::now()),
        ],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_time_parsing() {
        assert_eq!("02:00".parse::<ExecutionTime>().unwrap(), ExecutionTime::new(2, 0).unwrap());
        assert_eq!("23:59".parse::<ExecutionTime>().unwrap().to_string(), "23:59");
        for bad in ["2:00", "24:00", "12:60", "ab:cd", "1200", "12:0", "-1:00", ""] {
            assert!(bad.parse::<ExecutionTime>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = BackupConfiguration::default();
        config.validate().unwrap();
        assert_eq!(config.frequency, Frequency::Daily);
        assert_eq!(config.execution_time.to_string(), "02:00");
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.max_backups, 50);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = BackupConfiguration::default();
        config.retention_days = 0;
        assert!(matches!(config.validate(), Err(BackupError::Validation(_))));

        let mut config = BackupConfiguration::default();
        config.max_backups = 101;
        assert!(matches!(config.validate(), Err(BackupError::Validation(_))));

        let mut config = BackupConfiguration::default();
        config.compression_level = 10;
        assert!(matches!(config.validate(), Err(BackupError::Validation(_))));

        let mut config = BackupConfiguration::default();
        config.excluded_tables.insert("users; drop".into());
        assert!(matches!(config.validate(), Err(BackupError::Validation(_))));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::json!({
            "automaticEnabled": true,
            "frequency": "EVERY_6H",
            "executionTime": "03:30",
            "retentionDays": 7,
            "maxBackups": 10,
            "storeLocal": true,
            "storeRemote": false,
            "localPath": "/var/backups",
            "encrypt": false,
            "compress": true,
            "compressionLevel": 9,
            "notifyOnSuccess": false,
            "notifyOnFailure": true,
        });
        let config: BackupConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(config.frequency, Frequency::Every6h);
        assert_eq!(config.execution_time, ExecutionTime::new(3, 30).unwrap());
        assert_eq!(config.weekly_day, Weekday::Sun);

        let bad = serde_json::json!({ "executionTime": "3:30" });
        assert!(serde_json::from_value::<BackupConfiguration>(bad).is_err());
    }
}
