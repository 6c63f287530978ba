pub mod backup_scheduler;
pub mod config_store;
pub mod diagnostics;
pub mod executor;
pub mod notify;
pub mod process;
pub mod restore;
pub mod retention;
pub mod statistics;
pub mod trigger;
pub mod watchdog;
