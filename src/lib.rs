pub mod config;
pub mod database;
pub mod telegram;
pub mod telegram_log;
pub mod watcher;
