pub mod bot;
pub mod config;
pub mod matrix_log;
