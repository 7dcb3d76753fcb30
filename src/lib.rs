pub mod api;
pub mod backend;
pub mod cli;
pub mod db;
pub mod editor;
pub mod error;
pub mod export;
pub mod history;
pub mod logging;
pub mod notification;
pub mod polling;
pub mod reorder;
pub mod session;
pub mod settings;
pub mod types;
pub mod watch;
