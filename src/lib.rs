pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod exec;
pub mod history;
pub mod lines;
pub mod protocol;
pub mod pty;
pub mod resolver;
pub mod session;
pub mod shutdown;
pub mod target;
pub mod terminal;
