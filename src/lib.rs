pub mod command;
pub mod config;
pub mod connection;
pub mod db;
pub mod dispatch;
pub mod rdb;
pub mod replication;
pub mod resp;
pub mod server;
pub mod utils;

pub use config::{Config, Role};
pub use db::Db;
pub use resp::Resp;
pub use server::{Server, ServerError};
