use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

#[derive(Debug, Parser, Clone)]
pub struct Config {
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    #[arg(short, long, default_value_t = 6379)]
    pub port: u16,

    /// Primary to follow, as "<host> <port>" or "<host>:<port>".
    #[arg(long)]
    pub replicaof: Option<String>,

    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub handshake_timeout_ms: u64,

    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub ack_interval_ms: u64,

    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            replicaof: None,
            handshake_timeout_ms: 5000,
            ack_interval_ms: 1000,
            sweep_interval_ms: 100,
        }
    }
}

impl Config {
    pub fn role(&self) -> Role {
        if self.replicaof.is_some() {
            Role::Replica
        } else {
            Role::Primary
        }
    }

    pub fn primary_address(&self) -> Option<String> {
        let replicaof = self.replicaof.as_deref()?.trim();
        match replicaof.split_once(' ') {
            Some((host, port)) => Some(format!("{}:{}", host, port.trim())),
            None => Some(replicaof.to_string()),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
