use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::constants::DEFAULT_PORT;

/// Signals that can be sent to a running broker
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminate the instance recorded in the PID file
    Stop,
}

/// Heart Broker Configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "heart", author, version, about = "Message broker for streaming applications", long_about = None)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, short, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// TLS certificate chain (PEM). TLS is enabled when --key is given too.
    #[arg(long, value_name = "FILE", requires = "key")]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM).
    #[arg(long, value_name = "FILE", requires = "cert")]
    pub key: Option<PathBuf>,

    /// Send a signal to a running instance and exit.
    #[arg(long, short, value_enum)]
    pub signal: Option<Signal>,

    /// Debug logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub debug: bool,

    /// PID file guarding against a second instance [default: ~/.config/Streamheart/heart/heart.pid]
    #[arg(long, value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    /// Append logs to this file instead of stderr.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Status logging interval in seconds, 0 to disable
    #[arg(long, default_value_t = 60)]
    pub status_interval: u64,
}

impl Config {
    /// Socket address built from --host and --port
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        format!("{}:{}", host, self.port)
            .parse()
            .or_else(|_| format!("[{}]:{}", host, self.port).parse())
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file.clone().unwrap_or_else(default_pid_file)
    }

    /// Both certificate and key, when TLS is configured
    pub fn tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.cert.as_ref().zip(self.key.as_ref())
    }
}

fn default_pid_file() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".config")
        .join("Streamheart")
        .join("heart")
        .join("heart.pid")
}
