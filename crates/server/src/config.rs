use anyhow::{bail, Result};

/// Hard cap on live connections, matching the default fd-number space.
pub const MAX_FD: usize = 65536;

/// Which descriptors use edge-triggered notification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrigMode {
    Level,
    ConnEdge,
    ListenEdge,
    Edge,
}

impl TrigMode {
    pub fn from_index(index: u8) -> Result<Self> {
        Ok(match index {
            0 => Self::Level,
            1 => Self::ConnEdge,
            2 => Self::ListenEdge,
            3 => Self::Edge,
            other => bail!("trigger mode {other} not in 0-3"),
        })
    }

    pub fn listen_et(self) -> bool {
        matches!(self, Self::ListenEdge | Self::Edge)
    }

    pub fn conn_et(self) -> bool {
        matches!(self, Self::ConnEdge | Self::Edge)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trig_mode: TrigMode,
    /// Idle cutoff per connection; zero or negative disables expiry.
    pub timeout_ms: i64,
    pub linger: bool,
    pub workers: usize,
    pub max_clients: usize,
}

impl Config {
    pub fn new(port: u32, trig_mode: u8, timeout_ms: i64, linger: bool, workers: usize) -> Result<Self> {
        if !(1024..=65535).contains(&port) {
            bail!("port {port} outside 1024-65535");
        }
        if workers == 0 {
            bail!("worker count must be positive");
        }

        Ok(Self {
            port: port as u16,
            trig_mode: TrigMode::from_index(trig_mode)?,
            timeout_ms,
            linger,
            workers,
            max_clients: MAX_FD,
        })
    }

    pub fn timeout_enabled(&self) -> bool {
        self.timeout_ms > 0
    }
}
