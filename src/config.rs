use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Simulation steps per second
    pub step_rate: u32,
    /// Send a state broadcast every X simulation steps
    pub tick_rate: i64,
    /// Bot ids queued with the control plane when a run starts
    pub managed_bots: Vec<i64>,
    /// How long a dial to a remote bot may take before being abandoned
    pub connect_timeout: Duration,
    /// How often the driver re-evaluates down links
    pub reconnect_interval: Duration,
    /// Where the filesystem history writer stores replay records
    pub replay_data_dir: PathBuf,
    /// Fixed session secret; a random one is generated per run when unset
    pub session_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            step_rate: 50,
            tick_rate: 50,
            managed_bots: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            replay_data_dir: PathBuf::from("replay-data"),
            session_secret: None,
        }
    }
}

fn parse_bot_list(raw: &str) -> Option<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().ok())
        .collect()
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(step_rate) = std::env::var("STEP_RATE") {
            if let Ok(parsed) = step_rate.parse::<u32>() {
                if parsed > 0 && parsed <= 1000 {
                    config.step_rate = parsed;
                } else {
                    tracing::warn!("STEP_RATE must be 1-1000, using default");
                }
            } else {
                tracing::warn!("Invalid STEP_RATE '{}', using default", step_rate);
            }
        }

        if let Ok(tick_rate) = std::env::var("TICK_RATE") {
            if let Ok(parsed) = tick_rate.parse::<i64>() {
                if parsed > 0 {
                    config.tick_rate = parsed;
                } else {
                    tracing::warn!("TICK_RATE must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_RATE '{}', using default", tick_rate);
            }
        }

        if let Ok(bots) = std::env::var("MANAGED_BOTS") {
            match parse_bot_list(&bots) {
                Some(parsed) => config.managed_bots = parsed,
                None => tracing::warn!("Invalid MANAGED_BOTS '{}', using default", bots),
            }
        }

        if let Ok(timeout) = std::env::var("CONNECT_TIMEOUT_MS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                if parsed > 0 {
                    config.connect_timeout = Duration::from_millis(parsed);
                } else {
                    tracing::warn!("CONNECT_TIMEOUT_MS must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid CONNECT_TIMEOUT_MS '{}', using default", timeout);
            }
        }

        if let Ok(dir) = std::env::var("REPLAY_DATA_DIR") {
            config.replay_data_dir = PathBuf::from(dir);
        }

        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            if !secret.is_empty() {
                config.session_secret = Some(secret);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.step_rate == 0 || self.step_rate > 1000 {
            return Err("step_rate must be 1-1000".to_string());
        }
        if self.tick_rate < 1 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout cannot be zero".to_string());
        }
        if self.reconnect_interval.is_zero() {
            return Err("reconnect_interval cannot be zero".to_string());
        }
        Ok(())
    }

    /// Wall-clock duration of one simulation step
    pub fn step_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.step_rate.max(1) as f64)
    }
}
