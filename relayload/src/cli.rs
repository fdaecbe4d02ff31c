use std::time::Duration;

use clap::Parser;

use crate::http::AuthConfig;
use crate::limiter::LimitMode;

/// Playlist-driven segment load generator for live DASH/HLS streams.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Playlist refresh interval and per-request timeout.
    #[arg(long = "segment-duration", default_value = "3s", value_parser = humantime_duration)]
    pub segment_duration: Duration,

    /// Number of concurrent download workers.
    #[arg(long, default_value_t = 50)]
    pub workers: usize,

    /// Requests/second; 0 = unlimited, negative = auto.
    #[arg(long, allow_negative_numbers = true, default_value_t = -1)]
    pub limit: i64,

    /// Emit every Kth eligible segment.
    #[arg(long, default_value_t = 5)]
    pub sample: u32,

    /// Enqueue each eligible segment this many times.
    #[arg(long, default_value_t = 1)]
    pub factor: u32,

    /// Authentication scheme for playlist and segment requests.
    #[arg(long, value_enum)]
    pub auth: Option<AuthScheme>,

    /// Basic auth username (requires `-auth basic`).
    #[arg(long)]
    pub user: Option<String>,

    /// Basic auth password (requires `-auth basic`).
    #[arg(long)]
    pub password: Option<String>,

    /// Raise log verbosity to debug.
    #[arg(short, long)]
    pub verbose: bool,

    /// One or more playlist URLs to load.
    #[arg(required = true)]
    pub urls: Vec<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum AuthScheme {
    Basic,
}

impl Args {
    pub fn limit_mode(&self) -> LimitMode {
        if self.limit == 0 {
            LimitMode::Unlimited
        } else if self.limit < 0 {
            LimitMode::Auto
        } else {
            LimitMode::Fixed(self.limit as u32)
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        match self.auth {
            Some(AuthScheme::Basic) => AuthConfig::basic(
                self.user.clone().unwrap_or_default(),
                self.password.clone().unwrap_or_default(),
            ),
            None => AuthConfig::none(),
        }
    }
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
