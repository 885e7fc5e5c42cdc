use std::sync::LazyLock;

use crate::switcher::types::Resolution;

pub struct SwitcherConfig {
    listen_addr: String,
    preview_bitrate: u64,
    fallback_resolution: Resolution,
    fallback_frame_rate: f64,
    demo_sources: Vec<String>,
}

impl SwitcherConfig {
    fn from_env() -> Self {
        let listen_addr = std::env::var("SWITCHER_LISTEN")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let preview_bitrate = std::env::var("SWITCHER_PREVIEW_BITRATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(800_000);

        let demo_sources = std::env::var("SWITCHER_DEMO_SOURCES")
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            listen_addr,
            preview_bitrate,
            fallback_resolution: Resolution {
                width: 1280,
                height: 720,
            },
            fallback_frame_rate: 25.0,
            demo_sources,
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Bitrate of the cheap per-source preview re-encode, in bps.
    pub fn preview_bitrate(&self) -> u64 {
        self.preview_bitrate
    }

    pub fn fallback_resolution(&self) -> Resolution {
        self.fallback_resolution
    }

    pub fn fallback_frame_rate(&self) -> f64 {
        self.fallback_frame_rate
    }

    /// Pins the stub engine should expose as ready sources on startup.
    pub fn demo_sources(&self) -> &[String] {
        &self.demo_sources
    }
}

pub fn config() -> &'static SwitcherConfig {
    static CONFIG: LazyLock<SwitcherConfig> = LazyLock::new(SwitcherConfig::from_env);
    &CONFIG
}
