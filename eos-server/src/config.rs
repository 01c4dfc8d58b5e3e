//! Server configuration (spec §6).
//!
//! Loaded from an INI file via the `ini` crate into nested structs with
//! `Default` impls, the same shape as the teacher's `ServerConfig` /
//! `CacheConfig` / `SegmentConfig` split (`src/config.rs` /
//! `src/config_file.rs`) — just sourced from INI sections instead of TOML
//! tables, because spec.md §6 fixes the file format.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// `[HTTP_SERVER]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    pub port: u16,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self { port: 8500 }
    }
}

/// `[APP]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub number_of_threads: usize,
    pub tmp_files_path: String,
    pub ffmpeg_path: String,
    pub sox_path: String,
    pub log_level: String,
    pub stdout_log_level: String,
    pub log_file_location: Option<String>,
    pub log_file_max_size: Option<u64>,
    pub log_file_backup_count: Option<u32>,
    /// Seconds the delayed-live view lags the origin by (§4.4's `D`).
    /// The original implementation looks this up per source language;
    /// here it is one process-wide tunable (DESIGN.md open question).
    pub live_delay_secs: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            number_of_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            tmp_files_path: "temp".to_string(),
            ffmpeg_path: "/usr/bin/ffmpeg".to_string(),
            sox_path: "/usr/bin/sox".to_string(),
            log_level: "info".to_string(),
            stdout_log_level: "warning".to_string(),
            log_file_location: None,
            log_file_max_size: None,
            log_file_backup_count: None,
            live_delay_secs: 30.0,
        }
    }
}

/// `[STREAMING_SERVER]` section — used to build URLs returned to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingServerConfig {
    pub use_https: bool,
    pub host_name: String,
}

impl Default for StreamingServerConfig {
    fn default() -> Self {
        Self {
            use_https: false,
            host_name: "localhost".to_string(),
        }
    }
}

/// `[GOOGLE_API]` section — credentials for the STT/translation collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GoogleApiConfig {
    pub project_id: Option<String>,
    pub service_account_file: Option<String>,
    /// API key used by the REST-based Speech-to-Text/Translation
    /// collaborators (`collaborators::google`) as a simpler alternative
    /// to signing `service_account_file` into an OAuth bearer token.
    pub api_key: Option<String>,
}

/// Top-level configuration, the union of all INI sections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub http_server: HttpServerConfig,
    pub app: AppConfig,
    pub streaming_server: StreamingServerConfig,
    pub google_api: GoogleApiConfig,
}

impl Config {
    /// Load from an INI file. All keys are optional except
    /// `GOOGLE_API.SERVICE_ACCOUNT_FILE`, which is required only once a
    /// transcribe-mode session actually needs credentials (checked at
    /// pipeline start-up, not here).
    ///
    /// A missing file is not an error: the teacher's
    /// `ServerConfig::from_file` fallback (`main.rs`) falls back to
    /// `Default::default()` with a warning rather than failing, and
    /// spec.md §6's "Exit 0 on INI missing" is read the same way here —
    /// the process starts with defaults rather than aborting.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Self::default();
        }
        match Self::from_ini_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config file, using defaults");
                Self::default()
            }
        }
    }

    fn from_ini_file(path: &Path) -> Result<Self, ini::Error> {
        let ini = ini::Ini::load_from_file(path)?;
        let mut cfg = Self::default();

        if let Some(section) = ini.section(Some("HTTP_SERVER")) {
            if let Some(v) = section.get("EOS_HTTP_PORT_NUMBER").and_then(|v| v.parse().ok()) {
                cfg.http_server.port = v;
            }
        }
        if let Some(section) = ini.section(Some("APP")) {
            if let Some(v) = section.get("NUMBER_OF_THREADS").and_then(|v| v.parse().ok()) {
                cfg.app.number_of_threads = v;
            }
            if let Some(v) = section.get("TMP_FILES_PATH") {
                cfg.app.tmp_files_path = v.to_string();
            }
            if let Some(v) = section.get("FFMPEG_PATH") {
                cfg.app.ffmpeg_path = v.to_string();
            }
            if let Some(v) = section.get("SOX_PATH") {
                cfg.app.sox_path = v.to_string();
            }
            if let Some(v) = section.get("LOG_LEVEL") {
                cfg.app.log_level = v.to_string();
            }
            if let Some(v) = section.get("STDOUT_LOG_LEVEL") {
                cfg.app.stdout_log_level = v.to_string();
            }
            cfg.app.log_file_location = section.get("LOG_FILE_LOCATION").map(str::to_string);
            cfg.app.log_file_max_size =
                section.get("LOG_FILE_MAX_SIZE").and_then(|v| v.parse().ok());
            cfg.app.log_file_backup_count = section
                .get("LOG_FILE_BACKUP_COUNT")
                .and_then(|v| v.parse().ok());
            if let Some(v) = section.get("LIVE_DELAY_SECONDS").and_then(|v| v.parse().ok()) {
                cfg.app.live_delay_secs = v;
            }
        }
        if let Some(section) = ini.section(Some("STREAMING_SERVER")) {
            if let Some(v) = section.get("USE_HTTPS").and_then(|v| v.parse().ok()) {
                cfg.streaming_server.use_https = v;
            }
            if let Some(v) = section.get("HOST_NAME") {
                cfg.streaming_server.host_name = v.to_string();
            }
        }
        if let Some(section) = ini.section(Some("GOOGLE_API")) {
            cfg.google_api.project_id = section.get("PROJECT_ID").map(str::to_string);
            cfg.google_api.service_account_file =
                section.get("SERVICE_ACCOUNT_FILE").map(str::to_string);
            cfg.google_api.api_key = section.get("API_KEY").map(str::to_string);
        }

        Ok(cfg)
    }

    pub fn socket_addr(&self) -> String {
        format!("0.0.0.0:{}", self.http_server.port)
    }

    /// Base URL used when rewriting manifests so players resolve back
    /// through this service rather than the origin.
    pub fn external_base_url(&self) -> String {
        let scheme = if self.streaming_server.use_https { "https" } else { "http" };
        format!("{scheme}://{}", self.streaming_server.host_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load("/nonexistent/path/eos.ini");
        assert_eq!(cfg.http_server.port, 8500);
    }

    #[test]
    fn parses_ini_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[HTTP_SERVER]\nEOS_HTTP_PORT_NUMBER=9100\n\n[APP]\nNUMBER_OF_THREADS=8\nLOG_LEVEL=debug\n\n[STREAMING_SERVER]\nUSE_HTTPS=true\nHOST_NAME=eos.example.com\n\n[GOOGLE_API]\nPROJECT_ID=proj-1\nSERVICE_ACCOUNT_FILE=/etc/eos/sa.json\n"
        )
        .unwrap();
        let cfg = Config::load(f.path());
        assert_eq!(cfg.http_server.port, 9100);
        assert_eq!(cfg.app.number_of_threads, 8);
        assert_eq!(cfg.app.log_level, "debug");
        assert!(cfg.streaming_server.use_https);
        assert_eq!(cfg.streaming_server.host_name, "eos.example.com");
        assert_eq!(cfg.google_api.project_id.as_deref(), Some("proj-1"));
        assert_eq!(cfg.external_base_url(), "https://eos.example.com");
    }

    #[test]
    fn partial_ini_keeps_other_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[HTTP_SERVER]\nEOS_HTTP_PORT_NUMBER=1234\n").unwrap();
        let cfg = Config::load(f.path());
        assert_eq!(cfg.http_server.port, 1234);
        assert_eq!(cfg.app.log_level, "info");
    }
}
