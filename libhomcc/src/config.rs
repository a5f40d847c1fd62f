// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::info;

use crate::user;

pub const CLIENT_CONFIG_SECTION: &str = "homcc";
pub const SERVER_CONFIG_SECTION: &str = "homccd";

pub const DEFAULT_COMPILATION_REQUEST_TIMEOUT_SECS: f64 = 240.0;
pub const DEFAULT_ESTABLISH_CONNECTION_TIMEOUT_SECS: f64 = 10.0;
pub const DEFAULT_REMOTE_COMPILATION_TRIES: u32 = 3;

#[tracing::instrument(skip_all)]
pub fn read_client_config(config_file: &Option<String>) -> anyhow::Result<ClientConfig> {
    let mut config = read_toml_section::<ClientConfigToml>(config_file)?;
    apply_client_env_overrides(&mut config);
    Ok(config.into())
}

pub fn read_server_config(config_file: &Option<String>) -> anyhow::Result<ServerConfig> {
    let mut config = read_toml_section::<ServerConfigToml>(config_file)?;
    apply_server_env_overrides(&mut config);
    Ok(config.into())
}

fn read_toml_section<T: Default + for<'de> serde::Deserialize<'de>>(
    config_file: &Option<String>,
) -> anyhow::Result<T> {
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({config_path})");
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        return toml::from_str(&config_str).context("parsing config file");
    }

    let user_info = user::info()?;
    let mut config_path = PathBuf::from(user_info.home_dir);
    config_path.push(".config");
    config_path.push("homcc");
    config_path.push("homcc.conf");
    if config_path.exists() {
        let config_str = fs::read_to_string(&config_path).context("reading config toml")?;
        return toml::from_str(&config_str).context("parsing config file");
    }

    Ok(T::default())
}

/// Raw client-side `[homcc]` table as it appears on disk, before environment
/// variable overrides are layered on top.
#[derive(Deserialize, Default, Debug, Clone)]
pub struct ClientConfigToml {
    pub compression: Option<String>,
    pub schroot_profile: Option<String>,
    pub docker_container: Option<String>,
    pub compilation_request_timeout: Option<f64>,
    pub establish_connection_timeout: Option<f64>,
    pub remote_compilation_tries: Option<u32>,
    pub log_level: Option<String>,
    pub verbose: Option<bool>,
    pub no_local_compilation: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub compression: Option<String>,
    pub schroot_profile: Option<String>,
    pub docker_container: Option<String>,
    pub compilation_request_timeout: f64,
    pub establish_connection_timeout: f64,
    pub remote_compilation_tries: u32,
    pub log_level: Option<String>,
    pub verbose: bool,
    pub no_local_compilation: bool,
}

impl From<ClientConfigToml> for ClientConfig {
    fn from(raw: ClientConfigToml) -> ClientConfig {
        ClientConfig {
            compression: raw.compression,
            schroot_profile: raw.schroot_profile,
            docker_container: raw.docker_container,
            compilation_request_timeout: raw
                .compilation_request_timeout
                .unwrap_or(DEFAULT_COMPILATION_REQUEST_TIMEOUT_SECS),
            establish_connection_timeout: raw
                .establish_connection_timeout
                .unwrap_or(DEFAULT_ESTABLISH_CONNECTION_TIMEOUT_SECS),
            remote_compilation_tries: raw
                .remote_compilation_tries
                .unwrap_or(DEFAULT_REMOTE_COMPILATION_TRIES),
            log_level: raw.log_level,
            verbose: raw.verbose.unwrap_or(false),
            no_local_compilation: raw.no_local_compilation.unwrap_or(false),
        }
    }
}

fn apply_client_env_overrides(config: &mut ClientConfigToml) {
    if let Ok(v) = std::env::var("HOMCC_COMPRESSION") {
        config.compression = Some(v);
    }
    if let Ok(v) = std::env::var("HOMCC_SCHROOT_PROFILE") {
        config.schroot_profile = Some(v);
    }
    if let Ok(v) = std::env::var("HOMCC_DOCKER_CONTAINER") {
        config.docker_container = Some(v);
    }
    if let Ok(v) = std::env::var("HOMCC_COMPILATION_REQUEST_TIMEOUT") {
        if let Ok(v) = v.parse() {
            config.compilation_request_timeout = Some(v);
        }
    }
    if let Ok(v) = std::env::var("HOMCC_ESTABLISH_CONNECTION_TIMEOUT") {
        if let Ok(v) = v.parse() {
            config.establish_connection_timeout = Some(v);
        }
    }
    if let Ok(v) = std::env::var("HOMCC_REMOTE_COMPILATION_TRIES") {
        if let Ok(v) = v.parse() {
            config.remote_compilation_tries = Some(v);
        }
    }
    if let Ok(v) = std::env::var("HOMCC_LOG_LEVEL") {
        config.log_level = Some(v);
    }
    if let Ok(v) = std::env::var("HOMCC_VERBOSE") {
        config.verbose = Some(parse_bool(&v));
    }
    if let Ok(v) = std::env::var("HOMCC_NO_LOCAL_COMPILATION") {
        config.no_local_compilation = Some(parse_bool(&v));
    }
}

/// Raw server-side `[homccd]` table as it appears on disk.
#[derive(Deserialize, Default, Debug, Clone)]
pub struct ServerConfigToml {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub limit: Option<usize>,
    pub log_level: Option<String>,
    pub verbose: Option<bool>,
    /// String like "100M" or "1G"; parsed into bytes by [`parse_cache_size`].
    pub max_dependency_cache_size: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub limit: usize,
    pub log_level: Option<String>,
    pub verbose: bool,
    pub max_dependency_cache_size_bytes: u64,
}

const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0";
const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024; // 10 GiB

impl From<ServerConfigToml> for ServerConfig {
    fn from(raw: ServerConfigToml) -> ServerConfig {
        let max_dependency_cache_size_bytes = raw
            .max_dependency_cache_size
            .as_deref()
            .and_then(|s| parse_cache_size(s).ok())
            .unwrap_or(DEFAULT_MAX_CACHE_SIZE_BYTES);

        ServerConfig {
            address: raw.address.unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string()),
            port: raw.port.unwrap_or(crate::consts::DEFAULT_PORT),
            limit: raw.limit.unwrap_or_else(|| {
                std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
            }),
            log_level: raw.log_level,
            verbose: raw.verbose.unwrap_or(false),
            max_dependency_cache_size_bytes,
        }
    }
}

fn apply_server_env_overrides(config: &mut ServerConfigToml) {
    if let Ok(v) = std::env::var("HOMCCD_LIMIT") {
        if let Ok(v) = v.parse() {
            config.limit = Some(v);
        }
    }
    if let Ok(v) = std::env::var("HOMCCD_PORT") {
        if let Ok(v) = v.parse() {
            config.port = Some(v);
        }
    }
    if let Ok(v) = std::env::var("HOMCCD_ADDRESS") {
        config.address = Some(v);
    }
    if let Ok(v) = std::env::var("HOMCCD_LOG_LEVEL") {
        config.log_level = Some(v);
    }
    if let Ok(v) = std::env::var("HOMCCD_VERBOSE") {
        config.verbose = Some(parse_bool(&v));
    }
    if let Ok(v) = std::env::var("HOMCCD_MAX_DEPENDENCY_CACHE_SIZE") {
        config.max_dependency_cache_size = Some(v);
    }
}

/// Parses sizes like `"100M"` or `"1G"` into bytes; only Mebibyte and
/// Gibibyte units are supported, matching the server's accepted format.
pub fn parse_cache_size(size_string: &str) -> anyhow::Result<u64> {
    let (amount, unit) = size_string.split_at(size_string.len().saturating_sub(1));
    let amount: u64 = amount.parse().with_context(|| format!("invalid size string: '{size_string}'"))?;
    match unit {
        "M" => Ok(amount * 1024 * 1024),
        "G" => Ok(amount * 1024 * 1024 * 1024),
        _ => Err(anyhow::anyhow!(
            "invalid size string: '{size_string}'. Specify either M (Mebibyte) or G (Gibibyte)"
        )),
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "1" | "yes" | "true" | "on")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_client_toml() {
        let raw: ClientConfigToml = toml::from_str(
            r#"
            compression = "lzma"
            verbose = true
            remote_compilation_tries = 5
            "#,
        )
        .unwrap();
        let config: ClientConfig = raw.into();
        assert_eq!(config.compression.as_deref(), Some("lzma"));
        assert!(config.verbose);
        assert_eq!(config.remote_compilation_tries, 5);
    }

    #[test]
    fn defaults_when_section_absent() {
        let raw: ClientConfigToml = toml::from_str("").unwrap();
        let config: ClientConfig = raw.into();
        assert_eq!(config.compilation_request_timeout, DEFAULT_COMPILATION_REQUEST_TIMEOUT_SECS);
        assert!(!config.no_local_compilation);
    }

    #[test]
    fn parses_cache_size_strings() {
        assert_eq!(parse_cache_size("100M").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_cache_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_cache_size("100X").is_err());
    }

    #[test]
    fn server_config_defaults() {
        let raw: ServerConfigToml = toml::from_str("").unwrap();
        let config: ServerConfig = raw.into();
        assert_eq!(config.address, DEFAULT_SERVER_ADDRESS);
        assert_eq!(config.max_dependency_cache_size_bytes, DEFAULT_MAX_CACHE_SIZE_BYTES);
    }
}
