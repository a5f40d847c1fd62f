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

//! Discovery of the list of candidate remote build hosts: `$HOMCC_HOSTS`
//! takes priority, then a hosts file is searched for at a handful of default
//! locations.

use std::path::{Path, PathBuf};

use crate::consts::HOSTS_ENV_VAR;
use crate::error::RecoverableClientError;
use crate::host::Host;

const HOMCC_DIR_ENV_VAR: &str = "HOMCC_DIR";

/// Default hosts file search order: `$HOMCC_DIR/hosts`, `~/.homcc/hosts`,
/// `~/.config/homcc/hosts`, `/etc/homcc/hosts`.
pub fn default_hosts_file_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();

    if let Ok(homcc_dir) = std::env::var(HOMCC_DIR_ENV_VAR) {
        locations.push(PathBuf::from(homcc_dir).join("hosts"));
    }

    if let Some(home) = home_dir() {
        let homcc_hosts = home.join(".homcc").join("hosts");
        if homcc_hosts.exists() {
            locations.push(homcc_hosts);
        }
        let config_hosts = home.join(".config").join("homcc").join("hosts");
        if config_hosts.exists() {
            locations.push(config_hosts);
        }
    }

    let etc_hosts = Path::new("/etc/homcc/hosts");
    if etc_hosts.exists() {
        locations.push(etc_hosts.to_path_buf());
    }

    locations
}

fn home_dir() -> Option<PathBuf> {
    crate::user::info().ok().map(|i| PathBuf::from(i.home_dir))
}

/// Loads raw host lines from `$HOMCC_HOSTS`, or else the first readable,
/// non-empty file among `hosts_file_locations` (or the defaults, if `None`).
pub fn load_host_lines(hosts_file_locations: Option<&[PathBuf]>) -> Result<Vec<String>, RecoverableClientError> {
    if let Ok(env_hosts) = std::env::var(HOSTS_ENV_VAR) {
        return Ok(filtered_lines(&env_hosts));
    }

    let owned;
    let locations: &[PathBuf] = match hosts_file_locations {
        Some(locations) => locations,
        None => {
            owned = default_hosts_file_locations();
            &owned
        }
    };

    for location in locations {
        if let Ok(metadata) = std::fs::metadata(location) {
            if metadata.len() == 0 {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(location) {
                return Ok(filtered_lines(&content));
            }
        }
    }

    Err(RecoverableClientError::NoHostsFound)
}

fn filtered_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim().replace(' ', ""))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

/// Loads and parses the configured hosts, erroring if none were found or a
/// line fails to parse.
pub fn load_hosts(hosts_file_locations: Option<&[PathBuf]>) -> Result<Vec<Host>, RecoverableClientError> {
    load_host_lines(hosts_file_locations)?.iter().map(|line| Host::parse(line)).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filters_comments_and_whitespace() {
        let text = "  buildhost/4  \n# a comment\n\nother:3126/2\n";
        assert_eq!(filtered_lines(text), vec!["buildhost/4".to_string(), "other:3126/2".to_string()]);
    }

    #[test]
    fn errors_without_env_or_files() {
        std::env::remove_var(HOSTS_ENV_VAR);
        assert!(load_host_lines(Some(&[])).is_err());
    }
}
