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

//! Host description and the grammar used to parse `HOMCC_HOSTS`/hosts-file
//! lines into [`Host`] values.

use std::fmt;

use homcc_protocol::Compression;
use sha1::{Digest, Sha1};

use crate::consts::{DEFAULT_LOCALHOST_LIMIT, DEFAULT_PORT, DEFAULT_REMOTE_HOST_LIMIT};
use crate::error::RecoverableClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Local,
    Tcp,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub connection_type: ConnectionType,
    pub name: String,
    pub limit: usize,
    pub compression: Compression,
    pub port: u16,
    pub user: Option<String>,
}

impl Host {
    pub fn localhost_with_limit(limit: usize) -> Host {
        Host {
            connection_type: ConnectionType::Local,
            name: "localhost".into(),
            limit,
            compression: Compression::None,
            port: DEFAULT_PORT,
            user: None,
        }
    }

    pub fn preprocessing_localhost_with_limit(limit: usize) -> Host {
        Host {
            connection_type: ConnectionType::Local,
            name: "preprocessing".into(),
            limit,
            compression: Compression::None,
            port: DEFAULT_PORT,
            user: None,
        }
    }

    pub fn default_compilation_localhost() -> Host {
        Host::localhost_with_limit(local_concurrency())
    }

    pub fn default_preprocessing_localhost() -> Host {
        Host::preprocessing_localhost_with_limit(local_concurrency())
    }

    pub fn is_local(&self) -> bool {
        self.connection_type == ConnectionType::Local
    }

    /// 16-bit id used as the key of the local slot semaphore for this host.
    /// Matches the distcc-adjacent scheme of hashing the host's string form
    /// and truncating, since we can not exceed `SHRT_MAX` for a portable
    /// semaphore key.
    pub fn id(&self) -> u16 {
        let mut hasher = Sha1::new();
        hasher.update(self.to_string().as_bytes());
        let digest = hasher.finalize();
        // first two bytes of the digest, mirroring a truncated hex-to-int read
        (u16::from(digest[0]) << 8 | u16::from(digest[1])) % 10_000
    }

    pub fn parse(host: &str) -> Result<Host, RecoverableClientError> {
        parse_host(host)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection_type {
            ConnectionType::Local => write!(f, "{}_{}", self.name, self.limit),
            ConnectionType::Tcp => write!(f, "tcp_{}_{}_{}", self.name, self.port, self.limit),
            ConnectionType::Ssh => {
                write!(f, "ssh_{}_{}_{}", self.user.as_deref().unwrap_or(""), self.name, self.limit)
            }
        }
    }
}

fn local_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(DEFAULT_LOCALHOST_LIMIT)
}

/// Parses the homcc host grammar:
///
/// ```text
/// NAME
/// NAME/LIMIT
/// NAME:PORT[/LIMIT]
/// [IPv6]:PORT[/LIMIT]
/// @NAME[/LIMIT]
/// USER@NAME[/LIMIT]
/// ```
///
/// with an optional trailing `,COMPRESSION` and `#COMMENT` applied before
/// any of the above is considered.
fn parse_host(host: &str) -> Result<Host, RecoverableClientError> {
    let mut host = host;

    // trim trailing comment: HOST#COMMENT
    if let Some((before, _)) = host.split_once('#') {
        host = before;
    }

    let mut compression = None;
    // trailing compression info: HOST,COMPRESSION
    if let Some((before, comp)) = host.rsplit_once(',') {
        host = before;
        compression = Some(comp);
    }

    if host.is_empty() {
        return Err(RecoverableClientError::HostParsing(host.to_string()));
    }

    // NAME:PORT[/LIMIT] or [IPv6]:PORT[/LIMIT]
    if let Some(parsed) = try_parse_tcp_with_port(host, compression) {
        return parsed;
    }

    let (connection_type, user, mut rest) = if let Some((user, name)) = split_user_at(host) {
        (ConnectionType::Ssh, Some(user.to_string()), name)
    } else if let Some(name) = host.strip_prefix('@') {
        (ConnectionType::Ssh, None, name)
    } else {
        (ConnectionType::Tcp, None, host)
    };

    let mut limit = None;
    if let Some((name, lim)) = rest.rsplit_once('/') {
        if !lim.is_empty() && lim.chars().all(|c| c.is_ascii_digit()) {
            limit = lim.parse().ok();
            rest = name;
        }
    }

    if rest.is_empty() || !is_valid_name(rest) {
        return Err(RecoverableClientError::HostParsing(host.to_string()));
    }

    let name = if connection_type == ConnectionType::Local { "localhost" } else { rest };
    let connection_type =
        if name == "localhost" { ConnectionType::Local } else { connection_type };

    Ok(Host {
        connection_type,
        name: name.to_string(),
        limit: limit.unwrap_or_else(|| default_limit(connection_type)),
        compression: Compression::from_name(compression),
        port: DEFAULT_PORT,
        user,
    })
}

fn try_parse_tcp_with_port(
    host: &str,
    compression: Option<&str>,
) -> Option<Result<Host, RecoverableClientError>> {
    let (name, after_name) = if let Some(rest) = host.strip_prefix('[') {
        let (name, after) = rest.split_once(']')?;
        (name, after)
    } else {
        let colon = host.find(':')?;
        let (name, after) = host.split_at(colon);
        if !is_valid_name(name) {
            return None;
        }
        (name, after)
    };

    let after_name = after_name.strip_prefix(':')?;
    if after_name.is_empty() {
        return None;
    }

    let (port_str, limit) = match after_name.split_once('/') {
        Some((p, l)) => (p, Some(l)),
        None => (after_name, None),
    };

    if port_str.is_empty() || !port_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let port: u16 = match port_str.parse() {
        Ok(p) => p,
        Err(_) => return Some(Err(RecoverableClientError::HostParsing(host.to_string()))),
    };

    let limit = match limit {
        Some(l) if !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()) => match l.parse() {
            Ok(v) => Some(v),
            Err(_) => return Some(Err(RecoverableClientError::HostParsing(host.to_string()))),
        },
        Some(_) => return Some(Err(RecoverableClientError::HostParsing(host.to_string()))),
        None => None,
    };

    Some(Ok(Host {
        connection_type: ConnectionType::Tcp,
        name: name.to_string(),
        limit: limit.unwrap_or(DEFAULT_REMOTE_HOST_LIMIT),
        compression: Compression::from_name(compression),
        port,
        user: None,
    }))
}

fn split_user_at(host: &str) -> Option<(&str, &str)> {
    let (user, name) = host.split_once('@')?;
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((user, name))
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '-' | '_'))
}

fn default_limit(connection_type: ConnectionType) -> usize {
    match connection_type {
        ConnectionType::Local => DEFAULT_LOCALHOST_LIMIT,
        ConnectionType::Tcp | ConnectionType::Ssh => DEFAULT_REMOTE_HOST_LIMIT,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_name() {
        let host = Host::parse("buildhost").unwrap();
        assert_eq!(host.connection_type, ConnectionType::Tcp);
        assert_eq!(host.name, "buildhost");
        assert_eq!(host.limit, DEFAULT_REMOTE_HOST_LIMIT);
    }

    #[test]
    fn parses_name_with_limit() {
        let host = Host::parse("buildhost/8").unwrap();
        assert_eq!(host.name, "buildhost");
        assert_eq!(host.limit, 8);
    }

    #[test]
    fn parses_name_port_limit() {
        let host = Host::parse("buildhost:3126/4").unwrap();
        assert_eq!(host.connection_type, ConnectionType::Tcp);
        assert_eq!(host.name, "buildhost");
        assert_eq!(host.port, 3126);
        assert_eq!(host.limit, 4);
    }

    #[test]
    fn parses_ipv6_with_port() {
        let host = Host::parse("[::1]:3126").unwrap();
        assert_eq!(host.name, "::1");
        assert_eq!(host.port, 3126);
    }

    #[test]
    fn parses_ssh_user_host() {
        let host = Host::parse("alice@buildhost/3").unwrap();
        assert_eq!(host.connection_type, ConnectionType::Ssh);
        assert_eq!(host.user.as_deref(), Some("alice"));
        assert_eq!(host.name, "buildhost");
        assert_eq!(host.limit, 3);
    }

    #[test]
    fn parses_at_host() {
        let host = Host::parse("@buildhost").unwrap();
        assert_eq!(host.connection_type, ConnectionType::Ssh);
        assert_eq!(host.user, None);
    }

    #[test]
    fn parses_compression_suffix_and_comment() {
        let host = Host::parse("buildhost/2,lzma#a comment").unwrap();
        assert_eq!(host.compression, Compression::Lzma);
        assert_eq!(host.limit, 2);
    }

    #[test]
    fn localhost_name_forces_local_connection_type() {
        let host = Host::parse("localhost/4").unwrap();
        assert!(host.is_local());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(Host::parse("").is_err());
    }

    #[test]
    fn id_is_stable_for_equal_hosts() {
        let a = Host::parse("buildhost/4").unwrap();
        let b = Host::parse("buildhost/4").unwrap();
        assert_eq!(a.id(), b.id());
    }
}
