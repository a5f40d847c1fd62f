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

use std::time;

pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);
pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

/// Read/write buffer size for TCP connections.
pub const TCP_BUFFER_SIZE: usize = 65_536;

pub const DEFAULT_PORT: u16 = 3126;

/// Enable minor levels of concurrency for defaulted hosts.
pub const DEFAULT_LOCALHOST_LIMIT: usize = 4;
pub const DEFAULT_REMOTE_HOST_LIMIT: usize = 2;

/// Default expected job times used to size the inverse exponential backoff
/// of the local slot semaphores, in seconds.
pub const DEFAULT_EXPECTED_COMPILATION_TIME: f64 = 10.0;
pub const DEFAULT_EXPECTED_PREPROCESSING_TIME: f64 = 3.0;

/// Suffix for fission/DWARF debug info files.
pub const DWARF_FILE_SUFFIX: &str = ".dwo";

/// Dependencies under these paths are never sent by the client and never
/// path-translated on the server.
pub const EXCLUDED_DEPENDENCY_PREFIXES: &[&str] = homcc_protocol::EXCLUDED_DEPENDENCY_PREFIXES;

/// Environment variable carrying a `;`-separated list of hosts, checked
/// before any hosts file.
pub const HOSTS_ENV_VAR: &str = "HOMCC_HOSTS";

/// Environment variable used to detect recursive self-invocation: homcc sets
/// this before it shells out to the local compiler so that, if that
/// subprocess is itself `homcc` (e.g. because the user's PATH points a
/// compiler name back at homcc), the recursive call can refuse to proceed.
pub const RECURSION_SENTINEL_VAR: &str = "HOMCC_RECURSION_SENTINEL";

/// Reserved compiler exit code meaning "transient failure, retry locally".
pub const EX_TEMPFAIL: i32 = homcc_protocol::EX_TEMPFAIL;

/// Exit code surfaced on recursive self-invocation detection or other usage
/// errors.
pub const EX_USAGE: i32 = homcc_protocol::EX_USAGE;
