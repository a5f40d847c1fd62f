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

//! Binary client state file compatible with distcc's monitoring tools
//! (`distccmon-text`, `distccmon-gnome`). We replicate distcc's
//! `dcc_task_state` struct layout byte-for-byte so those tools keep working
//! unmodified against a homcc client.
//!
//! ```c
//! struct dcc_task_state {
//!     size_t struct_size;           // DISTCC_TASK_STATE_STRUCT_SIZE
//!     unsigned long magic;          // DISTCC_STATE_MAGIC
//!     unsigned long cpid;           // pid
//!     char file[128];               // source_base_filename
//!     char host[128];               // hostname
//!     int slot;                     // slot
//!     enum dcc_phase curr_phase;    // ClientPhase
//!     struct dcc_task_state *next;  // undefined for state file: 0
//! };
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::arguments::Arguments;
use crate::host::Host;

/// Client compilation phases, equivalent to `dcc_phase`. The unused
/// variants (1, 4, 6, 7) are never emitted by homcc but are kept so the
/// numbering matches distcc's enum exactly; monitors that switch on all
/// `dcc_phase` values depend on this.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Startup = 0,
    Connect = 2,
    Preprocess = 3,
    Compile = 5,
}

impl ClientPhase {
    fn from_i32(value: i32) -> Option<ClientPhase> {
        match value {
            0 => Some(ClientPhase::Startup),
            2 => Some(ClientPhase::Connect),
            3 => Some(ClientPhase::Preprocess),
            5 => Some(ClientPhase::Compile),
            _ => None,
        }
    }
}

const STRUCT_SIZE: u64 = 8 + 8 + 8 + 128 + 128 + 4 + 4 + 8; // matches "NLL128s128siiP" on a 64-bit host
const STATE_MAGIC: u64 = 0x4449_4800; // b"DIH\0"
const NEXT_TASK_STATE: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const NAME_FIELD_LEN: usize = 128;
const STATE_FILE_PREFIX: &str = "binstate";

pub struct StateFile {
    pid: u32,
    source_base_filename: String,
    hostname: String,
    slot: i32,
    phase: ClientPhase,
    filepath: PathBuf,
}

impl StateFile {
    pub fn default_state_dir() -> PathBuf {
        // shared with distcc so its monitoring tools pick up our state files too
        dirs_home().join(".distcc").join("state")
    }

    pub fn new(arguments: &Arguments, host: &Host, state_dir: &Path) -> std::io::Result<StateFile> {
        fs::create_dir_all(state_dir)?;

        let pid = std::process::id();

        let mut source_base_filename = if let Some(source) = arguments.source_files().first() {
            Path::new(source).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        } else if let Some(output) = arguments.output() {
            output
        } else {
            debug!("no monitoring string deducible for {arguments}");
            String::new()
        };
        if source_base_filename.len() > NAME_FIELD_LEN - 1 {
            warn!("trimming too long source base filename '{source_base_filename}'");
            source_base_filename.truncate(NAME_FIELD_LEN - 1);
        }

        let mut hostname = host.name.clone();
        if hostname.len() > NAME_FIELD_LEN - 1 {
            warn!("trimming too long hostname '{hostname}'");
            hostname.truncate(NAME_FIELD_LEN - 1);
        }

        let filepath = state_dir.join(format!("{STATE_FILE_PREFIX}_{pid}"));

        Ok(StateFile {
            pid,
            source_base_filename,
            hostname,
            slot: 0,
            phase: ClientPhase::Startup,
            filepath,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STRUCT_SIZE as usize);
        buf.write_u64::<LittleEndian>(STRUCT_SIZE).unwrap();
        buf.write_u64::<LittleEndian>(STATE_MAGIC).unwrap();
        buf.write_u64::<LittleEndian>(self.pid as u64).unwrap();
        write_fixed_str(&mut buf, &self.source_base_filename);
        write_fixed_str(&mut buf, &self.hostname);
        buf.write_i32::<LittleEndian>(self.slot).unwrap();
        buf.write_i32::<LittleEndian>(self.phase as i32).unwrap();
        buf.write_u64::<LittleEndian>(NEXT_TASK_STATE).unwrap();
        buf
    }

    pub fn from_bytes(mut buf: &[u8]) -> std::io::Result<StateFile> {
        let _struct_size = buf.read_u64::<LittleEndian>()?;
        let _magic = buf.read_u64::<LittleEndian>()?;
        let pid = buf.read_u64::<LittleEndian>()? as u32;
        let source_base_filename = read_fixed_str(&mut buf)?;
        let hostname = read_fixed_str(&mut buf)?;
        let slot = buf.read_i32::<LittleEndian>()?;
        let phase_raw = buf.read_i32::<LittleEndian>()?;
        let phase = ClientPhase::from_i32(phase_raw)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "unknown client phase"))?;
        let _next = buf.read_u64::<LittleEndian>()?;

        Ok(StateFile {
            pid,
            source_base_filename,
            hostname,
            slot,
            phase,
            filepath: PathBuf::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Creates the file on disk (if missing) and records the startup phase.
    pub fn enter(&mut self) -> std::io::Result<()> {
        match fs::OpenOptions::new().create_new(true).write(true).open(&self.filepath) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("state file '{}' already exists", self.filepath.display());
            }
            Err(err) => return Err(err),
        }
        self.set_startup()
    }

    pub fn exit(&self) {
        if let Err(err) = fs::remove_file(&self.filepath) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove state file '{}': {err}", self.filepath.display());
            }
        }
    }

    fn set_phase(&mut self, phase: ClientPhase) -> std::io::Result<()> {
        self.phase = phase;
        fs::write(&self.filepath, self.to_bytes())
    }

    pub fn set_startup(&mut self) -> std::io::Result<()> {
        self.set_phase(ClientPhase::Startup)
    }

    pub fn set_connect(&mut self) -> std::io::Result<()> {
        self.set_phase(ClientPhase::Connect)
    }

    pub fn set_preprocessing(&mut self) -> std::io::Result<()> {
        self.set_phase(ClientPhase::Preprocess)
    }

    pub fn set_compile(&mut self) -> std::io::Result<()> {
        self.set_phase(ClientPhase::Compile)
    }
}

impl Drop for StateFile {
    fn drop(&mut self) {
        if !self.filepath.as_os_str().is_empty() {
            self.exit();
        }
    }
}

fn write_fixed_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(NAME_FIELD_LEN);
    buf.extend_from_slice(&bytes[..len]);
    buf.resize(buf.len() + (NAME_FIELD_LEN - len), 0);
}

fn read_fixed_str(buf: &mut &[u8]) -> std::io::Result<String> {
    if buf.len() < NAME_FIELD_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated state file"));
    }
    let (field, rest) = buf.split_at(NAME_FIELD_LEN);
    *buf = rest;
    let nul = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Ok(String::from_utf8_lossy(&field[..nul]).into_owned())
}

fn dirs_home() -> PathBuf {
    crate::user::info().map(|i| PathBuf::from(i.home_dir)).unwrap_or_else(|_| PathBuf::from("/"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::localhost_with_limit(4);
        let args = Arguments::new("gcc", ["-c".to_string(), "main.c".to_string()]);
        let mut state = StateFile::new(&args, &host, dir.path()).unwrap();
        state.set_compile().unwrap();

        let bytes = state.to_bytes();
        assert_eq!(bytes.len(), STRUCT_SIZE as usize);

        let restored = StateFile::from_bytes(&bytes).unwrap();
        assert_eq!(restored.pid, state.pid);
        assert_eq!(restored.source_base_filename, "main.c");
        assert_eq!(restored.phase(), ClientPhase::Compile);
    }

    #[test]
    fn enter_creates_file_and_exit_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::localhost_with_limit(4);
        let args = Arguments::new("gcc", ["-c".to_string(), "main.c".to_string()]);
        let mut state = StateFile::new(&args, &host, dir.path()).unwrap();
        state.enter().unwrap();
        assert!(state.filepath.exists());
        state.exit();
        assert!(!state.filepath.exists());
    }

    #[test]
    fn trims_overlong_names() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::localhost_with_limit(4);
        let long_name = "a".repeat(200) + ".c";
        let args = Arguments::new("gcc", ["-c".to_string(), long_name]);
        let state = StateFile::new(&args, &host, dir.path()).unwrap();
        assert!(state.source_base_filename.len() <= NAME_FIELD_LEN - 1);
    }
}
