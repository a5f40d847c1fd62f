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

//! Cross-process slot semaphore used to bound how many concurrent
//! compilation/preprocessing/remote-dispatch jobs a single host (including
//! "localhost") may have in flight across every homcc client process running
//! on the machine.
//!
//! The original implementation keys a SysV named semaphore off
//! [`crate::host::Host::id`], which works but has a well known
//! create-or-attach race (see <https://semanchuk.com/philip/sysv_ipc/#sem_init>)
//! that has to be worked around with a sleep-and-poll loop. We sidestep the
//! race entirely with an flock'd counter file: `O_CREAT` file creation is
//! atomic, so there is no window where two processes both believe they
//! created the file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::debug;

use crate::host::Host;

fn semaphore_dir() -> PathBuf {
    std::env::temp_dir().join("homcc").join("slots")
}

fn semaphore_path(host: &Host) -> PathBuf {
    semaphore_dir().join(format!("{:04x}.slots", host.id()))
}

/// A held slot on a host's semaphore. Releasing the slot (incrementing the
/// counter back up) happens on drop so callers can't forget to release on an
/// early return.
pub struct Slot {
    file: Option<File>,
    limit: usize,
}

impl Slot {
    /// Attempts to acquire a slot without blocking. Used for remote hosts,
    /// where the client should immediately move on to another host rather
    /// than wait.
    pub fn try_acquire(host: &Host) -> anyhow::Result<Option<Slot>> {
        let (file, count) = open_and_lock(host)?;
        if count >= host.limit {
            release_lock(file)?;
            return Ok(None);
        }
        write_count(&file, count + 1)?;
        release_lock(file.try_clone().context("cloning semaphore fd")?)?;
        Ok(Some(Slot { file: Some(file), limit: host.limit }))
    }

    /// Blocks using an inverse exponential backoff: the initial timeout is
    /// `expected_job_time - 1` seconds, then shrinks by a factor of 2/3 each
    /// retry. Newer requests therefore wait comparatively longer than
    /// requests that have already been retrying for a while, which biases
    /// slot acquisition towards preserving the order jobs were submitted in.
    pub fn acquire_blocking(host: &Host, expected_job_time: Duration) -> anyhow::Result<Slot> {
        let mut timeout = expected_job_time.saturating_sub(Duration::from_secs(1));
        loop {
            if let Some(slot) = Self::try_acquire(host)? {
                return Ok(slot);
            }

            let deadline = Instant::now() + timeout.max(Duration::from_millis(1));
            while Instant::now() < deadline {
                if let Some(slot) = Self::try_acquire(host)? {
                    return Ok(slot);
                }
                std::thread::sleep(Duration::from_millis(20).min(timeout));
            }

            debug!("slot acquisition for host '{host}' timed out, backing off to {timeout:?}");
            timeout = (timeout / 3) * 2;
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else { return };
        if let Err(err) = release(file) {
            debug!("failed to release semaphore slot: {err}");
        }
    }
}

fn flock_exclusive(file: &File) -> anyhow::Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if res != 0 {
        return Err(std::io::Error::last_os_error()).context("flock(LOCK_EX) on semaphore file");
    }
    Ok(())
}

fn flock_unlock(file: &File) -> anyhow::Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if res != 0 {
        return Err(std::io::Error::last_os_error()).context("flock(LOCK_UN) on semaphore file");
    }
    Ok(())
}

/// Opens (creating if needed) the counter file for `host`, takes an
/// exclusive flock on it, and reads the current count. The lock is still
/// held when this returns; callers must release it via
/// [`release_lock`]/[`release`].
fn open_and_lock(host: &Host) -> anyhow::Result<(File, usize)> {
    let dir = semaphore_dir();
    std::fs::create_dir_all(&dir).context("creating semaphore directory")?;

    let path = semaphore_path(host);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .context("opening semaphore counter file")?;

    flock_exclusive(&file)?;

    let mut contents = String::new();
    file.read_to_string(&mut contents).context("reading semaphore counter")?;
    let count: usize = contents.trim().parse().unwrap_or(0);

    Ok((file, count))
}

fn write_count(file: &File, count: usize) -> anyhow::Result<()> {
    let mut file = file.try_clone().context("cloning semaphore fd")?;
    file.seek(SeekFrom::Start(0)).context("seeking semaphore counter")?;
    file.set_len(0).context("truncating semaphore counter")?;
    file.write_all(count.to_string().as_bytes()).context("writing semaphore counter")?;
    file.flush().context("flushing semaphore counter")?;
    Ok(())
}

fn release_lock(file: File) -> anyhow::Result<()> {
    flock_unlock(&file)
}

/// Decrements the held slot count and releases the flock, called when a
/// [`Slot`] is dropped.
fn release(file: File) -> anyhow::Result<()> {
    flock_exclusive(&file)?;

    let mut contents = String::new();
    let mut seekable = file.try_clone().context("cloning semaphore fd")?;
    seekable.seek(SeekFrom::Start(0)).context("seeking semaphore counter")?;
    seekable.read_to_string(&mut contents).context("reading semaphore counter")?;
    let count: usize = contents.trim().parse().unwrap_or(1);
    write_count(&file, count.saturating_sub(1))?;

    release_lock(file)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::ConnectionType;

    fn test_host(limit: usize) -> Host {
        use homcc_protocol::Compression;
        Host {
            connection_type: ConnectionType::Local,
            name: format!("semaphore-test-{}", std::process::id()),
            limit,
            compression: Compression::None,
            port: 0,
            user: None,
        }
    }

    #[test]
    fn acquires_and_releases_within_limit() {
        let host = test_host(2);
        let a = Slot::try_acquire(&host).unwrap();
        assert!(a.is_some());
        let b = Slot::try_acquire(&host).unwrap();
        assert!(b.is_some());
        let c = Slot::try_acquire(&host).unwrap();
        assert!(c.is_none(), "third slot should be exhausted");

        drop(a);
        let d = Slot::try_acquire(&host).unwrap();
        assert!(d.is_some(), "slot should be available again after release");
    }
}
