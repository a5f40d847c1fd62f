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

//! Server-side content addressed header/dependency cache with LRU eviction.
//! [`IndexMap`] stands in for Python's `OrderedDict` + `move_to_end`: both
//! give us insertion-ordered iteration plus O(1) "move this key to the most
//! recently used end" via `shift_remove` + re-`insert`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use indexmap::IndexSet;
use tracing::{error, info};

pub struct Cache {
    folder: PathBuf,
    max_size_bytes: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    /// sha1 hexdigest -> insertion order, most-recently-used at the back.
    entries: IndexSet<String>,
    current_size_bytes: u64,
}

impl Cache {
    pub fn new(root_folder: &Path, max_size_bytes: u64) -> anyhow::Result<Cache> {
        if max_size_bytes == 0 {
            return Err(anyhow!("maximum size of cache must be strictly positive"));
        }

        let folder = root_folder.join("cache");
        std::fs::create_dir_all(&folder).context("creating cache folder")?;
        info!("created cache folder in '{}'", folder.display());

        Ok(Cache {
            folder,
            max_size_bytes,
            inner: Mutex::new(Inner { entries: IndexSet::new(), current_size_bytes: 0 }),
        })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.folder.join(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let contained = inner.entries.contains(hash);
        if contained {
            touch(&mut inner.entries, hash);
        }
        contained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the path of a cached dependency, marking it most recently
    /// used. Panics if `hash` is not present; callers must check
    /// [`Cache::contains`] first, mirroring the Python `__getitem__`
    /// contract this is adapted from.
    pub fn get(&self, hash: &str) -> PathBuf {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        touch(&mut inner.entries, hash);
        self.path_for(hash)
    }

    pub fn put(&self, hash: &str, content: &[u8]) -> anyhow::Result<()> {
        if content.len() as u64 > self.max_size_bytes {
            error!(
                "file with hash '{hash}' can not be added to cache: size {} exceeds max cache size {}",
                content.len(),
                self.max_size_bytes
            );
            return Err(anyhow!("cache size insufficient"));
        }

        let path = self.path_for(hash);
        let mut inner = self.inner.lock().expect("cache mutex poisoned");

        while inner.current_size_bytes + content.len() as u64 > self.max_size_bytes {
            self.evict_oldest(&mut inner)?;
        }

        std::fs::write(&path, content).context("writing cache entry")?;
        inner.current_size_bytes += content.len() as u64;
        inner.entries.insert(hash.to_string());

        Ok(())
    }

    fn evict_oldest(&self, inner: &mut Inner) -> anyhow::Result<()> {
        let oldest = inner
            .entries
            .shift_remove_index(0)
            .ok_or_else(|| anyhow!("tried to evict from an empty cache"))?;
        let path = self.path_for(&oldest);

        match std::fs::metadata(&path) {
            Ok(metadata) => {
                inner.current_size_bytes = inner.current_size_bytes.saturating_sub(metadata.len());
                std::fs::remove_file(&path).context("removing evicted cache entry")?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                error!(
                    "tried to evict cache entry '{oldest}', but '{}' did not exist; cache size \
                     calculation may now be inaccurate",
                    path.display()
                );
            }
            Err(err) => return Err(err).context("stat-ing evicted cache entry"),
        }

        Ok(())
    }
}

fn touch(entries: &mut IndexSet<String>, hash: &str) {
    if let Some(index) = entries.get_index_of(hash) {
        entries.shift_remove_index(index);
        entries.insert(hash.to_string());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1024).unwrap();
        cache.put("abc", b"hello").unwrap();
        assert!(cache.contains("abc"));
        let path = cache.get("abc");
        assert_eq!(std::fs::read(path).unwrap(), b"hello");
    }

    #[test]
    fn evicts_oldest_when_over_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10).unwrap();
        cache.put("a", b"12345").unwrap();
        cache.put("b", b"12345").unwrap();
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));

        // pushes total size to 15 > 10, evicting "a" since it's oldest
        cache.put("c", b"12345").unwrap();
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn rejects_content_larger_than_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 4).unwrap();
        assert!(cache.put("a", b"12345").is_err());
    }

    #[test]
    fn contains_marks_entry_most_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10).unwrap();
        cache.put("a", b"12345").unwrap();
        cache.put("b", b"12345").unwrap();

        // touch "a" so "b" becomes the oldest
        assert!(cache.contains("a"));
        cache.put("c", b"12345").unwrap();
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
    }
}
