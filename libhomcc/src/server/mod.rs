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

pub mod sandbox;
pub mod session;
pub mod signals;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{error, info, instrument};

use crate::cache::Cache;
use crate::config::ServerConfig;

pub struct Server {
    cache: Arc<Cache>,
    limit: ConcurrencyLimit,
}

/// Caps the number of compile jobs running at once. `std::sync` has no
/// counting semaphore, so this is the usual `Mutex<usize>` + `Condvar` pair.
struct ConcurrencyLimit {
    permits: Mutex<usize>,
    condvar: Condvar,
}

struct Permit<'a> {
    limit: &'a ConcurrencyLimit,
}

impl ConcurrencyLimit {
    fn new(permits: usize) -> ConcurrencyLimit {
        ConcurrencyLimit { permits: Mutex::new(permits), condvar: Condvar::new() }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut permits = self.permits.lock().expect("concurrency limit mutex poisoned");
        while *permits == 0 {
            permits = self.condvar.wait(permits).expect("concurrency limit mutex poisoned");
        }
        *permits -= 1;
        Permit { limit: self }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut permits = self.limit.permits.lock().expect("concurrency limit mutex poisoned");
        *permits += 1;
        self.limit.condvar.notify_one();
    }
}

impl Server {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Arc<Server>> {
        let cache_root = std::env::temp_dir().join("homccd");
        std::fs::create_dir_all(&cache_root)?;
        let cache = Arc::new(Cache::new(&cache_root, config.max_dependency_cache_size_bytes)?);
        let limit = ConcurrencyLimit::new(config.limit);

        Ok(Arc::new(Server { cache, limit }))
    }

    /// Binds and runs the accept loop: one worker thread per connection,
    /// bounded by `limit` concurrently compiling at a time.
    #[instrument(skip_all)]
    pub fn serve(server: Arc<Server>, config: &ServerConfig) -> anyhow::Result<()> {
        let address: std::net::IpAddr = config.address.parse()?;
        let listener = TcpListener::bind(SocketAddr::new(address, config.port))?;
        info!("homccd listening on {}", listener.local_addr()?);

        let conn_counter = AtomicUsize::new(0);
        for stream in listener.incoming() {
            let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed);
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        let _permit = server.limit.acquire();
                        if let Err(err) = session::handle_connection(stream, &server.cache) {
                            error!("connection {conn_id} failed: {err:?}");
                        }
                    });
                }
                Err(err) => {
                    error!("accepting connection: {err:?}");
                }
            }
        }

        Ok(())
    }
}
