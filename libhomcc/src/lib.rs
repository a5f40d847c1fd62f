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

//! Core library backing both the `homcc` client wrapper and the `homccd`
//! server daemon: argument parsing, the wire dispatch engine, the server's
//! compile-job state machine, and the shared configuration/host/cache
//! machinery both sides need.

pub mod arguments;
pub mod cache;
pub mod client;
pub mod compilers;
pub mod config;
pub mod consts;
pub mod error;
pub mod host;
pub mod hosts;
pub mod selector;
pub mod semaphore;
pub mod server;
pub mod statefile;
pub mod user;
