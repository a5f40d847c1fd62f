// Copyright 2024 The homcc Authors
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

mod compression;
mod message;

pub use compression::Compression;
pub use message::{
    ArgumentMessage, CompilationResultMessage, DependencyReplyMessage, DependencyRequestMessage,
    Message, ObjectFileDescriptor, ParseError, ParseOutcome,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dependencies whose absolute path starts with one of these prefixes are
/// never sent by the client and never path-translated on the server: the
/// assumption is that server and client share a compatible system header
/// set. See the "dependency prefix exclusion" open question.
pub const EXCLUDED_DEPENDENCY_PREFIXES: &[&str] = &["/usr/include", "/usr/lib"];

/// Reserved compiler exit code meaning "transient failure, retry locally".
pub const EX_TEMPFAIL: i32 = 75;

/// `EX_USAGE` surfaced on recursive self-invocation detection.
pub const EX_USAGE: i32 = 64;
