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

//! Typed error taxonomy for client and server logic. `anyhow` is still used
//! at the binary boundary for context-rich top level errors, but a few error
//! kinds need to be matched on (to decide an exit code, or whether a failure
//! is recoverable by falling back to local compilation), so those get their
//! own `thiserror` types.

use thiserror::Error;

/// Typed errors the client dispatcher needs to match on by kind. Most of
/// these are recovered from by falling back to local compilation, but
/// `RemoteCompilationTimeout` is the one exception: a request the server may
/// already be acting on timing out is treated as fatal (see
/// `client::dispatcher::RemoteFailure`), not silently retried locally.
#[derive(Error, Debug)]
pub enum RecoverableClientError {
    #[error("could not infer the compilation target triple: {0}")]
    TargetInferation(String),

    #[error("remote compilation request timed out after {0:?}")]
    RemoteCompilationTimeout(std::time::Duration),

    #[error("failed to parse a message from the server: {0}")]
    ClientParsing(String),

    #[error("received a message of an unexpected type")]
    UnexpectedMessageType,

    #[error("the compilation request was refused by all hosts")]
    RemoteHostsFailure,

    #[error(
        "no hosts were found! Please specify them via the HOMCC_HOSTS environment variable or a \
         dedicated hosts file like '~/.homcc/hosts'."
    )]
    NoHostsFound,

    #[error("host '{0}' could not be parsed correctly, please provide it in the correct format")]
    HostParsing(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Recoverable(#[from] RecoverableClientError),

    #[error("all slots of host '{0}' are exhausted")]
    SlotsExhausted(String),

    #[error("could not resolve host name '{0}'")]
    FailedHostNameResolution(String),

    #[error("remote compilation failed with exit code {return_code}: {message}")]
    RemoteCompilation { message: String, return_code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] homcc_protocol::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server initialization failed: {0}")]
    Initialization(String),

    #[error("compiler '{0}' is currently not supported")]
    UnsupportedCompiler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] homcc_protocol::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
