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

//! End-to-end dispatch: decide whether a compilation is sendable, find its
//! dependencies, pick a remote host, ship the job over the wire, and fall
//! back to local compilation when every remote attempt fails.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::arguments::Arguments;
use crate::compilers;
use crate::config::ClientConfig;
use crate::consts::{
    DEFAULT_EXPECTED_COMPILATION_TIME, DEFAULT_EXPECTED_PREPROCESSING_TIME, EX_TEMPFAIL,
    EXCLUDED_DEPENDENCY_PREFIXES, TCP_BUFFER_SIZE,
};
use crate::error::{ClientError, RecoverableClientError};
use crate::host::Host;
use crate::selector::RemoteHostSelector;
use crate::semaphore::Slot;
use crate::statefile::StateFile;
use homcc_protocol::{
    ArgumentMessage, CompilationResultMessage, Compression, DependencyReplyMessage, Message,
    ParseOutcome,
};

/// Failure coming out of the remote path: `Fatal` must be surfaced to the
/// caller as-is (no local fallback, e.g. a mid-compilation timeout), while
/// `Recoverable` falls back to local compilation unless the config forbids it.
enum RemoteFailure {
    Fatal(ClientError),
    Recoverable(ClientError),
}

/// Runs a compilation job: tries every configured remote host, then falls
/// back to local compilation. Returns the compiler's exit code.
pub fn dispatch(
    arguments: &Arguments,
    hosts: &[Host],
    localhost: &Host,
    config: &ClientConfig,
) -> Result<i32, ClientError> {
    if !arguments.is_sendable() || hosts.is_empty() {
        return compile_locally(arguments, localhost);
    }

    match compile_remotely(arguments, hosts, localhost, config) {
        Ok(return_code) => Ok(return_code),
        Err(RemoteFailure::Fatal(err)) => {
            warn!("remote compilation failed fatally, not falling back: {err}");
            Err(err)
        }
        Err(RemoteFailure::Recoverable(err)) => {
            if config.no_local_compilation {
                warn!("remote compilation failed and no_local_compilation is set: {err}");
                return Err(err);
            }
            warn!("remote compilation failed, falling back to local compilation: {err}");
            compile_locally(arguments, localhost)
        }
    }
}

fn compile_locally(arguments: &Arguments, localhost: &Host) -> Result<i32, ClientError> {
    let _slot =
        Slot::acquire_blocking(localhost, Duration::from_secs_f64(DEFAULT_EXPECTED_COMPILATION_TIME))?;
    let mut state = StateFile::new(arguments, localhost, &StateFile::default_state_dir())?;
    state.enter()?;
    state.set_compile()?;

    let result = arguments.execute(None)?;
    if !result.stdout.is_empty() {
        debug!("local stdout:\n{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        debug!("local stderr:\n{}", result.stderr);
    }
    Ok(result.return_code)
}

/// Runs dependency discovery standalone, for `--scan-includes`: the set of
/// paths that would be hashed and offered to a remote host for this
/// invocation, without actually dispatching anywhere.
pub fn list_dependencies(arguments: &Arguments) -> Vec<String> {
    let localhost = Host::default_preprocessing_localhost();
    let mut dependencies: Vec<String> = preprocess(arguments, &localhost)
        .map(|deps| deps.into_keys().collect())
        .unwrap_or_default();
    dependencies.sort();
    dependencies
}

fn preprocess(arguments: &Arguments, localhost: &Host) -> Result<HashMap<String, String>, ClientError> {
    let _slot = Slot::acquire_blocking(
        localhost,
        Duration::from_secs_f64(DEFAULT_EXPECTED_PREPROCESSING_TIME),
    )?;
    let mut state = StateFile::new(arguments, localhost, &StateFile::default_state_dir())?;
    state.enter()?;
    state.set_preprocessing()?;

    let find_deps = arguments.dependency_finding();
    let result = find_deps.execute(None)?;

    Ok(parse_dependency_dict(&result.stdout))
}

/// Parses the `-MM` style Makefile dependency rule into a map of
/// `path -> sha1 hex digest`, skipping system-header paths this build never
/// ships across the wire.
fn parse_dependency_dict(makefile_rule: &str) -> HashMap<String, String> {
    let mut dependencies = HashMap::new();

    let continued = makefile_rule.replace("\\\n", " ");
    for token in continued.split_whitespace() {
        if token.ends_with(':') {
            continue;
        }
        if EXCLUDED_DEPENDENCY_PREFIXES.iter().any(|prefix| token.starts_with(prefix)) {
            continue;
        }
        if let Ok(content) = std::fs::read(token) {
            dependencies.insert(token.to_string(), hash_bytes(&content));
        }
    }

    dependencies
}

fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

fn compile_remotely(
    arguments: &Arguments,
    hosts: &[Host],
    localhost: &Host,
    config: &ClientConfig,
) -> Result<i32, RemoteFailure> {
    let dependencies = preprocess(arguments, localhost).map_err(RemoteFailure::Recoverable)?;

    let selector = RemoteHostSelector::new(hosts.to_vec(), Some(config.remote_compilation_tries as usize))
        .map_err(|err| RemoteFailure::Recoverable(ClientError::Other(anyhow::anyhow!(err))))?;

    let mut failed_hosts = Vec::new();

    for mut host in selector {
        if host.compression == Compression::None {
            if let Some(name) = &config.compression {
                host.compression = Compression::from_name(Some(name));
            }
        }

        let slot = match Slot::try_acquire(&host) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                debug!("all compilation slots for host {host} are occupied");
                failed_hosts.push(host);
                continue;
            }
            Err(err) => {
                warn!("failed to acquire slot for host {host}: {err}");
                failed_hosts.push(host);
                continue;
            }
        };

        let mut state =
            StateFile::new(arguments, &host, &StateFile::default_state_dir()).map_err(RemoteFailure::Recoverable)?;
        state.enter().map_err(RemoteFailure::Recoverable)?;

        let deadline = Instant::now() + Duration::from_secs_f64(config.compilation_request_timeout);
        match compile_remotely_at(
            arguments,
            &dependencies,
            &host,
            Duration::from_secs_f64(config.establish_connection_timeout),
            deadline,
            &mut state,
            config,
        ) {
            Ok(Outcome::Done(return_code)) => return Ok(return_code),
            Ok(Outcome::FallBackLocal) => {
                // EX_TEMPFAIL: fall back to local compilation immediately,
                // rather than trying another host.
                return Err(RemoteFailure::Recoverable(ClientError::RemoteCompilation {
                    message: "server reported a temporary failure".to_string(),
                    return_code: EX_TEMPFAIL,
                }));
            }
            Err(AttemptError::Fatal(err)) => return Err(RemoteFailure::Fatal(err)),
            Err(AttemptError::Host(err)) => {
                warn!("compilation at host {host} failed: {err}");
                failed_hosts.push(host);
            }
        }

        drop(slot);
    }

    Err(RemoteFailure::Recoverable(ClientError::Recoverable(RecoverableClientError::RemoteHostsFailure)))
}

enum Outcome {
    Done(i32),
    /// The server reported `EX_TEMPFAIL`: fall back to local compilation
    /// immediately rather than trying another host.
    FallBackLocal,
}

/// A single host attempt either fails in a way that should move on to the
/// next host (`Host`), or in a way that must abort the whole dispatch
/// without falling back to local compilation (`Fatal`, e.g. a request that
/// timed out after the server had already started working on it).
enum AttemptError {
    Host(ClientError),
    Fatal(ClientError),
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

#[allow(clippy::too_many_arguments)]
fn compile_remotely_at(
    arguments: &Arguments,
    dependencies: &HashMap<String, String>,
    host: &Host,
    connect_timeout: Duration,
    deadline: Instant,
    state: &mut StateFile,
    config: &ClientConfig,
) -> Result<Outcome, AttemptError> {
    let address = format!("{}:{}", host.name, host.port);
    let mut stream = connect_with_timeout(&address, connect_timeout).map_err(AttemptError::Host)?;
    stream
        .set_read_timeout(Some(deadline.saturating_duration_since(Instant::now())))
        .map_err(|err| AttemptError::Host(ClientError::Io(err)))?;

    state.set_compile().map_err(AttemptError::Host)?;

    // the server only ever produces object files; linking happens locally
    let remote_arguments = arguments.no_linking();
    let cwd = std::env::current_dir().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();

    let target = compilers::from_str(remote_arguments.compiler()).and_then(|compiler| match compiler.target_triple() {
        Ok(triple) => Some(triple),
        Err(err) => {
            warn!("could not infer target triple for host {host}: {err}");
            None
        }
    });

    let message = Message::Argument(ArgumentMessage {
        arguments: remote_arguments.args().to_vec(),
        cwd,
        dependencies: dependencies.clone().into_iter().collect(),
        target,
        schroot_profile: config.schroot_profile.clone(),
        docker_container: config.docker_container.clone(),
        compression: host.compression,
    });
    send_message(&mut stream, &message).map_err(AttemptError::Host)?;

    // reverse map: sha1 -> path, to answer DependencyRequest messages
    let by_hash: HashMap<&String, &String> =
        dependencies.iter().map(|(path, hash)| (hash, path)).collect();

    loop {
        let response = match receive_message(&mut stream) {
            Ok(response) => response,
            Err(ClientError::Io(io_err)) if is_timeout(&io_err) => {
                return Err(AttemptError::Fatal(ClientError::Recoverable(
                    RecoverableClientError::RemoteCompilationTimeout(Duration::from_secs_f64(
                        config.compilation_request_timeout,
                    )),
                )));
            }
            Err(err) => return Err(AttemptError::Host(err)),
        };

        match response {
            Message::DependencyRequest(request) => {
                let path = by_hash.get(&request.sha1).ok_or_else(|| {
                    AttemptError::Host(ClientError::Other(anyhow::anyhow!("server requested unknown dependency")))
                })?;
                let content = std::fs::read(path).map_err(|err| AttemptError::Host(ClientError::Io(err)))?;
                let wire_bytes = host
                    .compression
                    .compress(&content)
                    .map_err(|err| AttemptError::Host(ClientError::Other(err)))?;
                send_message(&mut stream, &Message::DependencyReply(DependencyReplyMessage { content: wire_bytes }))
                    .map_err(AttemptError::Host)?;
            }
            Message::CompilationResult(result) => {
                return handle_result(arguments, result, host.compression).map_err(AttemptError::Host);
            }
            other => {
                return Err(AttemptError::Host(ClientError::Other(anyhow::anyhow!(
                    "received unexpected message type from host {host}: {other:?}"
                ))));
            }
        }
    }
}

fn handle_result(
    arguments: &Arguments,
    result: CompilationResultMessage,
    compression: Compression,
) -> Result<Outcome, ClientError> {
    if !result.stdout.is_empty() {
        debug!("host stdout:\n{}", result.stdout);
    }

    if result.return_code != 0 {
        if result.return_code == EX_TEMPFAIL {
            return Ok(Outcome::FallBackLocal);
        }
        return Err(ClientError::RemoteCompilation {
            message: result.stderr,
            return_code: result.return_code,
        });
    }

    for (descriptor, wire_bytes) in result.files.iter().zip(result.file_contents.iter()) {
        let content = compression
            .decompress(wire_bytes, descriptor.size)
            .map_err(ClientError::Other)?;
        std::fs::write(&descriptor.filename, content)?;
    }

    if arguments.is_linking() {
        info!("linking {} object file(s) locally", result.files.len());

        let source_to_object: HashMap<String, String> = arguments
            .source_files()
            .into_iter()
            .zip(result.files.iter().map(|f| f.filename.clone()))
            .collect();
        let link_arguments = arguments.replace_source_files_with_object_files(&source_to_object);
        let link_result = link_arguments.execute(None)?;

        for descriptor in &result.files {
            let _ = std::fs::remove_file(&descriptor.filename);
        }

        return Ok(Outcome::Done(link_result.return_code));
    }

    Ok(Outcome::Done(result.return_code))
}

fn connect_with_timeout(address: &str, timeout: Duration) -> Result<TcpStream, ClientError> {
    use std::net::ToSocketAddrs;

    let socket_addr = address
        .to_socket_addrs()
        .map_err(|_| ClientError::FailedHostNameResolution(address.to_string()))?
        .next()
        .ok_or_else(|| ClientError::FailedHostNameResolution(address.to_string()))?;

    TcpStream::connect_timeout(&socket_addr, timeout).map_err(ClientError::Io)
}

fn send_message(stream: &mut TcpStream, message: &Message) -> Result<(), ClientError> {
    let bytes = message.to_bytes().map_err(ClientError::Protocol)?;
    stream.write_all(&bytes)?;
    Ok(())
}

fn receive_message(stream: &mut TcpStream) -> Result<Message, ClientError> {
    let mut buf = Vec::with_capacity(TCP_BUFFER_SIZE);
    let mut chunk = vec![0u8; TCP_BUFFER_SIZE];

    loop {
        match Message::parse(&buf).map_err(ClientError::Protocol)? {
            ParseOutcome::Parsed { message, .. } => return Ok(message),
            ParseOutcome::NeedMoreBytes(_) => {
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    return Err(ClientError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed while waiting for a message",
                    )));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
