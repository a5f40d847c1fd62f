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

//! The compile job state machine driving a single accepted connection:
//! receive the argument message, negotiate any dependencies the cache
//! doesn't already have, compile inside a fresh sandbox, and reply with the
//! resulting object files.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::arguments::Arguments;
use crate::cache::Cache;
use crate::compilers;
use crate::consts::{DWARF_FILE_SUFFIX, TCP_BUFFER_SIZE};
use crate::error::ServerError;
use crate::server::sandbox::{resolve_environment, Sandbox};
use homcc_protocol::{
    ArgumentMessage, CompilationResultMessage, DependencyRequestMessage, Message,
    ObjectFileDescriptor, ParseOutcome,
};

const EX_TEMPFAIL: i32 = homcc_protocol::EX_TEMPFAIL;

/// Drives one client connection end to end. Errors here are connection
/// failures; compiler failures are reported to the client as a
/// `CompilationResultMessage` with a non-zero return code instead.
pub fn handle_connection(mut stream: TcpStream, cache: &Cache) -> Result<(), ServerError> {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "<unknown>".into());
    info!("accepted connection from {peer}");

    let request = match receive_message(&mut stream)? {
        Message::Argument(request) => request,
        other => {
            warn!("expected an ArgumentMessage from {peer}, got {other:?}");
            return Ok(());
        }
    };

    let result = match compile(&mut stream, cache, &request) {
        Ok(result) => result,
        Err(err) => {
            warn!("compile job from {peer} failed: {err}");
            CompilationResultMessage {
                files: vec![],
                file_contents: vec![],
                stdout: String::new(),
                stderr: err.to_string(),
                return_code: EX_TEMPFAIL,
            }
        }
    };

    send_message(&mut stream, &Message::CompilationResult(result))?;
    Ok(())
}

fn compile(
    stream: &mut TcpStream,
    cache: &Cache,
    request: &ArgumentMessage,
) -> anyhow::Result<CompilationResultMessage> {
    let sandbox = Sandbox::new()?;
    let mapped_cwd = sandbox.map_cwd(&request.cwd);
    std::fs::create_dir_all(&mapped_cwd)?;

    materialize_dependencies(stream, cache, request)?;

    let mapped_dependencies = sandbox.map_dependencies(&mapped_cwd, &request.dependencies);
    for (path, sha1) in &mapped_dependencies {
        let cached_path = cache.get(sha1);
        let content = std::fs::read(&cached_path)?;
        sandbox.write_dependency(path, &content)?;
    }

    let arguments = Arguments::from_vec(request.arguments.clone());
    let mapped_arguments = sandbox.map_arguments(&mapped_cwd, &arguments);

    let compiler_arguments = match &request.target {
        Some(target) => {
            let compiler = compilers::from_str(mapped_arguments.compiler())
                .ok_or_else(|| ServerError::UnsupportedCompiler(mapped_arguments.compiler().to_string()))?;
            compiler.with_target(&mapped_arguments, target)
        }
        None => mapped_arguments,
    };

    let environment = resolve_environment(request.schroot_profile.clone(), request.docker_container.clone());
    let sandboxed_arguments = environment.transform(&compiler_arguments);

    let source_files = arguments.source_files();
    let object_files: Vec<PathBuf> =
        source_files.iter().map(|source| object_file_path(&mapped_cwd, source)).collect();

    let result = sandboxed_arguments.execute(Some(&mapped_cwd.to_string_lossy()))?;

    let mut files = Vec::new();
    let mut file_contents = Vec::new();
    if result.return_code == 0 {
        for object_file in &object_files {
            let content = std::fs::read(object_file)?;
            let wire_bytes = request.compression.compress(&content)?;
            files.push(ObjectFileDescriptor {
                filename: object_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: wire_bytes.len(),
            });
            file_contents.push(wire_bytes);

            // -gsplit-dwarf emits a sibling `.dwo` next to the object file; ship
            // it back alongside if the compiler produced one.
            let dwarf_file = object_file.with_extension(DWARF_FILE_SUFFIX.trim_start_matches('.'));
            if dwarf_file.is_file() {
                let dwarf_content = std::fs::read(&dwarf_file)?;
                let dwarf_wire_bytes = request.compression.compress(&dwarf_content)?;
                files.push(ObjectFileDescriptor {
                    filename: dwarf_file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    size: dwarf_wire_bytes.len(),
                });
                file_contents.push(dwarf_wire_bytes);
            }
        }
    }

    Ok(CompilationResultMessage {
        files,
        file_contents,
        stdout: result.stdout,
        stderr: result.stderr,
        return_code: result.return_code,
    })
}

/// Source file paths become object files named after their stem, matching
/// the distcc/homcc convention of compiling each translation unit to
/// `<stem>.o` in the job's instance directory regardless of the source's
/// original extension.
fn object_file_path(mapped_cwd: &PathBuf, source: &str) -> PathBuf {
    let stem = std::path::Path::new(source).file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    mapped_cwd.join(format!("{stem}.o"))
}

fn materialize_dependencies(
    stream: &mut TcpStream,
    cache: &Cache,
    request: &ArgumentMessage,
) -> anyhow::Result<()> {
    for sha1 in request.dependencies.values() {
        if cache.contains(sha1) {
            debug!("dependency '{sha1}' already cached");
            continue;
        }

        send_message(stream, &Message::DependencyRequest(DependencyRequestMessage { sha1: sha1.clone() }))?;

        match receive_message(stream)? {
            Message::DependencyReply(reply) => {
                let content = request.compression.decompress(&reply.content, 0)?;

                let mut hasher = Sha1::new();
                hasher.update(&content);
                let retrieved_hash = hex::encode(hasher.finalize());
                if &retrieved_hash != sha1 {
                    anyhow::bail!(
                        "dependency content does not match requested hash: expected '{sha1}', got '{retrieved_hash}'"
                    );
                }

                cache.put(sha1, &content)?;
            }
            other => anyhow::bail!("expected a DependencyReply, got {other:?}"),
        }
    }
    Ok(())
}

fn send_message(stream: &mut TcpStream, message: &Message) -> Result<(), ServerError> {
    let bytes = message.to_bytes().map_err(ServerError::Protocol)?;
    stream.write_all(&bytes)?;
    Ok(())
}

fn receive_message(stream: &mut TcpStream) -> Result<Message, ServerError> {
    let mut buf = Vec::with_capacity(TCP_BUFFER_SIZE);
    let mut chunk = vec![0u8; TCP_BUFFER_SIZE];

    loop {
        match Message::parse(&buf).map_err(ServerError::Protocol)? {
            ParseOutcome::Parsed { message, .. } => return Ok(message),
            ParseOutcome::NeedMoreBytes(_) => {
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    return Err(ServerError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed while waiting for a message",
                    )));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
