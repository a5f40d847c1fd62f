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

use std::collections::BTreeMap;

use byteorder::{LittleEndian, WriteBytesExt as _};
use serde_derive::{Deserialize, Serialize};

use crate::Compression;

/// The number of bytes occupied by the little-endian `json_size` prefix
/// that precedes every message's JSON header.
const JSON_SIZE_PREFIX_LEN: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("malformed JSON message header: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message declared a negative size of {0}")]
    NegativeSize(i64),
}

/// The result of feeding a byte buffer to [`Message::parse`]. Mirrors the
/// `(delta, message)` contract from the protocol description: a positive
/// delta means more bytes are needed, zero means the buffer held exactly
/// one message, and a negative delta means the buffer holds `|delta|` bytes
/// belonging to a subsequent message.
#[derive(Debug)]
pub enum ParseOutcome {
    NeedMoreBytes(usize),
    Parsed { message: Message, tail_overrun: isize },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ObjectFileDescriptor {
    pub filename: String,
    /// Number of bytes this file occupies on the wire, i.e. after whatever
    /// compression the connection negotiated. Decompression, once the exact
    /// bytes are in hand, recovers the original length implicitly.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentMessage {
    pub arguments: Vec<String>,
    pub cwd: String,
    /// absolute client-side path -> sha1 hex digest
    pub dependencies: BTreeMap<String, String>,
    pub target: Option<String>,
    pub schroot_profile: Option<String>,
    pub docker_container: Option<String>,
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyRequestMessage {
    pub sha1: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyReplyMessage {
    /// Wire bytes of the (possibly compressed) file content.
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompilationResultMessage {
    pub files: Vec<ObjectFileDescriptor>,
    /// Wire bytes for each entry in `files`, in the same order.
    pub file_contents: Vec<Vec<u8>>,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Argument(ArgumentMessage),
    DependencyRequest(DependencyRequestMessage),
    DependencyReply(DependencyReplyMessage),
    CompilationResult(CompilationResultMessage),
}

/// JSON-only view of a message header; the binary tail (dependency content,
/// object file bytes) is never part of the JSON and is appended separately.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "message_type")]
enum JsonHeader {
    Argument {
        arguments: Vec<String>,
        cwd: String,
        dependencies: BTreeMap<String, String>,
        target: Option<String>,
        schroot_profile: Option<String>,
        docker_container: Option<String>,
        compression: Compression,
    },
    DependencyRequest {
        sha1: String,
    },
    DependencyReply {
        size: i64,
    },
    CompilationResult {
        files: Vec<ObjectFileDescriptorRaw>,
        stdout: String,
        stderr: String,
        return_code: i32,
    },
}

#[derive(Serialize, Deserialize, Debug)]
struct ObjectFileDescriptorRaw {
    filename: String,
    size: i64,
}

impl Message {
    /// Serializes this message to its wire representation: an 8-byte
    /// little-endian `json_size`, the JSON header, then any binary tail.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let header = self.json_header();
        let json = serde_json::to_vec(&header)?;

        let mut buf = Vec::with_capacity(JSON_SIZE_PREFIX_LEN + json.len());
        buf.write_u64::<LittleEndian>(json.len() as u64).expect("writing to a Vec cannot fail");
        buf.extend_from_slice(&json);

        match self {
            Message::DependencyReply(m) => buf.extend_from_slice(&m.content),
            Message::CompilationResult(m) => {
                for content in &m.file_contents {
                    buf.extend_from_slice(content);
                }
            }
            Message::Argument(_) | Message::DependencyRequest(_) => {}
        }

        Ok(buf)
    }

    fn json_header(&self) -> JsonHeader {
        match self {
            Message::Argument(m) => JsonHeader::Argument {
                arguments: m.arguments.clone(),
                cwd: m.cwd.clone(),
                dependencies: m.dependencies.clone(),
                target: m.target.clone(),
                schroot_profile: m.schroot_profile.clone(),
                docker_container: m.docker_container.clone(),
                compression: m.compression,
            },
            Message::DependencyRequest(m) => JsonHeader::DependencyRequest { sha1: m.sha1.clone() },
            Message::DependencyReply(m) => {
                JsonHeader::DependencyReply { size: m.content.len() as i64 }
            }
            Message::CompilationResult(m) => JsonHeader::CompilationResult {
                files: m
                    .files
                    .iter()
                    .map(|f| ObjectFileDescriptorRaw { filename: f.filename.clone(), size: f.size as i64 })
                    .collect(),
                stdout: m.stdout.clone(),
                stderr: m.stderr.clone(),
                return_code: m.return_code,
            },
        }
    }

    /// The sole framing primitive. Higher layers drive this with a rolling
    /// buffer, feeding it more bytes on `NeedMoreBytes` and re-slicing on a
    /// `tail_overrun`.
    pub fn parse(buf: &[u8]) -> Result<ParseOutcome, ParseError> {
        if buf.len() < JSON_SIZE_PREFIX_LEN {
            return Ok(ParseOutcome::NeedMoreBytes(JSON_SIZE_PREFIX_LEN - buf.len()));
        }

        let json_size = u64::from_le_bytes(buf[0..8].try_into().expect("slice is 8 bytes")) as usize;

        let have = buf.len() as isize;
        let need_for_header = (JSON_SIZE_PREFIX_LEN + json_size) as isize;
        let mut delta = need_for_header - have;
        if delta > 0 {
            return Ok(ParseOutcome::NeedMoreBytes(delta as usize));
        }

        let json_bytes = &buf[JSON_SIZE_PREFIX_LEN..JSON_SIZE_PREFIX_LEN + json_size];
        let header: JsonHeader = serde_json::from_slice(json_bytes)?;

        let further_payload_size = further_payload_size(&header)?;

        if further_payload_size == 0 {
            let message = build_message(header, &[])?;
            return Ok(ParseOutcome::Parsed { message, tail_overrun: delta });
        }

        delta += further_payload_size as isize;
        if delta > 0 {
            return Ok(ParseOutcome::NeedMoreBytes(delta as usize));
        }

        let payload_offset = JSON_SIZE_PREFIX_LEN + json_size;
        let payload = &buf[payload_offset..payload_offset + further_payload_size];
        let message = build_message(header, payload)?;

        Ok(ParseOutcome::Parsed { message, tail_overrun: delta })
    }
}

fn further_payload_size(header: &JsonHeader) -> Result<usize, ParseError> {
    match header {
        JsonHeader::Argument { .. } | JsonHeader::DependencyRequest { .. } => Ok(0),
        JsonHeader::DependencyReply { size } => {
            if *size < 0 {
                return Err(ParseError::NegativeSize(*size));
            }
            Ok(*size as usize)
        }
        JsonHeader::CompilationResult { files, .. } => {
            let mut total = 0usize;
            for f in files {
                if f.size < 0 {
                    return Err(ParseError::NegativeSize(f.size));
                }
                total += f.size as usize;
            }
            Ok(total)
        }
    }
}

fn build_message(header: JsonHeader, payload: &[u8]) -> Result<Message, ParseError> {
    Ok(match header {
        JsonHeader::Argument {
            arguments,
            cwd,
            dependencies,
            target,
            schroot_profile,
            docker_container,
            compression,
        } => Message::Argument(ArgumentMessage {
            arguments,
            cwd,
            dependencies,
            target,
            schroot_profile,
            docker_container,
            compression,
        }),
        JsonHeader::DependencyRequest { sha1 } => {
            Message::DependencyRequest(DependencyRequestMessage { sha1 })
        }
        JsonHeader::DependencyReply { .. } => {
            Message::DependencyReply(DependencyReplyMessage { content: payload.to_vec() })
        }
        JsonHeader::CompilationResult { files, stdout, stderr, return_code } => {
            let mut file_contents = Vec::with_capacity(files.len());
            let mut offset = 0usize;
            let mut descriptors = Vec::with_capacity(files.len());
            for f in files {
                let size = f.size as usize;
                file_contents.push(payload[offset..offset + size].to_vec());
                descriptors.push(ObjectFileDescriptor { filename: f.filename, size });
                offset += size;
            }
            Message::CompilationResult(CompilationResultMessage {
                files: descriptors,
                file_contents,
                stdout,
                stderr,
                return_code,
            })
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn sample_argument() -> Message {
        Message::Argument(ArgumentMessage {
            arguments: vec!["gcc".into(), "-c".into(), "main.c".into()],
            cwd: "/home/u/proj".into(),
            dependencies: BTreeMap::from([("/home/u/proj/main.h".into(), "abc123".into())]),
            target: None,
            schroot_profile: None,
            docker_container: None,
            compression: Compression::None,
        })
    }

    #[test]
    fn round_trip_argument_message() {
        let msg = sample_argument();
        let bytes = msg.to_bytes().unwrap();
        match Message::parse(&bytes).unwrap() {
            ParseOutcome::Parsed { message, tail_overrun } => {
                assert_eq!(tail_overrun, 0);
                assert_eq!(message, msg);
            }
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn round_trip_dependency_reply_with_payload() {
        let msg = Message::DependencyReply(DependencyReplyMessage { content: vec![1, 2, 3, 4, 5] });
        let bytes = msg.to_bytes().unwrap();
        match Message::parse(&bytes).unwrap() {
            ParseOutcome::Parsed { message, tail_overrun } => {
                assert_eq!(tail_overrun, 0);
                assert_eq!(message, msg);
            }
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn partial_buffer_requests_more_bytes() {
        let msg = sample_argument();
        let bytes = msg.to_bytes().unwrap();

        // feed only the json_size prefix
        match Message::parse(&bytes[..4]).unwrap() {
            ParseOutcome::NeedMoreBytes(n) => assert_eq!(n, 4),
            other => panic!("expected NeedMoreBytes, got {other:?}"),
        }

        // feed everything but the last byte
        match Message::parse(&bytes[..bytes.len() - 1]).unwrap() {
            ParseOutcome::NeedMoreBytes(n) => assert_eq!(n, 1),
            other => panic!("expected NeedMoreBytes, got {other:?}"),
        }
    }

    #[test]
    fn trailing_bytes_are_reported_as_overrun() {
        let msg = sample_argument();
        let mut bytes = msg.to_bytes().unwrap();
        bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        match Message::parse(&bytes).unwrap() {
            ParseOutcome::Parsed { tail_overrun, .. } => assert_eq!(tail_overrun, -3),
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn zero_size_json_parses_to_error_missing_message_type() {
        // json_size = 0 means an empty JSON body, which cannot carry a
        // message_type discriminator.
        let mut bytes = Vec::new();
        bytes.write_u64::<LittleEndian>(0).unwrap();
        assert_matches!(Message::parse(&bytes), Err(ParseError::Json(_)));
    }

    #[test]
    fn negative_declared_size_is_rejected() {
        let json = serde_json::to_vec(&serde_json::json!({
            "message_type": "DependencyReply",
            "size": -1,
        }))
        .unwrap();
        let mut bytes = Vec::new();
        bytes.write_u64::<LittleEndian>(json.len() as u64).unwrap();
        bytes.extend_from_slice(&json);

        assert_matches!(Message::parse(&bytes), Err(ParseError::NegativeSize(-1)));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let json = serde_json::to_vec(&serde_json::json!({"message_type": "Bogus"})).unwrap();
        let mut bytes = Vec::new();
        bytes.write_u64::<LittleEndian>(json.len() as u64).unwrap();
        bytes.extend_from_slice(&json);

        assert_matches!(Message::parse(&bytes), Err(ParseError::Json(_)));
    }

    #[test]
    fn compilation_result_with_two_files_splits_payload_correctly() {
        let msg = Message::CompilationResult(CompilationResultMessage {
            files: vec![
                ObjectFileDescriptor { filename: "main.cpp.o".into(), size: 3 },
                ObjectFileDescriptor { filename: "foo.cpp.o".into(), size: 2 },
            ],
            file_contents: vec![vec![1, 2, 3], vec![9, 9]],
            stdout: String::new(),
            stderr: String::new(),
            return_code: 0,
        });
        let bytes = msg.to_bytes().unwrap();
        match Message::parse(&bytes).unwrap() {
            ParseOutcome::Parsed { message, .. } => assert_eq!(message, msg),
            other => panic!("expected Parsed, got {other:?}"),
        }
    }
}
