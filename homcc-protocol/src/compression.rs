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

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde_derive::{Deserialize, Serialize};

/// The compression codec a connection negotiates via the `ArgumentMessage`.
/// Every payload-bearing message on that connection compresses its binary
/// tail file-by-file under this codec so a receiver can decode as each file
/// arrives rather than waiting for the whole frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    /// LZO1X-1, matching the `lzo` package the original client/server use.
    /// minilzo's decompressor needs the exact original length up front, so
    /// the wire payload is an 8-byte little-endian original-length prefix
    /// followed by the minilzo-compressed bytes.
    Lzo,
    Lzma,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lzo => "lzo",
            Compression::Lzma => "lzma",
        }
    }

    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("lzo") => Compression::Lzo,
            Some("lzma") => Compression::Lzma,
            _ => Compression::None,
        }
    }

    pub fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lzo => {
                let compressed = minilzo::compress(data)
                    .map_err(|err| anyhow::anyhow!("lzo compression failed: {err:?}"))?;

                let mut wire = Vec::with_capacity(8 + compressed.len());
                wire.write_u64::<LittleEndian>(data.len() as u64).expect("writing to a Vec cannot fail");
                wire.extend_from_slice(&compressed);
                Ok(wire)
            }
            Compression::Lzma => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decompress(&self, data: &[u8], decompressed_size: usize) -> anyhow::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lzo => {
                let mut header = data;
                let original_len = header
                    .read_u64::<LittleEndian>()
                    .map_err(|_| anyhow::anyhow!("lzo payload missing original-size header"))?
                    as usize;
                minilzo::decompress(header, original_len)
                    .map_err(|err| anyhow::anyhow!("lzo decompression failed: {err:?}"))
            }
            Compression::Lzma => {
                let mut decoder = xz2::read::XzDecoder::new(data);
                let mut out = Vec::with_capacity(decompressed_size);
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_all_codecs() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        for codec in [Compression::None, Compression::Lzo, Compression::Lzma] {
            let compressed = codec.compress(&data).expect("compress to succeed");
            let decompressed =
                codec.decompress(&compressed, data.len()).expect("decompress to succeed");
            assert_eq!(decompressed, data, "round trip failed for {codec}");
        }
    }

    #[test]
    fn from_name_defaults_to_none() {
        assert_eq!(Compression::from_name(None), Compression::None);
        assert_eq!(Compression::from_name(Some("bogus")), Compression::None);
        assert_eq!(Compression::from_name(Some("lzma")), Compression::Lzma);
    }
}
