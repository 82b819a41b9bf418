//! Reading and writing compiled-shader containers.
//!
//! Layout:
//!
//! ```text
//!   0  "DXBC"
//!   4  checksum (16 bytes)
//!  20  1
//!  24  total size in bytes
//!  28  chunk count
//!  32  chunk offsets (one u32 each)
//!      chunks: fourcc, size, data
//! ```
//!
//! The code chunk (`SHDR` for shader model 4, `SHEX` for 5) starts with a version token and a
//! length token (in dwords, including both), followed by the instruction stream.

use std::fmt::{self, Display};
use std::io::{Cursor, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use eyre::{bail, ensure, format_err, Result};

use crate::driver::Stage;

use super::checksum;

pub const MAGIC: &[u8; 4] = b"DXBC";

const HEADER_SIZE: usize = 32;

/// One named chunk of a container.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Chunk {
    pub fourcc: [u8; 4],
    pub data: Vec<u8>,
}

impl Chunk {
    /// Returns true if this chunk holds the instruction stream.
    pub fn is_code(&self) -> bool {
        &self.fourcc == b"SHDR" || &self.fourcc == b"SHEX"
    }
}

/// A parsed container.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Container {
    pub chunks: Vec<Chunk>,
}

impl Container {
    /// Parses a container, checking the header fields against the data. The checksum is not
    /// checked here; use [`checksum::validate`] for that.
    pub fn parse(bytes: &[u8]) -> Result<Container> {
        ensure!(bytes.len() >= HEADER_SIZE, "container is only {} bytes long", bytes.len());
        ensure!(&bytes[..4] == MAGIC, "bad container magic {:02x?}", &bytes[..4]);

        let mut reader = Cursor::new(bytes);
        reader.set_position(20);

        let one = reader.read_u32::<LittleEndian>()?;
        let total_size = reader.read_u32::<LittleEndian>()? as usize;
        let chunk_count = reader.read_u32::<LittleEndian>()? as usize;

        ensure!(one == 1, "unexpected value {} in container header", one);
        ensure!(
            total_size == bytes.len(),
            "container declares {} bytes but {} were supplied",
            total_size,
            bytes.len()
        );
        let table_end = chunk_count.checked_mul(4).and_then(|size| size.checked_add(HEADER_SIZE));
        ensure!(
            matches!(table_end, Some(end) if end <= bytes.len()),
            "chunk table for {} chunks does not fit",
            chunk_count
        );

        let mut offsets = Vec::with_capacity(chunk_count);

        for _ in 0..chunk_count {
            offsets.push(reader.read_u32::<LittleEndian>()? as usize);
        }

        let mut chunks = Vec::with_capacity(chunk_count);

        for offset in offsets {
            let data_start = match offset.checked_add(8) {
                Some(start) if start <= bytes.len() => start,
                _ => bail!("chunk offset {:#x} out of bounds", offset),
            };

            reader.set_position(offset as u64);

            let mut fourcc = [0u8; 4];
            reader.read_exact(&mut fourcc)?;

            let size = reader.read_u32::<LittleEndian>()? as usize;
            let data_end = match data_start.checked_add(size) {
                Some(end) if end <= bytes.len() => end,
                _ => bail!(
                    "chunk '{}' at {:#x} overruns the container",
                    String::from_utf8_lossy(&fourcc),
                    offset
                ),
            };

            chunks.push(Chunk {
                fourcc,
                data: bytes[data_start..data_end].to_vec(),
            });
        }

        Ok(Container { chunks })
    }

    /// Builds a container holding only a code chunk.
    pub fn with_code(fourcc: [u8; 4], code: Vec<u8>) -> Container {
        Container {
            chunks: vec![Chunk { fourcc, data: code }],
        }
    }

    pub fn code_chunk(&self) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.is_code())
    }

    /// Replaces the data of the code chunk, keeping every other chunk and the chunk order.
    pub fn replace_code(&mut self, code: Vec<u8>) -> Result<()> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|chunk| chunk.is_code())
            .ok_or_else(|| format_err!("container has no code chunk"))?;

        chunk.data = code;
        Ok(())
    }

    /// Serialises the container, computing the total size and checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let table_size = HEADER_SIZE + self.chunks.len() * 4;
        let total_size = table_size + self.chunks.iter().map(|chunk| 8 + chunk.data.len()).sum::<usize>();

        let mut bytes = Vec::with_capacity(total_size);
        bytes.write_all(MAGIC)?;
        bytes.write_all(&[0u8; 16])?;
        bytes.write_u32::<LittleEndian>(1)?;
        let declared_size = u32::try_from(total_size).map_err(|_| format_err!("container of {} bytes is too large", total_size))?;
        bytes.write_u32::<LittleEndian>(declared_size)?;
        bytes.write_u32::<LittleEndian>(self.chunks.len() as u32)?;

        let mut offset = table_size;

        for chunk in &self.chunks {
            bytes.write_u32::<LittleEndian>(offset as u32)?;
            offset += 8 + chunk.data.len();
        }

        for chunk in &self.chunks {
            bytes.write_all(&chunk.fourcc)?;
            bytes.write_u32::<LittleEndian>(chunk.data.len() as u32)?;
            bytes.write_all(&chunk.data)?;
        }

        let sum = checksum::container_checksum(&bytes).ok_or_else(|| format_err!("container too small"))?;
        bytes[4..20].copy_from_slice(&sum);

        Ok(bytes)
    }
}

/// The version token at the start of a code chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ShaderVersion {
    pub stage: Stage,
    pub major: u32,
    pub minor: u32,
}

impl ShaderVersion {
    pub fn from_token(token: u32) -> Result<ShaderVersion> {
        if token & 0xff00 != 0 {
            bail!("unsupported version token {:#010x}", token);
        }

        let stage = Stage::from_program_type(token >> 16)
            .ok_or_else(|| format_err!("unknown program type {} in version token", token >> 16))?;

        Ok(ShaderVersion {
            stage,
            major: (token >> 4) & 0xf,
            minor: token & 0xf,
        })
    }

    pub fn token(self) -> u32 {
        (self.stage.program_type() << 16) | (self.major << 4) | self.minor
    }

    /// Parses a profile name such as `ps_5_0`.
    pub fn parse(profile: &str) -> Result<ShaderVersion> {
        let mut parts = profile.trim().split('_');

        let (stage, major, minor) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(stage), Some(major), Some(minor), None) => (stage, major, minor),
            _ => bail!("malformed shader version '{}'", profile),
        };

        let stage = Stage::from_abbrev(stage).ok_or_else(|| format_err!("unknown shader stage '{}'", stage))?;
        let major: u32 = major.parse().map_err(|_| format_err!("bad major version in '{}'", profile))?;
        let minor: u32 = minor.parse().map_err(|_| format_err!("bad minor version in '{}'", profile))?;

        ensure!(major < 16 && minor < 16, "shader version '{}' out of range", profile);

        Ok(ShaderVersion { stage, major, minor })
    }

    /// The chunk name used for this shader model.
    pub fn fourcc(self) -> [u8; 4] {
        if self.major >= 5 {
            *b"SHEX"
        } else {
            *b"SHDR"
        }
    }
}

impl Display for ShaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.stage.abbrev(), self.major, self.minor)
    }
}

/// Splits a code chunk into its version and its instruction dwords.
pub fn split_code(code: &[u8]) -> Result<(ShaderVersion, Vec<u32>)> {
    ensure!(code.len() >= 8 && code.len() % 4 == 0, "code chunk has bad size {}", code.len());

    let mut words = vec![0u32; code.len() / 4];
    LittleEndian::read_u32_into(code, &mut words);

    let version = ShaderVersion::from_token(words[0])?;
    let declared = words[1] as usize;

    ensure!(
        declared == words.len(),
        "code chunk declares {} dwords but holds {}",
        declared,
        words.len()
    );

    Ok((version, words.split_off(2)))
}

/// Builds a code chunk from a version and instruction dwords.
pub fn join_code(version: ShaderVersion, instructions: &[u32]) -> Vec<u8> {
    let mut code = Vec::with_capacity((instructions.len() + 2) * 4);

    code.extend_from_slice(&version.token().to_le_bytes());
    code.extend_from_slice(&((instructions.len() as u32 + 2).to_le_bytes()));

    for word in instructions {
        code.extend_from_slice(&word.to_le_bytes());
    }

    code
}

/// Reads the shader version of a container, if it has a readable code chunk.
pub fn container_version(bytecode: &[u8]) -> Option<ShaderVersion> {
    let container = Container::parse(bytecode).ok()?;
    let code = container.code_chunk()?;
    split_code(&code.data).ok().map(|(version, _)| version)
}
