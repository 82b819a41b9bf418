use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// The content hash that identifies a shader across runs: 64-bit FNV-1a over the whole
/// compiled container. Written as 16 lowercase hex digits in file names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShaderHash(pub u64);

impl ShaderHash {
    pub fn of(bytecode: &[u8]) -> ShaderHash {
        let hash = bytecode
            .iter()
            .fold(FNV_OFFSET, |hash, &byte| (hash ^ byte as u64).wrapping_mul(FNV_PRIME));

        ShaderHash(hash)
    }
}

impl Display for ShaderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ShaderHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(format!("'{}' is not a 16 digit shader hash", s));
        }

        u64::from_str_radix(s, 16)
            .map(ShaderHash)
            .map_err(|_| format!("'{}' is not a hex shader hash", s))
    }
}

impl TryFrom<String> for ShaderHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShaderHash> for String {
    fn from(hash: ShaderHash) -> String {
        hash.to_string()
    }
}
