//! The container checksum.
//!
//! This is MD5's compression function with a non-standard final block: the bit count is
//! stored in the first word of the last block instead of the last two, and the last word
//! holds `(bits >> 2) | 1`. It covers everything after the magic and the checksum itself.

use byteorder::{ByteOrder, LittleEndian};

/// The number of leading bytes that the checksum does not cover.
pub const SKIPPED_BYTES: usize = 20;

const PADDING: [u8; 64] = {
    let mut padding = [0u8; 64];
    padding[0] = 0x80;
    padding
};

const SHIFTS: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, //
    5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, //
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, //
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

const SINES: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

/// Runs the MD5 compression function over one 64-byte block.
pub(super) fn transform(state: &mut [u32; 4], block: &[u8]) {
    let mut words = [0u32; 16];
    LittleEndian::read_u32_into(&block[..64], &mut words);

    let [mut a, mut b, mut c, mut d] = *state;

    for i in 0..64 {
        let (f, g) = match i / 16 {
            0 => ((b & c) | (!b & d), i),
            1 => ((d & b) | (!d & c), (5 * i + 1) % 16),
            2 => (b ^ c ^ d, (3 * i + 5) % 16),
            _ => (c ^ (b | !d), (7 * i) % 16),
        };

        let rotated = a
            .wrapping_add(f)
            .wrapping_add(SINES[i])
            .wrapping_add(words[g])
            .rotate_left(SHIFTS[i]);

        a = d;
        d = c;
        c = b;
        b = b.wrapping_add(rotated);
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

/// Computes the checksum of `data`, which should already exclude the skipped header bytes.
pub fn digest(data: &[u8]) -> [u32; 4] {
    let mut state = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

    let length = data.len();
    let bit_count = (length as u32).wrapping_mul(8);
    let last_word = (length as u32).wrapping_shl(1) | 1;

    let full_blocks = length / 64;

    for block in data.chunks_exact(64) {
        transform(&mut state, block);
    }

    let remainder = &data[full_blocks * 64..];
    let mut block = [0u8; 64];

    if remainder.len() < 56 {
        // Bit count, data, padding and the trailing word all fit in one block.
        LittleEndian::write_u32(&mut block[0..4], bit_count);
        block[4..4 + remainder.len()].copy_from_slice(remainder);

        let padding_end = 60;
        let padding_len = padding_end - 4 - remainder.len();
        block[4 + remainder.len()..padding_end].copy_from_slice(&PADDING[..padding_len]);

        LittleEndian::write_u32(&mut block[60..64], last_word);
        transform(&mut state, &block);
    } else {
        // The data and the start of the padding fill one block, and the counts get another.
        block[..remainder.len()].copy_from_slice(remainder);
        block[remainder.len()..].copy_from_slice(&PADDING[..64 - remainder.len()]);
        transform(&mut state, &block);

        let mut last = [0u8; 64];
        LittleEndian::write_u32(&mut last[0..4], bit_count);
        LittleEndian::write_u32(&mut last[60..64], last_word);
        transform(&mut state, &last);
    }

    state
}

/// Computes the checksum of a whole container, skipping the magic and checksum fields.
pub fn container_checksum(container: &[u8]) -> Option<[u8; 16]> {
    if container.len() <= SKIPPED_BYTES {
        return None;
    }

    let state = digest(&container[SKIPPED_BYTES..]);

    let mut bytes = [0u8; 16];
    LittleEndian::write_u32_into(&state, &mut bytes);

    Some(bytes)
}

/// Returns true if the checksum stored in `container` matches its contents.
pub fn validate(container: &[u8]) -> bool {
    match container_checksum(container) {
        Some(expected) => container[4..20] == expected,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Standard MD5 built on the same compression function, to check the rounds.
    fn md5(data: &[u8]) -> [u8; 16] {
        let mut state = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

        let mut message = data.to_vec();
        message.push(0x80);

        while message.len() % 64 != 56 {
            message.push(0);
        }

        message.extend_from_slice(&((data.len() as u64) * 8).to_le_bytes());

        for block in message.chunks_exact(64) {
            transform(&mut state, block);
        }

        let mut out = [0u8; 16];
        LittleEndian::write_u32_into(&state, &mut out);
        out
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn compression_function_matches_md5() {
        assert_eq!(hex(&md5(b"")), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hex(&md5(b"abc")), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            hex(&md5(b"The quick brown fox jumps over the lazy dog")),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[test]
    fn digest_depends_on_every_byte() {
        for length in [0usize, 1, 55, 56, 60, 63, 64, 119, 120, 200] {
            let data: Vec<u8> = (0..length).map(|i| (i * 7 + 3) as u8).collect();
            let base = digest(&data);

            assert_eq!(base, digest(&data), "digest must be deterministic");

            if length > 0 {
                let mut changed = data.clone();
                changed[length / 2] ^= 0x40;
                assert_ne!(base, digest(&changed), "length {}", length);
            }
        }
    }

    #[test]
    fn validate_checks_stored_checksum() {
        let mut container = vec![0u8; 64];
        container[..4].copy_from_slice(b"DXBC");
        container[20] = 1;

        let checksum = container_checksum(&container).unwrap();
        container[4..20].copy_from_slice(&checksum);
        assert!(validate(&container));

        container[40] = 9;
        assert!(!validate(&container));
        assert!(!validate(&container[..10]));
    }
}
