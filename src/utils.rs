// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use anyhow::Context;

/// Rounds `value` up to the next multiple of `alignment`, which must be non-zero.
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Parses pairs of hexadecimal digits, e.g. `"0a 1B ff"`, into bytes. Whitespace between pairs
/// is ignored.
pub fn load_byte_array_from_string(hex_str: &str) -> anyhow::Result<Vec<u8>> {
    let digits = hex_str
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();

    hex::decode(&digits).with_context(|| format!("invalid hex string {:?}", hex_str))
}

/// Formats `bytes` as space separated pairs of lowercase hexadecimal digits.
pub fn byte_array_to_hex_string(bytes: &[u8]) -> String {
    bytes
        .chunks(1)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(176, 16), 176);
        assert_eq!(align_up(177, 16), 192);
    }

    #[test]
    fn test_hex_helpers() {
        let bytes = load_byte_array_from_string("00ff7A10").unwrap();
        assert_eq!(bytes, vec![0x00, 0xff, 0x7a, 0x10]);
        assert_eq!(byte_array_to_hex_string(&bytes), "00 ff 7a 10");
        assert_eq!(
            load_byte_array_from_string(&byte_array_to_hex_string(&bytes)).unwrap(),
            bytes
        );
        assert_eq!(byte_array_to_hex_string(&[]), "");

        assert!(load_byte_array_from_string("abc").is_err());
        assert!(load_byte_array_from_string("zz").is_err());
    }
}
