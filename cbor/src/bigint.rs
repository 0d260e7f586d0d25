//! Rendering of big-endian unsigned magnitudes as digit strings.
//!
//! Enough bignum support for tags 2 and 3: the parser never does arithmetic
//! on these values, it only needs their decimal and hexadecimal forms.

use alloc::{string::String, vec::Vec};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Decimal digits of a big-endian magnitude, without sign.
pub(crate) fn decimal_digits(bytes: &[u8]) -> String {
    let mut magnitude: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    if magnitude.is_empty() {
        return String::from("0");
    }

    // Schoolbook base-256 to base-10: divide by ten until nothing is left.
    let mut digits = Vec::new();
    while !magnitude.is_empty() {
        let mut remainder = 0u32;
        let mut quotient = Vec::with_capacity(magnitude.len());
        for &byte in &magnitude {
            let acc = remainder * 256 + u32::from(byte);
            let q = (acc / 10) as u8;
            remainder = acc % 10;
            if !(quotient.is_empty() && q == 0) {
                quotient.push(q);
            }
        }
        digits.push(b'0' + remainder as u8);
        magnitude = quotient;
    }
    digits.iter().rev().map(|&d| d as char).collect()
}

/// Lowercase hex digits of a big-endian magnitude, without `0x` or sign.
pub(crate) fn hex_digits(bytes: &[u8]) -> String {
    let mut trimmed = bytes;
    while let [0, rest @ ..] = trimmed {
        trimmed = rest;
    }
    if trimmed.is_empty() {
        return String::from("0");
    }

    let mut out = String::with_capacity(trimmed.len() * 2);
    let first = trimmed[0];
    if first >> 4 != 0 {
        out.push(HEX[(first >> 4) as usize] as char);
    }
    out.push(HEX[(first & 0xf) as usize] as char);
    for &byte in &trimmed[1..] {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0xf) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal() {
        assert_eq!(decimal_digits(&[]), "0");
        assert_eq!(decimal_digits(&[0, 0]), "0");
        assert_eq!(decimal_digits(&[1]), "1");
        assert_eq!(decimal_digits(&[0x6a, 0xb3]), "27315");
        assert_eq!(
            decimal_digits(&[1, 0, 0, 0, 0, 0, 0, 0, 0]),
            "18446744073709551616"
        );
    }

    #[test]
    fn hex() {
        assert_eq!(hex_digits(&[]), "0");
        assert_eq!(hex_digits(&[0]), "0");
        assert_eq!(hex_digits(&[0x0f]), "f");
        assert_eq!(hex_digits(&[0x1b]), "1b");
        assert_eq!(hex_digits(&[0x01, 0x00]), "100");
        assert_eq!(hex_digits(&[0, 0xab, 0xcd]), "abcd");
    }
}
