//! The alphabet character abstraction and the phrase type shared by the whole engine.
use std::fmt::Debug;
use std::hash::Hash;

use num::{cast::AsPrimitive, Bounded, Num};

/// The sentinel marking an absent offset or length.
pub const UNDEFINED: usize = usize::MAX;

/// An alphabet character: the unsigned integer unit of input.
///
/// The character width is a build-time choice made by instantiating the
/// engine with one of `u8`, `u16`, `u32` or `u64`. The width limits the
/// numeric range of the terminals a grammar may carry and of the input the
/// engine can parse. [`Matcher`](crate::matcher::Matcher) fixes the width to
/// `u32` and treats input strings as sequences of Unicode scalar values.
pub trait AlphabetChar:
    Num
    + Bounded
    + AsPrimitive<usize>
    + TryFrom<u64>
    + Into<u64>
    + Copy
    + Ord
    + Eq
    + Hash
    + Debug
    + 'static
{
}

impl<T> AlphabetChar for T where
    T: Num
        + Bounded
        + AsPrimitive<usize>
        + TryFrom<u64>
        + Into<u64>
        + Copy
        + Ord
        + Eq
        + Hash
        + Debug
        + 'static
{
}

/// A contiguous range of input characters, denoted by offset and length.
///
/// A phrase never owns its characters; it indexes into whatever input
/// sequence the engine is currently holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Phrase {
    /// Offset of the first character of the phrase.
    pub offset: usize,
    /// The number of characters in the phrase.
    pub length: usize,
}

impl Phrase {
    /// A phrase over `[offset, offset + length)`.
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// The index one past the last character of the phrase.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// ASCII letter case folding: `A`-`Z` fold to `a`-`z`, all other characters
/// are unchanged. This is the only folding the engine performs; TLS literals
/// and case-insensitive back references use it on both sides of the compare.
#[inline]
pub fn ascii_fold<C: AlphabetChar>(c: C) -> C {
    let v: u64 = c.into();
    if (0x41..=0x5A).contains(&v) {
        C::try_from(v + 0x20).ok().unwrap_or(c)
    } else {
        c
    }
}

/// Converts a string to the `u32` alphabet, one character per Unicode
/// scalar value. Offsets reported against such input count characters,
/// not bytes.
pub fn chars_of_str(source: &str) -> Vec<u32> {
    source.chars().map(|c| c as u32).collect()
}

/// Converts a `u32`-alphabet character sequence back to a string. Values
/// that are not Unicode scalar values are replaced with U+FFFD.
pub fn string_from_chars(chars: &[u32]) -> String {
    chars
        .iter()
        .map(|&c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_ascii_only() {
        assert_eq!(ascii_fold(b'A'), b'a');
        assert_eq!(ascii_fold(b'Z'), b'z');
        assert_eq!(ascii_fold(b'a'), b'a');
        assert_eq!(ascii_fold(b'@'), b'@');
        assert_eq!(ascii_fold(0xC4u32), 0xC4); // 'Ä' is not folded
    }

    #[test]
    fn str_round_trip() {
        let chars = chars_of_str("abÄ☃");
        assert_eq!(chars.len(), 4);
        assert_eq!(string_from_chars(&chars), "abÄ☃");
    }
}
