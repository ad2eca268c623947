// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

/// An iterator that turns a sequence of u64s into a sequence of bit positions
/// that are set.
///
/// Words are consumed lazily, one at a time, so the underlying iterator may
/// have side effects per word (the dirty bitmap merger updates its
/// acknowledge bitmap while the diff words are produced).
struct BitposIterator<I> {
    underlying_it: I,

    /// Bit position of bit 0 of the next word pulled from `underlying_it`.
    next_word_base: u64,

    /// Remaining set bits of the current word, with the bit position of its
    /// bit 0.
    current_word: Option<(u64 /* remaining bits */, u64 /* base */)>,
}

impl<I> Iterator for BitposIterator<I>
where
    I: Iterator<Item = u64>,
{
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.current_word {
                Some((word, base)) if word != 0 => {
                    let bit = u64::from(word.trailing_zeros());
                    // Clear the lowest set bit.
                    self.current_word = Some((word & (word - 1), base));
                    return Some(base + bit);
                }
                _ => {
                    let word = self.underlying_it.next()?;
                    self.current_word = Some((word, self.next_word_base));
                    self.next_word_base += u64::from(u64::BITS);
                }
            }
        }
    }
}

pub trait BitposIteratorExt: Iterator<Item = u64> + Sized {
    /// Turn an iterator over `u64` into an iterator over the bit positions of
    /// all 1s. We basically treat the incoming `u64` as one gigantic
    /// little-endian integer and just spit out which bits are set.
    fn bit_positions(self) -> impl Iterator<Item = u64> {
        self.bit_positions_from(0)
    }

    /// Same as [`bit_positions`](Self::bit_positions), with every position
    /// shifted by `first_bit`. Used when the words are a window of a larger
    /// bitmap.
    fn bit_positions_from(self, first_bit: u64) -> impl Iterator<Item = u64> {
        BitposIterator {
            underlying_it: self,
            next_word_base: first_bit,
            current_word: None,
        }
    }
}

impl<I: Iterator<Item = u64> + Sized> BitposIteratorExt for I {}
