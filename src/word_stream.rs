//! Fixed-width little-endian word id streams
//!
//! The width is chosen by the vocabulary bound so a corpus file is a flat
//! array that can be memory-mapped and split without parsing.

use crate::{ALICELMError, Result, WordIndex};
use bytemuck::pod_read_unaligned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read};

/// Bytes per word id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordWidth {
    U8,
    U16,
    U32,
    U64,
}

impl WordWidth {
    /// Narrowest width holding every id below `bound`
    pub fn for_bound(bound: u64) -> Self {
        if bound <= 1 << 8 {
            WordWidth::U8
        } else if bound <= 1 << 16 {
            WordWidth::U16
        } else if bound <= 1 << 32 {
            WordWidth::U32
        } else {
            WordWidth::U64
        }
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        match self {
            WordWidth::U8 => 1,
            WordWidth::U16 => 2,
            WordWidth::U32 => 4,
            WordWidth::U64 => 8,
        }
    }

    #[inline]
    fn max_value(&self) -> u64 {
        match self {
            WordWidth::U8 => u8::MAX as u64,
            WordWidth::U16 => u16::MAX as u64,
            WordWidth::U32 => u32::MAX as u64,
            WordWidth::U64 => u64::MAX,
        }
    }

    #[inline]
    fn read(&self, chunk: &[u8]) -> u64 {
        match self {
            WordWidth::U8 => chunk[0] as u64,
            WordWidth::U16 => u16::from_le(pod_read_unaligned(chunk)) as u64,
            WordWidth::U32 => u32::from_le(pod_read_unaligned(chunk)) as u64,
            WordWidth::U64 => u64::from_le(pod_read_unaligned(chunk)),
        }
    }

    fn to_index(value: u64) -> Result<WordIndex> {
        WordIndex::try_from(value).map_err(|_| {
            ALICELMError::MalformedInput(format!("word id {} does not fit a word index", value))
        })
    }
}

/// Encode ids at `width`.
pub fn encode_words(words: &[WordIndex], width: WordWidth) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(words.len() * width.bytes());
    for &w in words {
        let value = w as u64;
        if value > width.max_value() {
            return Err(ALICELMError::MalformedInput(format!(
                "word id {} does not fit {} bytes",
                w,
                width.bytes()
            )));
        }
        out.extend_from_slice(&value.to_le_bytes()[..width.bytes()]);
    }
    Ok(out)
}

/// Decode a whole buffer. The length must be a multiple of the width.
pub fn decode_words(bytes: &[u8], width: WordWidth) -> Result<Vec<WordIndex>> {
    let w = width.bytes();
    if bytes.len() % w != 0 {
        return Err(ALICELMError::MalformedInput(format!(
            "{} bytes is not a multiple of the {}-byte word width",
            bytes.len(),
            w
        )));
    }
    bytes
        .chunks_exact(w)
        .map(|chunk| WordWidth::to_index(width.read(chunk)))
        .collect()
}

/// Streaming decoder over any reader (pipes, stdin)
pub struct WordReader<R: Read> {
    reader: R,
    width: WordWidth,
    buf: [u8; 8],
    offset: u64,
    done: bool,
}

impl<R: Read> WordReader<R> {
    pub fn new(reader: R, width: WordWidth) -> Self {
        Self {
            reader,
            width,
            buf: [0; 8],
            offset: 0,
            done: false,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn fill(&mut self) -> Result<usize> {
        let w = self.width.bytes();
        let mut filled = 0;
        while filled < w {
            match self.reader.read(&mut self.buf[filled..w]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for WordReader<R> {
    type Item = Result<WordIndex>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let w = self.width.bytes();
        let filled = match self.fill() {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < w {
            self.done = true;
            return Some(Err(ALICELMError::MalformedInput(format!(
                "stream ends with a partial {}-byte word at offset {}",
                w, self.offset
            ))));
        }
        self.offset += w as u64;
        Some(WordWidth::to_index(self.width.read(&self.buf[..w])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_width_for_bound() {
        assert_eq!(WordWidth::for_bound(2), WordWidth::U8);
        assert_eq!(WordWidth::for_bound(256), WordWidth::U8);
        assert_eq!(WordWidth::for_bound(257), WordWidth::U16);
        assert_eq!(WordWidth::for_bound(65536), WordWidth::U16);
        assert_eq!(WordWidth::for_bound(65537), WordWidth::U32);
        assert_eq!(WordWidth::for_bound(1 << 32), WordWidth::U32);
        assert_eq!(WordWidth::for_bound((1 << 32) + 1), WordWidth::U64);
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = encode_words(&[0x0102, 7], WordWidth::U16).unwrap();
        assert_eq!(bytes, vec![0x02, 0x01, 0x07, 0x00]);
        assert_eq!(decode_words(&bytes, WordWidth::U16).unwrap(), vec![0x0102, 7]);
    }

    #[test]
    fn test_encode_rejects_overflow() {
        assert!(encode_words(&[300], WordWidth::U8).is_err());
    }

    #[test]
    fn test_decode_rejects_ragged_length() {
        assert!(matches!(
            decode_words(&[1, 2, 3], WordWidth::U16),
            Err(ALICELMError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wide_ids() {
        let bytes = u64::MAX.to_le_bytes();
        assert!(decode_words(&bytes, WordWidth::U64).is_err());
    }

    #[test]
    fn test_reader_matches_decode() {
        let words: Vec<WordIndex> = (0..1000).map(|i| (i * 37) % 70000).collect();
        let bytes = encode_words(&words, WordWidth::U32).unwrap();
        let read: Vec<WordIndex> = WordReader::new(Cursor::new(&bytes), WordWidth::U32)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, words);
    }

    #[test]
    fn test_reader_rejects_partial_tail() {
        let mut reader = WordReader::new(Cursor::new(vec![1u8, 0, 2]), WordWidth::U16);
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        assert!(matches!(
            reader.next(),
            Some(Err(ALICELMError::MalformedInput(_)))
        ));
        assert!(reader.next().is_none());
        assert_eq!(reader.offset(), 2);
    }
}
