//! LZO1X-1 block decoder writing into a fixed-capacity buffer.
//!
//! nfdump does not store the decoded length of an LZO block, so the output
//! buffer is sized to the block ceiling and every copy is checked against it
//! before any byte is written.  A stream that would run past the buffer fails
//! with [`LzoError::OutputOverrun`]; nothing is ever reallocated.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LzoError {
    #[error("input overrun")]
    InputOverrun,
    #[error("output overrun")]
    OutputOverrun,
    #[error("match distance reaches before start of output")]
    LookbehindOverrun,
    #[error("{0} trailing byte(s) after end of stream")]
    InputNotConsumed(usize),
}

struct Input<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn byte(&mut self) -> Result<u8, LzoError> {
        let b = *self.src.get(self.pos).ok_or(LzoError::InputOverrun)?;
        self.pos += 1;
        Ok(b)
    }

    fn le16(&mut self) -> Result<usize, LzoError> {
        let bytes = self.take(2)?;
        Ok(LittleEndian::read_u16(bytes) as usize)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LzoError> {
        let end = self.pos.checked_add(len).ok_or(LzoError::InputOverrun)?;
        let bytes = self.src.get(self.pos..end).ok_or(LzoError::InputOverrun)?;
        self.pos = end;
        Ok(bytes)
    }

    /// Extended length: a run of zero bytes (255 each) ended by a non-zero byte.
    fn run_length(&mut self, base: usize) -> Result<usize, LzoError> {
        let mut zeros = 0usize;
        loop {
            match self.byte()? {
                0 => zeros += 1,
                b => return Ok(zeros * 255 + base + b as usize),
            }
        }
    }
}

struct Output<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl Output<'_> {
    fn reserve(&self, len: usize) -> Result<usize, LzoError> {
        match self.pos.checked_add(len) {
            Some(end) if end <= self.dst.len() => Ok(end),
            _ => Err(LzoError::OutputOverrun),
        }
    }

    fn literals(&mut self, bytes: &[u8]) -> Result<(), LzoError> {
        let end = self.reserve(bytes.len())?;
        self.dst[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    /// Back-reference copy; source and destination may overlap.
    fn copy_match(&mut self, distance: usize, len: usize) -> Result<(), LzoError> {
        if distance == 0 || distance > self.pos {
            return Err(LzoError::LookbehindOverrun);
        }
        let end = self.reserve(len)?;
        let mut from = self.pos - distance;
        for to in self.pos..end {
            self.dst[to] = self.dst[from];
            from += 1;
        }
        self.pos = end;
        Ok(())
    }
}

/// Decode `src` into `dst` and return the number of bytes written.
pub fn decompress_into(src: &[u8], dst: &mut [u8]) -> Result<usize, LzoError> {
    let mut input = Input { src, pos: 0 };
    let mut out = Output { dst, pos: 0 };

    // literals copied by the previous instruction: 0, 1..=3, or 4 for "many"
    let mut state = 0usize;

    match src.first() {
        Some(&b) if b >= 22 => {
            input.pos = 1;
            out.literals(input.take(b as usize - 17)?)?;
            state = 4;
        }
        Some(&b) if b >= 18 => {
            input.pos = 1;
            state = b as usize - 17;
            out.literals(input.take(state)?)?;
        }
        _ => {}
    }

    loop {
        let inst = input.byte()? as usize;
        let (distance, len, next_state);

        if inst >= 64 {
            // M2: 3..8 bytes within 2 KiB
            let h = input.byte()? as usize;
            distance = (h << 3) + ((inst >> 2) & 0x7) + 1;
            len = (inst >> 5) + 1;
            next_state = inst & 0x3;
        } else if inst >= 32 {
            // M3: within 16 KiB
            len = match inst & 0x1f {
                0 => input.run_length(33)?,
                l => l + 2,
            };
            let d = input.le16()?;
            distance = (d >> 2) + 1;
            next_state = d & 0x3;
        } else if inst >= 16 {
            // M4: 16..48 KiB, distance 16384 marks end of stream
            len = match inst & 0x7 {
                0 => input.run_length(9)?,
                l => l + 2,
            };
            let d = input.le16()?;
            let offset = ((inst & 0x8) << 11) + (d >> 2);
            if offset == 0 {
                break;
            }
            distance = offset + 16384;
            next_state = d & 0x3;
        } else if state == 0 {
            // long literal run
            let run = match inst {
                0 => input.run_length(18)?,
                l => l + 3,
            };
            out.literals(input.take(run)?)?;
            state = 4;
            continue;
        } else if state < 4 {
            // M1: 2 bytes within 1 KiB
            let h = input.byte()? as usize;
            distance = (inst >> 2) + (h << 2) + 1;
            len = 2;
            next_state = inst & 0x3;
        } else {
            // M1 after a literal run: 3 bytes at 2..3 KiB
            let h = input.byte()? as usize;
            distance = (inst >> 2) + (h << 2) + 2049;
            len = 3;
            next_state = inst & 0x3;
        }

        out.copy_match(distance, len)?;
        out.literals(input.take(next_state)?)?;
        state = next_state;
    }

    if input.pos != src.len() {
        return Err(LzoError::InputNotConsumed(src.len() - input.pos));
    }
    Ok(out.pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> Vec<u8> {
        b"nfdump flow block, nfdump flow block, 0123456789 abcdefghij "
            .iter()
            .cycle()
            .take(70_000)
            .copied()
            .collect()
    }

    #[test]
    fn round_trip_matches_input() {
        let data = text();
        let packed = lzokay_native::compress(&data).unwrap();
        let mut out = vec![0u8; data.len() + 100];
        let n = decompress_into(&packed, &mut out).unwrap();
        assert_eq!(&out[..n], &data[..]);
    }

    #[test]
    fn empty_stream_is_just_the_end_marker() {
        let mut out = [0u8; 8];
        assert_eq!(decompress_into(&[0x11, 0x00, 0x00], &mut out), Ok(0));
    }

    #[test]
    fn exact_fit_is_accepted() {
        let data = text();
        let packed = lzokay_native::compress(&data).unwrap();
        let mut out = vec![0u8; data.len()];
        assert_eq!(decompress_into(&packed, &mut out), Ok(data.len()));
    }

    #[test]
    fn one_byte_short_is_an_overrun() {
        let data = text();
        let packed = lzokay_native::compress(&data).unwrap();
        let mut out = vec![0u8; data.len() - 1];
        assert_eq!(decompress_into(&packed, &mut out), Err(LzoError::OutputOverrun));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let packed = lzokay_native::compress(&text()).unwrap();
        let mut out = vec![0u8; 100_000];
        assert_eq!(
            decompress_into(&packed[..packed.len() - 3], &mut out),
            Err(LzoError::InputOverrun)
        );
    }

    #[test]
    fn match_before_output_start_is_rejected() {
        // M2 instruction with nothing decoded yet
        let mut out = [0u8; 64];
        assert_eq!(decompress_into(&[0x40, 0x00, 0x11, 0x00, 0x00], &mut out), Err(LzoError::LookbehindOverrun));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut out = [0u8; 8];
        assert_eq!(decompress_into(&[0x11, 0x00, 0x00, 0xaa], &mut out), Err(LzoError::InputNotConsumed(1)));
    }

    #[test]
    fn garbage_never_panics() {
        let mut out = vec![0u8; 4096];
        for seed in 0..64u32 {
            let junk: Vec<u8> = (0..256u32).map(|i| (i.wrapping_mul(2654435761).wrapping_add(seed * 97) >> 13) as u8).collect();
            let _ = decompress_into(&junk, &mut out);
        }
    }
}
