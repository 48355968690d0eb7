// ── Little-endian frame reader ──

use crate::error::DecodeError;

/// Bounds-checked cursor over one payload.
pub(crate) struct FrameReader<'a> {
    frame: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(frame: &'static str, buf: &'a [u8]) -> Self {
        Self { frame, buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or(DecodeError::Truncated {
                frame: self.frame,
                needed: end,
                got: self.buf.len(),
            })?;
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        self.take::<1>().map(|[b]| b)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub(crate) fn i16(&mut self) -> Result<i16, DecodeError> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                frame: self.frame,
                needed: end,
                got: self.buf.len(),
            });
        }
        self.pos = end;
        Ok(())
    }
}

/// Bit `n` of `flags` is set.
pub(crate) fn bit(flags: u16, n: u8) -> bool {
    flags & (1 << n) != 0
}
