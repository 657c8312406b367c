use super::{BlipCodec, LCodec, RCodec, WCodec};
use crate::buffers::{
    reader::{DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

/// Maximum encoded size of a `u64` varint.
pub(crate) const VLE_LEN_MAX: usize = 10;

/// Number of bytes `x` occupies once varint-encoded.
pub(crate) const fn vle_len(x: u64) -> usize {
    // 7 payload bits per byte; zero still takes one byte.
    match x.checked_ilog2() {
        Some(bits) => (bits as usize) / 7 + 1,
        None => 1,
    }
}

impl LCodec<u64> for BlipCodec {
    fn w_len(self, x: u64) -> usize {
        vle_len(x)
    }
}

impl LCodec<usize> for BlipCodec {
    fn w_len(self, x: usize) -> usize {
        self.w_len(x as u64)
    }
}

impl LCodec<u32> for BlipCodec {
    fn w_len(self, x: u32) -> usize {
        self.w_len(x as u64)
    }
}

// u8 is written raw, not varint-encoded.
impl<W> WCodec<u8, &mut W> for BlipCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: u8) -> Self::Output {
        writer.write_u8(x)
    }
}

impl<R> RCodec<u8, &mut R> for BlipCodec
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<u8, Self::Error> {
        reader.read_u8()
    }
}

// u64
impl<W> WCodec<u64, &mut W> for BlipCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, mut x: u64) -> Self::Output {
        let mut buffer = [0u8; VLE_LEN_MAX];
        let mut len = 0;
        while (x & !0x7f_u64) != 0 {
            buffer[len] = (x as u8) | 0x80;
            len += 1;
            x >>= 7;
        }
        buffer[len] = x as u8;
        len += 1;
        writer.write_exact(&buffer[..len])
    }
}

impl<R> RCodec<u64, &mut R> for BlipCodec
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<u64, Self::Error> {
        let mut v: u64 = 0;
        for i in 0..VLE_LEN_MAX {
            let b = reader.read_u8()?;
            let payload = (b & 0x7f) as u64;
            let shift = 7 * i;
            // The 10th byte holds only the top bit of a u64.
            if shift == 63 && payload > 1 {
                return Err(DidntRead);
            }
            v |= payload << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
        }
        Err(DidntRead)
    }
}

// u32: reads as u64 and fails on values that do not fit, which is how the
// properties-size prefix is bounded on the wire.
impl<W> WCodec<u32, &mut W> for BlipCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: u32) -> Self::Output {
        self.write(writer, x as u64)
    }
}

impl<R> RCodec<u32, &mut R> for BlipCodec
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<u32, Self::Error> {
        let x: u64 = self.read(reader)?;
        u32::try_from(x).map_err(|_| DidntRead)
    }
}

impl<W> WCodec<usize, &mut W> for BlipCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: usize) -> Self::Output {
        self.write(writer, x as u64)
    }
}
