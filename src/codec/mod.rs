pub(crate) mod vle;

use crate::{
    buffers::{
        reader::{DidntRead, Reader},
        writer::{DidntWrite, Writer},
    },
    protocol::{FrameFlags, FrameHeader, MessageNo},
};

pub(crate) trait WCodec<Message, Buffer> {
    type Output;
    fn write(self, buffer: Buffer, message: Message) -> Self::Output;
}

pub(crate) trait RCodec<Message, Buffer> {
    type Error;
    fn read(self, buffer: Buffer) -> Result<Message, Self::Error>;
}

// Calculate the length of the value once serialized
pub(crate) trait LCodec<Message> {
    fn w_len(self, message: Message) -> usize;
}

#[derive(Clone, Copy, Default)]
pub(crate) struct BlipCodec;

impl BlipCodec {
    pub(crate) const fn new() -> Self {
        Self
    }
}

// MessageNo is a varint on the wire.
impl LCodec<MessageNo> for BlipCodec {
    fn w_len(self, x: MessageNo) -> usize {
        self.w_len(x.get())
    }
}

impl<W> WCodec<MessageNo, &mut W> for BlipCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: MessageNo) -> Self::Output {
        self.write(writer, x.get())
    }
}

impl<R> RCodec<MessageNo, &mut R> for BlipCodec
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<MessageNo, Self::Error> {
        let n: u64 = self.read(reader)?;
        Ok(MessageNo::new(n))
    }
}

// Frame header: message number varint followed by one flag byte.
impl LCodec<&FrameHeader> for BlipCodec {
    fn w_len(self, x: &FrameHeader) -> usize {
        self.w_len(x.number) + 1
    }
}

impl<W> WCodec<&FrameHeader, &mut W> for BlipCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, header: &FrameHeader) -> Self::Output {
        self.write(&mut *writer, header.number)?;
        self.write(&mut *writer, header.flags.bits())?;
        Ok(())
    }
}

impl<R> RCodec<FrameHeader, &mut R> for BlipCodec
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<FrameHeader, Self::Error> {
        let number: MessageNo = self.read(&mut *reader)?;
        let flags: u8 = self.read(&mut *reader)?;
        Ok(FrameHeader {
            number,
            flags: FrameFlags::from_bits(flags),
        })
    }
}
