pub(crate) mod chunk;

pub use chunk::{Chunk, DynBuf};
pub(crate) use chunk::ChunkWriter;

/// Traits for writing data to buffers.
pub(crate) mod writer {
    /// Error type indicating a write operation failed.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct DidntWrite;

    /// A trait for writing bytes into a buffer.
    pub(crate) trait Writer {
        /// Writes all bytes from `bytes` into the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntWrite` if the buffer has insufficient space to write
        /// all bytes.
        fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite>;

        /// Writes a single byte to the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntWrite` if the buffer is full.
        fn write_u8(&mut self, byte: u8) -> Result<(), DidntWrite> {
            self.write_exact(core::slice::from_ref(&byte))
        }
    }

    impl Writer for Vec<u8> {
        fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite> {
            self.extend_from_slice(bytes);
            Ok(())
        }
    }
}

/// Traits for reading data from buffers.
pub(crate) mod reader {
    use super::Chunk;

    /// Error type indicating a read operation failed.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct DidntRead;

    /// A trait for reading bytes from a buffer, advancing the read position.
    pub(crate) trait Reader {
        /// Reads exactly enough bytes to fill `into`.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if the buffer has insufficient data.
        fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead>;

        /// Reads a single byte from the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if the buffer is empty.
        fn read_u8(&mut self) -> Result<u8, DidntRead>;

        /// Reads exactly `len` bytes, returning them as a single `Chunk`.
        ///
        /// This enables zero-copy reading when the underlying buffer supports
        /// it.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if the buffer has insufficient data.
        fn read_chunk(&mut self, len: usize) -> Result<Chunk, DidntRead>;

        /// Returns the number of bytes remaining to be read from this buffer.
        fn remaining(&self) -> usize;

        /// Returns `true` if there is more data to read.
        fn can_read(&self) -> bool {
            self.remaining() != 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunk, reader::Reader, writer::Writer};

    #[test]
    fn vec_writer_chunk_reader() {
        let mut buf: Vec<u8> = vec![];
        buf.write_u8(0xAB).unwrap();
        buf.write_exact(&[1, 2, 3, 4]).unwrap();

        let mut chunk = Chunk::from(buf);
        assert_eq!(chunk.remaining(), 5);
        assert_eq!(chunk.read_u8().unwrap(), 0xAB);

        let mut four = [0u8; 4];
        chunk.read_exact(&mut four).unwrap();
        assert_eq!(four, [1, 2, 3, 4]);
        assert!(!chunk.can_read());
        assert!(chunk.read_u8().is_err());
    }

    #[test]
    fn chunk_reader_zero_copy() {
        let mut chunk = Chunk::from(vec![9u8, 8, 7, 6, 5]);
        let head = chunk.read_chunk(2).unwrap();
        assert_eq!(head.as_slice(), &[9, 8]);
        assert_eq!(chunk.as_slice(), &[7, 6, 5]);
        assert!(chunk.read_chunk(4).is_err());
    }
}
