//! Bounds-checked buffers used by the update protocol codec

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    EndOfBuffer,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Common interface for reading and writing packet data.
///
/// All multi-byte integers are big-endian. Every read is checked against the
/// end of the buffer, so a truncated packet surfaces as `EndOfBuffer` rather
/// than garbage data.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);
        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read_u16()? as u32) << 16) | (self.read_u16()? as u32);
        Ok(res)
    }

    fn read_u64(&mut self) -> Result<u64> {
        let res = ((self.read_u32()? as u64) << 32) | (self.read_u32()? as u64);
        Ok(res)
    }

    /// Read `len` bytes starting at the current position and step past them.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let start = self.pos();
        let data = self.get_range(start, len)?.to_vec();
        self.step(len)?;
        Ok(data)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;
        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_u16((val >> 16) as u16)?;
        self.write_u16((val & 0xFFFF) as u16)?;
        Ok(())
    }

    fn write_u64(&mut self, val: u64) -> Result<()> {
        self.write_u32((val >> 32) as u32)?;
        self.write_u32((val & 0xFFFF_FFFF) as u32)?;
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        for b in data {
            self.write(*b)?;
        }
        Ok(())
    }
}

/// A fixed-size buffer matching the maximum update packet length. Used on the
/// receive path, where a datagram is read straight into `buf`.
pub struct BytePacketBuffer {
    pub buf: [u8; 1500],
    pub pos: usize,
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 1500],
            pos: 0,
        }
    }
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;
        Ok(())
    }
}

/// A growable buffer for building outgoing packets, and for decoding a
/// datagram of known length. Reads are bounded by the current contents rather
/// than the capacity, which is what makes truncation detection work.
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: data.to_vec(),
            pos: 0,
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buffer[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        self.buffer.push(val);
        self.pos += 1;
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;
        Ok(())
    }
}
