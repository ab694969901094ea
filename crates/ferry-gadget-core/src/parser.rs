use crate::transfer::PAGE_SIZE;
use crate::transport::{UsbBulk, UsbServer, BULK_TRANSFER_BUFFER_LEN};
use crate::{Error, Result};
use ferry_proto::{ContainerHeader, ContainerType, CONTAINER_HEADER_LEN};
use tracing::trace;

/// Streaming decoder for one incoming bulk transmission.
///
/// A transmission ends when a transfer arrives that is shorter than the
/// internal buffer; zero-length terminators therefore fall out naturally.
/// Construct a fresh parser per container.
pub struct PtpDataParser<T: UsbBulk> {
    server: UsbServer<T>,
    buf: Vec<u8>,
    received: usize,
    offset: usize,
    eot: bool,
}

impl<T: UsbBulk> PtpDataParser<T> {
    pub fn new(server: UsbServer<T>) -> Self {
        Self {
            server,
            buf: vec![0u8; BULK_TRANSFER_BUFFER_LEN],
            received: 0,
            offset: 0,
            eot: false,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.eot {
            return Err(Error::EndOfTransmission);
        }
        self.offset = 0;
        self.received = self.server.read_packet(&mut self.buf).await?;
        // End of transmission is a transfer shorter than the buffer; PTP uses
        // zero-length termination, so zero is a valid size to receive.
        if self.received < self.buf.len() {
            self.eot = true;
            trace!(received = self.received, "end of transmission");
        }
        Ok(())
    }

    /// Exact-count read, refilling from the bulk pipe as needed.
    pub async fn read_buffer(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            if self.offset == self.received {
                self.flush().await?;
                if self.received == 0 {
                    return Err(Error::EndOfTransmission);
                }
            }
            let n = (dst.len() - filled).min(self.received - self.offset);
            dst[filled..filled + n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
            self.offset += n;
            filled += n;
        }
        Ok(())
    }

    /// Read directly into a caller-owned page-aligned buffer, bypassing the
    /// internal buffer once it is drained. Used on the SendObject hot path.
    pub async fn read_buffer_in_place(&mut self, dst: &mut [u8]) -> Result<usize> {
        if (dst.as_ptr() as usize) % PAGE_SIZE != 0 {
            return Err(Error::BufferNotAligned);
        }
        if self.offset < self.received {
            let n = dst.len().min(self.received - self.offset);
            dst[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
            self.offset += n;
            return Ok(n);
        }
        if self.eot {
            return Err(Error::EndOfTransmission);
        }
        let read = self.server.read_packet(dst).await?;
        if read < dst.len() {
            self.eot = true;
            trace!(received = read, "end of transmission (in-place)");
        }
        Ok(read)
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        let mut bytes = [0u8; 1];
        self.read_buffer(&mut bytes).await?;
        Ok(bytes[0])
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        let mut bytes = [0u8; 2];
        self.read_buffer(&mut bytes).await?;
        Ok(u16::from_le_bytes(bytes))
    }

    pub async fn read_u32(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_buffer(&mut bytes).await?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub async fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_buffer(&mut bytes).await?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub async fn read_u128(&mut self) -> Result<u128> {
        let mut bytes = [0u8; 16];
        self.read_buffer(&mut bytes).await?;
        Ok(u128::from_le_bytes(bytes))
    }

    /// Decode a PTP string: u8 unit count (terminator included), UTF-16LE
    /// code units. The text is preserved as UTF-8; nothing is truncated.
    pub async fn read_string(&mut self) -> Result<String> {
        let len = self.read_u8().await? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(self.read_u16().await?);
        }
        if units.last() == Some(&0) {
            units.pop();
        }
        Ok(String::from_utf16_lossy(&units))
    }

    /// Decode the 12-byte container header at the head of the transmission.
    pub async fn read_header(&mut self) -> Result<ContainerHeader> {
        let mut bytes = [0u8; CONTAINER_HEADER_LEN];
        self.read_buffer(&mut bytes).await?;
        Ok(ContainerHeader::decode(bytes)?)
    }

    /// Drain any remaining bytes until end-of-transmission. Resyncs the pipe
    /// when a data payload was not fully consumed.
    pub async fn finalize(&mut self) -> Result<()> {
        while !self.eot {
            match self.flush().await {
                Ok(()) | Err(Error::EndOfTransmission) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Streaming encoder for one outgoing bulk transmission.
///
/// Buffers one bulk transfer's worth of bytes and flushes full transfers as
/// it goes; `commit` flushes the remainder and appends the zero-length
/// terminator when the transmission length is an exact multiple of the bulk
/// max packet size.
pub struct PtpDataBuilder<T: UsbBulk> {
    server: UsbServer<T>,
    buf: Vec<u8>,
    total: u64,
}

impl<T: UsbBulk> PtpDataBuilder<T> {
    pub fn new(server: UsbServer<T>) -> Self {
        Self {
            server,
            buf: Vec::with_capacity(BULK_TRANSFER_BUFFER_LEN),
            total: 0,
        }
    }

    pub async fn write_buffer(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let room = BULK_TRANSFER_BUFFER_LEN - self.buf.len();
            let n = src.len().min(room);
            self.buf.extend_from_slice(&src[..n]);
            src = &src[n..];
            if self.buf.len() == BULK_TRANSFER_BUFFER_LEN {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    pub async fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_buffer(&[value]).await
    }

    pub async fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_buffer(&value.to_le_bytes()).await
    }

    pub async fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_buffer(&value.to_le_bytes()).await
    }

    pub async fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_buffer(&value.to_le_bytes()).await
    }

    /// Encode a PTP string: unit count including the terminator, UTF-16LE
    /// code units, trailing null. Empty strings encode as a lone zero count.
    pub async fn write_string(&mut self, value: &str) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.is_empty() {
            return self.write_u8(0).await;
        }
        let count = units.len() + 1;
        if count > u8::MAX as usize {
            return Err(Error::Protocol(ferry_proto::ResponseCode::InvalidParameter));
        }
        self.write_u8(count as u8).await?;
        for unit in units {
            self.write_u16(unit).await?;
        }
        self.write_u16(0).await
    }

    /// Start a Data container. `payload_len` is the byte count that will
    /// follow the header; payloads too large for the length field use the
    /// conventional 0xFFFFFFFF marker.
    pub async fn begin_data(&mut self, code: u16, transaction_id: u32, payload_len: u64) -> Result<()> {
        let length = (CONTAINER_HEADER_LEN as u64)
            .checked_add(payload_len)
            .filter(|len| *len <= u32::MAX as u64)
            .map(|len| len as u32)
            .unwrap_or(u32::MAX);
        let header = ContainerHeader::new(length, ContainerType::Data, code, transaction_id);
        self.write_buffer(&header.encode()).await
    }

    /// Flush buffered bytes and terminate the transmission.
    pub async fn commit(mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.flush_chunk().await?;
        }
        if self.total > 0 && self.total % self.server.max_packet_size() as u64 == 0 {
            trace!(total = self.total, "zero-length termination");
            self.server.write_packet(&[]).await?;
        }
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        self.server.write_packet(&self.buf).await?;
        self.total += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

/// In-memory dataset assembler for the fixed-layout PTP datasets
/// (DeviceInfo, StorageInfo, ObjectInfo, property descriptions). Building
/// the payload first gives the Data container an exact length field.
#[derive(Default)]
pub struct Dataset {
    buf: Vec<u8>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u128(&mut self, value: u128) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.is_empty() {
            self.buf.push(0);
            return self;
        }
        // Unit count includes the terminator; oversized names are clipped to
        // the protocol's 255-unit ceiling.
        let take = units.len().min(u8::MAX as usize - 1);
        self.buf.push((take + 1) as u8);
        for unit in &units[..take] {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
        self.buf.extend_from_slice(&0u16.to_le_bytes());
        self
    }

    /// PTP array: u32 element count then the elements.
    pub fn put_u16_array(&mut self, values: &[u16]) -> &mut Self {
        self.put_u32(values.len() as u32);
        for value in values {
            self.put_u16(*value);
        }
        self
    }

    pub fn put_u32_array(&mut self, values: &[u32]) -> &mut Self {
        self.put_u32(values.len() as u32);
        for value in values {
            self.put_u32(*value);
        }
        self
    }
}
