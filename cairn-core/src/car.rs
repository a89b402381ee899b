//! Bundle stream container (CARv1)
//!
//! A stream is a varint-prefixed DAG-CBOR header `{version: 1, roots: [..]}`
//! followed by sections, each `varint(len) ‖ cid ‖ bytes`. Reading and writing
//! are incremental over tokio's async I/O traits.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cid::{Cid, CID_LEN};
use crate::codec::{self, fields, Value};
use crate::error::{Error, Result};

/// Container format version.
pub const CAR_VERSION: i64 = 1;

/// Largest header accepted.
const MAX_HEADER_SIZE: u64 = 64 * 1024;

/// Longest LEB128 encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Append the unsigned LEB128 encoding of `value`
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read one varint. `Ok(None)` on a clean end of stream before the first byte.
async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(Error::Decoding("stream ended inside a varint".to_string()));
        }
        value |= ((byte[0] & 0x7f) as u64) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(Error::Decoding("varint too long".to_string()))
}

fn header_value(roots: &[Cid]) -> Value {
    Value::from_pairs([
        ("version", Value::Integer(CAR_VERSION)),
        ("roots", Value::List(roots.iter().copied().map(Value::Link).collect())),
    ])
}

/// Writes a bundle stream
pub struct CarWriter<W> {
    writer: W,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> CarWriter<W> {
    /// Write the header and return a writer ready for sections
    pub async fn new(mut writer: W, roots: &[Cid]) -> Result<Self> {
        let header = codec::encode(&header_value(roots))?;
        let mut buf = Vec::with_capacity(header.len() + MAX_VARINT_LEN);
        encode_varint(header.len() as u64, &mut buf);
        buf.extend_from_slice(&header);
        writer.write_all(&buf).await?;
        Ok(Self {
            writer,
            bytes_written: buf.len() as u64,
        })
    }

    /// Append one section; returns the number of bytes it took
    pub async fn write_block(&mut self, cid: Cid, data: &[u8]) -> Result<u64> {
        let mut prefix = Vec::with_capacity(MAX_VARINT_LEN + CID_LEN);
        encode_varint((CID_LEN + data.len()) as u64, &mut prefix);
        prefix.extend_from_slice(&cid.to_bytes());
        self.writer.write_all(&prefix).await?;
        self.writer.write_all(data).await?;
        let written = (prefix.len() + data.len()) as u64;
        self.bytes_written += written;
        Ok(written)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and hand back the underlying writer
    pub async fn finish(mut self) -> Result<W> {
        self.writer.flush().await?;
        Ok(self.writer)
    }
}

/// A section as read off the stream; the CID is as declared, not yet checked
#[derive(Debug, Clone)]
pub struct Section {
    pub cid: Cid,
    pub data: Bytes,
    /// Bytes the section occupied on the wire
    pub wire_len: u64,
}

/// Reads a bundle stream section by section
pub struct CarReader<R> {
    reader: R,
    roots: Vec<Cid>,
    max_block_size: usize,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> CarReader<R> {
    /// Read and check the header
    pub async fn new(mut reader: R, max_block_size: usize) -> Result<Self> {
        let (len, prefix) = read_varint(&mut reader)
            .await?
            .ok_or_else(|| Error::Decoding("empty bundle stream".to_string()))?;
        if len == 0 || len > MAX_HEADER_SIZE {
            return Err(Error::Decoding(format!("bad header length {}", len)));
        }
        let mut header = vec![0u8; len as usize];
        reader.read_exact(&mut header).await?;
        let value = codec::decode(&header)?;
        let map = fields::map(&value, "header")?;
        match map.get("version") {
            Some(Value::Integer(CAR_VERSION)) => {}
            other => {
                return Err(Error::Decoding(format!("unsupported container version {:?}", other)));
            }
        }
        let roots = fields::links(map, "roots")?;
        Ok(Self {
            reader,
            roots,
            max_block_size,
            bytes_read: prefix as u64 + len,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next section, or `None` at a clean end of stream
    pub async fn next_section(&mut self) -> Result<Option<Section>> {
        let Some((len, prefix)) = read_varint(&mut self.reader).await? else {
            return Ok(None);
        };
        let len = len as usize;
        if len < CID_LEN {
            return Err(Error::Decoding(format!("section of {} bytes cannot hold a CID", len)));
        }
        if len - CID_LEN > self.max_block_size {
            return Err(Error::Decoding(format!(
                "block of {} bytes exceeds the {} byte limit",
                len - CID_LEN,
                self.max_block_size
            )));
        }
        let mut cid_bytes = [0u8; CID_LEN];
        self.reader.read_exact(&mut cid_bytes).await?;
        let cid = Cid::from_bytes(&cid_bytes)?;
        let mut data = vec![0u8; len - CID_LEN];
        self.reader.read_exact(&mut data).await?;

        let wire_len = (prefix + len) as u64;
        self.bytes_read += wire_len;
        Ok(Some(Section {
            cid,
            data: Bytes::from(data),
            wire_len,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        encode_varint(0, &mut out);
        encode_varint(127, &mut out);
        encode_varint(300, &mut out);
        assert_eq!(out, vec![0x00, 0x7f, 0xac, 0x02]);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let a = Bytes::from_static(b"\xa1atb");
        let b = Bytes::from(vec![0xa0]);
        let (ca, cb) = (Cid::for_block(&a), Cid::for_block(&b));

        let mut writer = CarWriter::new(Vec::new(), &[ca]).await.unwrap();
        writer.write_block(ca, &a).await.unwrap();
        writer.write_block(cb, &b).await.unwrap();
        let total = writer.bytes_written();
        let buf = writer.finish().await.unwrap();
        assert_eq!(buf.len() as u64, total);

        let mut reader = CarReader::new(buf.as_slice(), 1024).await.unwrap();
        assert_eq!(reader.roots(), &[ca]);
        let first = reader.next_section().await.unwrap().unwrap();
        assert_eq!((first.cid, first.data), (ca, a));
        let second = reader.next_section().await.unwrap().unwrap();
        assert_eq!((second.cid, second.data), (cb, b));
        assert!(reader.next_section().await.unwrap().is_none());
        assert_eq!(reader.bytes_read(), total);
    }

    #[tokio::test]
    async fn test_oversized_block_rejected() {
        let data = vec![0u8; 100];
        let cid = Cid::for_block(&data);
        let mut writer = CarWriter::new(Vec::new(), &[cid]).await.unwrap();
        writer.write_block(cid, &data).await.unwrap();
        let buf = writer.finish().await.unwrap();

        let mut reader = CarReader::new(buf.as_slice(), 50).await.unwrap();
        assert!(matches!(reader.next_section().await, Err(Error::Decoding(_))));
    }

    #[tokio::test]
    async fn test_truncated_section_is_an_error() {
        let data = vec![1u8; 10];
        let cid = Cid::for_block(&data);
        let mut writer = CarWriter::new(Vec::new(), &[]).await.unwrap();
        writer.write_block(cid, &data).await.unwrap();
        let mut buf = writer.finish().await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut reader = CarReader::new(buf.as_slice(), 1024).await.unwrap();
        assert!(reader.roots().is_empty());
        assert!(matches!(reader.next_section().await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_garbage_header_rejected() {
        let garbage: &[u8] = &[0x02, 0xff, 0xff];
        assert!(CarReader::new(garbage, 1024).await.is_err());
        let empty: &[u8] = &[];
        assert!(CarReader::new(empty, 1024).await.is_err());
    }
}
