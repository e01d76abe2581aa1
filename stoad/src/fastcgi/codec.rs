use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// FastCGI record types.
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

// FastCGI roles.
pub const FCGI_RESPONDER: u16 = 1;

// Protocol status codes carried by END_REQUEST.
pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

// Protocol version.
const FCGI_VERSION_1: u8 = 1;

/// Largest record content that still leaves the header 8-byte aligned.
pub const MAX_RECORD_CONTENT: usize = 65528;

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2] = (self.request_id >> 8) as u8;
        buf[3] = (self.request_id & 0xff) as u8;
        buf[4] = (self.content_length >> 8) as u8;
        buf[5] = (self.content_length & 0xff) as u8;
        buf[6] = self.padding_length;
        buf[7] = 0; // reserved
        buf
    }

    pub fn decode(buf: &[u8; 8]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// A complete FastCGI record. One instance is rewritten and reused across a
/// session's read loop so the content buffer is allocated once.
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: BytesMut,
}

impl Record {
    pub fn new() -> Self {
        Self {
            header: RecordHeader {
                version: FCGI_VERSION_1,
                record_type: 0,
                request_id: 0,
                content_length: 0,
                padding_length: 0,
            },
            content: BytesMut::new(),
        }
    }

    /// Rewrite this record in place for reuse.
    pub fn rewrite(&mut self, record_type: u8, request_id: u16, content: &[u8]) {
        self.header.record_type = record_type;
        self.header.request_id = request_id;
        self.header.content_length = content.len() as u16;
        self.header.padding_length = padding_for(content.len()) as u8;
        self.content.clear();
        self.content.extend_from_slice(content);
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

fn padding_for(content_len: usize) -> usize {
    (8 - (content_len % 8)) % 8
}

/// Encode a FastCGI name-value pair; errors when the encoded pair would not
/// fit a single PARAMS record.
pub fn encode_param(buf: &mut BytesMut, name: &[u8], value: &[u8]) -> Result<()> {
    let name_len_len = if name.len() < 128 { 1 } else { 4 };
    let value_len_len = if value.len() < 128 { 1 } else { 4 };
    let encoded = name_len_len + value_len_len + name.len() + value.len();
    if encoded > MAX_RECORD_CONTENT {
        return Err(anyhow!(
            "FastCGI param too large: {} ({} bytes encoded)",
            String::from_utf8_lossy(name),
            encoded
        ));
    }
    put_nv_len(buf, name.len());
    put_nv_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
    Ok(())
}

fn put_nv_len(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | 0x8000_0000);
    }
}

/// Decode all name-value pairs from a PARAMS content buffer.
pub fn decode_params(mut data: &[u8]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    while !data.is_empty() {
        let name_len = read_nv_len(&mut data)?;
        let value_len = read_nv_len(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(anyhow!("truncated name-value pair"));
        }
        let name = std::str::from_utf8(&data[..name_len])?.to_string();
        let value = std::str::from_utf8(&data[name_len..name_len + value_len])?.to_string();
        data = &data[name_len + value_len..];
        map.insert(name, value);
    }
    Ok(map)
}

fn read_nv_len(data: &mut &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Err(anyhow!("unexpected end of name-value data"));
    }
    let first = data[0];
    if first < 128 {
        *data = &data[1..];
        Ok(first as usize)
    } else {
        if data.len() < 4 {
            return Err(anyhow!("truncated 4-byte name-value length"));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        Ok(len as usize)
    }
}

/// Read one FastCGI record, reusing the given record's content buffer.
pub async fn read_record_into<R: AsyncRead + Unpin>(
    reader: &mut R,
    record: &mut Record,
) -> Result<()> {
    let mut hdr_buf = [0u8; 8];
    reader.read_exact(&mut hdr_buf).await?;
    let header = RecordHeader::decode(&hdr_buf);

    if header.version != FCGI_VERSION_1 {
        return Err(anyhow!(
            "unsupported FastCGI version: {} (expected {})",
            header.version,
            FCGI_VERSION_1
        ));
    }

    let content_len = header.content_length as usize;
    let padding_len = header.padding_length as usize;
    let total = content_len + padding_len;

    record.content.clear();
    if total > 0 {
        record.content.resize(total, 0);
        reader.read_exact(&mut record.content).await?;
    }
    record.content.truncate(content_len);
    record.header = header;
    Ok(())
}

/// Write one FastCGI record.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: u8,
    request_id: u16,
    content: &[u8],
) -> Result<()> {
    if content.len() > MAX_RECORD_CONTENT {
        return Err(anyhow!("FastCGI record too large: {}", content.len()));
    }
    let padding = padding_for(content.len());
    let header = RecordHeader {
        version: FCGI_VERSION_1,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
    };
    writer.write_all(&header.encode()).await?;
    if !content.is_empty() {
        writer.write_all(content).await?;
    }
    if padding > 0 {
        let pad = [0u8; 8];
        writer.write_all(&pad[..padding]).await?;
    }
    Ok(())
}

/// Write a record stream in MAX_RECORD_CONTENT chunks, then the empty
/// terminator record.
pub async fn write_stream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: u8,
    request_id: u16,
    data: &[u8],
) -> Result<()> {
    for chunk in data.chunks(MAX_RECORD_CONTENT) {
        write_record(writer, record_type, request_id, chunk).await?;
    }
    write_record(writer, record_type, request_id, &[]).await?;
    Ok(())
}

/// Write a BEGIN_REQUEST record: role, flags, five reserved zeroes.
pub async fn write_begin_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: u16,
    role: u16,
    flags: u8,
) -> Result<()> {
    let mut body = [0u8; 8];
    body[0] = (role >> 8) as u8;
    body[1] = (role & 0xff) as u8;
    body[2] = flags;
    write_record(writer, FCGI_BEGIN_REQUEST, request_id, &body).await
}

/// Decoded END_REQUEST body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequest {
    pub fn decode(content: &[u8]) -> Result<Self> {
        if content.len() < 5 {
            return Err(anyhow!("END_REQUEST body too short"));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }
}
