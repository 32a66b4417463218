//! Self-describing record codec.
//!
//! Records are rendered against a module's schema: multibyte integers and
//! addresses in network byte order, fixed-width fields on their natural
//! alignment (64-bit values on a 4-byte boundary), strings NUL-terminated
//! and unpadded, binary blobs behind a 4-byte-aligned length prefix.
//! Repeated groups are bracketed by `List`/`ListEnd` with a leading
//! element count.

use bytes::{BufMut, Bytes, BytesMut};
use meter_common::{MeterError, MeterResult};

use crate::schema::{DataType, TypeInfo};

/// Schema-driven record encoder.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: BytesMut,
}

impl RecordWriter {
    /// Empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn align_to(&mut self, align: usize) {
        if align > 1 {
            let pad = (align - self.buf.len() % align) % align;
            self.buf.put_bytes(0, pad);
        }
    }

    /// Write an unsigned 8-bit field.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Write a signed 8-bit field.
    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    /// Write an unsigned 16-bit field.
    pub fn put_u16(&mut self, v: u16) {
        self.align_to(2);
        self.buf.put_u16(v);
    }

    /// Write a signed 16-bit field.
    pub fn put_i16(&mut self, v: i16) {
        self.align_to(2);
        self.buf.put_i16(v);
    }

    /// Write an unsigned 32-bit field.
    pub fn put_u32(&mut self, v: u32) {
        self.align_to(4);
        self.buf.put_u32(v);
    }

    /// Write a signed 32-bit field.
    pub fn put_i32(&mut self, v: i32) {
        self.align_to(4);
        self.buf.put_i32(v);
    }

    /// Write an unsigned 64-bit field (4-byte aligned by convention).
    pub fn put_u64(&mut self, v: u64) {
        self.align_to(4);
        self.buf.put_u64(v);
    }

    /// Write a signed 64-bit field.
    pub fn put_i64(&mut self, v: i64) {
        self.align_to(4);
        self.buf.put_i64(v);
    }

    /// Write a single-precision float.
    pub fn put_f32(&mut self, v: f32) {
        self.align_to(4);
        self.buf.put_f32(v);
    }

    /// Write a double-precision float.
    pub fn put_f64(&mut self, v: f64) {
        self.align_to(4);
        self.buf.put_f64(v);
    }

    /// Write an IPv4 address in network byte order.
    pub fn put_ipv4(&mut self, v: [u8; 4]) {
        self.align_to(4);
        self.buf.put_slice(&v);
    }

    /// Write an IPv6 address.
    pub fn put_ipv6(&mut self, v: [u8; 16]) {
        self.align_to(4);
        self.buf.put_slice(&v);
    }

    /// Write a NUL-terminated string, unpadded.
    pub fn put_str(&mut self, v: &str) {
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
    }

    /// Write a length-prefixed binary blob.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.align_to(4);
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
    }

    /// Write the element count of a repeated group.
    pub fn put_list_count(&mut self, n: u32) {
        self.align_to(4);
        self.buf.put_u32(n);
    }

    /// Finish and take the encoded record.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Character
    Char(u8),
    /// Signed integer (8..64 bit)
    Int(i64),
    /// Unsigned integer (8..64 bit)
    UInt(u64),
    /// Float or double
    Float(f64),
    /// IPv4 address
    Ipv4([u8; 4]),
    /// IPv6 address
    Ipv6([u8; 16]),
    /// String
    Str(String),
    /// Binary blob
    Bin(Vec<u8>),
    /// Repeated group: one `Vec` of fields per element
    List(Vec<Vec<(String, Value)>>),
}

/// Schema-driven record decoder.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    /// Reader over an encoded record.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn align_to(&mut self, align: usize) {
        if align > 1 {
            self.pos += (align - self.pos % align) % align;
        }
    }

    fn take(&mut self, n: usize) -> MeterResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(MeterError::BadTrace(format!(
                "record truncated at offset {}",
                self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn value(&mut self, ty: DataType) -> MeterResult<Value> {
        self.align_to(ty.align());
        Ok(match ty {
            DataType::Char => Value::Char(self.take(1)?[0]),
            DataType::Int8 => Value::Int(self.take(1)?[0] as i8 as i64),
            DataType::UInt8 => Value::UInt(self.take(1)?[0] as u64),
            DataType::Int16 => {
                let b = self.take(2)?;
                Value::Int(i16::from_be_bytes([b[0], b[1]]) as i64)
            }
            DataType::UInt16 => {
                let b = self.take(2)?;
                Value::UInt(u16::from_be_bytes([b[0], b[1]]) as u64)
            }
            DataType::Int32 => {
                let b = self.take(4)?;
                Value::Int(i32::from_be_bytes(b.try_into().unwrap()) as i64)
            }
            DataType::UInt32 => {
                let b = self.take(4)?;
                Value::UInt(u32::from_be_bytes(b.try_into().unwrap()) as u64)
            }
            DataType::Int64 => {
                let b = self.take(8)?;
                Value::Int(i64::from_be_bytes(b.try_into().unwrap()))
            }
            DataType::UInt64 => {
                let b = self.take(8)?;
                Value::UInt(u64::from_be_bytes(b.try_into().unwrap()))
            }
            DataType::Float => {
                let b = self.take(4)?;
                Value::Float(f32::from_be_bytes(b.try_into().unwrap()) as f64)
            }
            DataType::Double => {
                let b = self.take(8)?;
                Value::Float(f64::from_be_bytes(b.try_into().unwrap()))
            }
            DataType::Ipv4Addr => {
                let b = self.take(4)?;
                Value::Ipv4(b.try_into().unwrap())
            }
            DataType::Ipv6Addr => {
                let b = self.take(16)?;
                Value::Ipv6(b.try_into().unwrap())
            }
            DataType::String => {
                let start = self.pos;
                let nul = self.buf[start..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| {
                        MeterError::BadTrace("unterminated string in record".into())
                    })?;
                let s = String::from_utf8_lossy(&self.buf[start..start + nul]).into_owned();
                self.pos = start + nul + 1;
                Value::Str(s)
            }
            DataType::Binary => {
                let b = self.take(4)?;
                let len = u32::from_be_bytes(b.try_into().unwrap()) as usize;
                Value::Bin(self.take(len)?.to_vec())
            }
            DataType::List | DataType::ListEnd => unreachable!("handled by decode_record"),
        })
    }
}

/// Decode an encoded record against its schema.
pub fn decode_record(schema: &[TypeInfo], buf: &[u8]) -> MeterResult<Vec<(String, Value)>> {
    let mut r = RecordReader::new(buf);
    let mut i = 0;
    decode_fields(schema, &mut i, &mut r, false)
}

fn decode_fields(
    schema: &[TypeInfo],
    i: &mut usize,
    r: &mut RecordReader<'_>,
    in_list: bool,
) -> MeterResult<Vec<(String, Value)>> {
    let mut out = Vec::new();
    while *i < schema.len() {
        let info = schema[*i];
        match info.ty {
            DataType::List => {
                *i += 1;
                let group_start = *i;
                r.align_to(4);
                let count = u32::from_be_bytes(r.take(4)?.try_into().unwrap());
                let mut elems = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    *i = group_start;
                    elems.push(decode_fields(schema, i, r, true)?);
                }
                if count == 0 {
                    // still need to skip the schema to the matching ListEnd
                    let mut depth = 1;
                    while depth > 0 {
                        match schema.get(*i).map(|t| t.ty) {
                            Some(DataType::List) => depth += 1,
                            Some(DataType::ListEnd) => depth -= 1,
                            None => {
                                return Err(MeterError::BadTrace(
                                    "schema list without end marker".into(),
                                ))
                            }
                            _ => {}
                        }
                        *i += 1;
                    }
                }
                out.push((info.label.to_string(), Value::List(elems)));
            }
            DataType::ListEnd => {
                *i += 1;
                if in_list {
                    return Ok(out);
                }
            }
            ty => {
                out.push((info.label.to_string(), r.value(ty)?));
                *i += 1;
            }
        }
    }
    Ok(out)
}
