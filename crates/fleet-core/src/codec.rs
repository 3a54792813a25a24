//! # codec
//!
//! why: frame wal and snapshot streams so records can be read back one at a time
//! relations: used by the replicated log's snapshot/restore and by snapshot stores
//! what: 8 byte little-endian length header followed by a serialized body

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

/// size of the length header in front of every record
pub const HEADER_LEN: usize = 8;

/// refuse records larger than this when reading; guards against corrupt headers
pub const MAX_RECORD_LEN: u64 = 64 * 1024 * 1024;

/// write a single length-prefixed record
pub fn write_record<W: Write + ?Sized>(w: &mut W, body: &[u8]) -> io::Result<()> {
    w.write_u64::<LittleEndian>(body.len() as u64)?;
    w.write_all(body)
}

/// read a single record; `None` on a clean end of stream
pub fn read_record<R: Read + ?Sized>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record header"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = LittleEndian::read_u64(&header);
    if len > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record of {} bytes exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(Some(body))
}

/// serialize a value as json and write it as one record
pub fn write_json<W: Write + ?Sized, T: Serialize>(w: &mut W, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_record(w, &body)
}

/// read one record and decode it as json; `None` on a clean end of stream
pub fn read_json<R: Read + ?Sized, T: DeserializeOwned>(r: &mut R) -> io::Result<Option<T>> {
    match read_record(r)? {
        Some(body) => serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_is_little_endian_u64() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[HEADER_LEN..], b"abc");
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut cursor = Cursor::new(vec![1u8, 0, 0]);
        let err = read_record(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(MAX_RECORD_LEN + 1).unwrap();
        let err = read_record(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
