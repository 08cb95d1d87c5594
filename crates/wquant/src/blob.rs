//! Binary weight blob.
//!
//! The blob is a flat sequence of records. Each record is a 64-byte header
//! followed by the array payload, zero-padded to a multiple of 64 bytes:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "DNNw"
//!      4     4  version (0)
//!      8     4  type code (float 0, int 1, qweight 2, int8 3)
//!     12     4  payload size in bytes
//!     16     4  padded block size in bytes
//!     20    44  name, NUL terminated
//! ```
//!
//! All integers are little-endian `i32`.

use std::collections::BTreeSet;
use std::io::Write;

use tracing::debug;
use wquant_core::{DType, Error, Result};

use crate::sink::{ArrayOptions, NamedArray, WeightSink};

pub const BLOB_MAGIC: [u8; 4] = *b"DNNw";
pub const BLOB_VERSION: i32 = 0;
pub const RECORD_HEADER_SIZE: usize = 64;
pub const RECORD_ALIGN: usize = 64;
/// Bytes reserved for the name, terminator included.
pub const NAME_FIELD_SIZE: usize = 44;

fn padded(size: usize) -> usize {
    size.div_ceil(RECORD_ALIGN) * RECORD_ALIGN
}

/// Writes arrays as blob records.
///
/// Text streams are ignored. Arrays whose preprocessor condition does not hold
/// for the configured set of defines are skipped, so the blob matches a build
/// of the generated source with the same defines.
#[derive(Debug)]
pub struct BlobWriter<W: Write> {
    out: W,
    defines: BTreeSet<String>,
    records: usize,
    bytes: usize,
}

impl<W: Write> BlobWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            defines: BTreeSet::new(),
            records: 0,
            bytes: 0,
        }
    }

    /// Treat `symbols` as defined when evaluating array conditions.
    pub fn with_defines<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defines.extend(symbols.into_iter().map(Into::into));
        self
    }

    /// Records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        debug!(records = self.records, bytes = self.bytes, "finished weight blob");
        Ok(self.out)
    }
}

impl<W: Write> BlobWriter<W> {
    fn selected(&self, options: ArrayOptions) -> bool {
        options
            .condition
            .map_or(true, |cond| self.defines.contains(cond.symbol) == cond.defined)
    }
}

/// Record header for an array of `payload_len` bytes.
fn record_header(
    name: &str,
    dtype: DType,
    payload_len: usize,
    offset: usize,
) -> Result<[u8; RECORD_HEADER_SIZE]> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() >= NAME_FIELD_SIZE {
        return Err(Error::NameTooLong {
            name: name.to_string(),
            len: name_bytes.len(),
            max: NAME_FIELD_SIZE - 1,
        });
    }
    let size_field = |value: usize| {
        i32::try_from(value).map_err(|_| {
            Error::invalid_blob(
                format!("array {name}: {value} bytes do not fit the i32 size field"),
                offset,
            )
        })
    };
    let size = size_field(payload_len)?;
    let block_size = size_field(padded(payload_len))?;

    let mut header = [0u8; RECORD_HEADER_SIZE];
    header[0..4].copy_from_slice(&BLOB_MAGIC);
    header[4..8].copy_from_slice(&BLOB_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&dtype.code().to_le_bytes());
    header[12..16].copy_from_slice(&size.to_le_bytes());
    header[16..20].copy_from_slice(&block_size.to_le_bytes());
    header[20..20 + name_bytes.len()].copy_from_slice(name_bytes);
    Ok(header)
}

impl<W: Write> WeightSink for BlobWriter<W> {
    fn binary_blob(&self) -> bool {
        true
    }

    fn check_array(&self, array: &NamedArray, options: ArrayOptions) -> Result<()> {
        if self.selected(options) {
            record_header(&array.name, array.dtype(), array.byte_len(), self.bytes)?;
        }
        Ok(())
    }

    fn write_array(&mut self, array: &NamedArray, options: ArrayOptions) -> Result<()> {
        if !self.selected(options) {
            debug!(name = %array.name, "skipped conditional array");
            return Ok(());
        }

        let payload = array.to_le_bytes();
        let header = record_header(&array.name, array.dtype(), payload.len(), self.bytes)?;
        let block_size = padded(payload.len());

        self.out.write_all(&header)?;
        self.out.write_all(&payload)?;
        self.out.write_all(&vec![0u8; block_size - payload.len()])?;

        self.records += 1;
        self.bytes += RECORD_HEADER_SIZE + block_size;
        Ok(())
    }

    fn write_header(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn write_source(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// One array found in a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobArray<'a> {
    pub name: &'a str,
    pub dtype: DType,
    /// Payload size in bytes.
    pub size: usize,
    pub data: &'a [u8],
}

impl BlobArray<'_> {
    pub fn as_f32(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn as_i32(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn as_i8(&self) -> Vec<i8> {
        self.data.iter().map(|&b| b as i8).collect()
    }
}

/// Parsed view of a weight blob.
#[derive(Debug, Clone, Default)]
pub struct WeightBlob<'a> {
    arrays: Vec<BlobArray<'a>>,
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

impl<'a> WeightBlob<'a> {
    /// Walk every record of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut arrays = Vec::new();
        let mut pos = 0usize;

        while pos < data.len() {
            if data.len() - pos < RECORD_HEADER_SIZE {
                return Err(Error::invalid_blob("truncated record header", pos));
            }
            let h = &data[pos..pos + RECORD_HEADER_SIZE];
            if h[0..4] != BLOB_MAGIC {
                return Err(Error::invalid_blob("bad magic", pos));
            }
            let version = read_i32(h, 4);
            if version != BLOB_VERSION {
                return Err(Error::invalid_blob(format!("unsupported version {version}"), pos));
            }
            let code = read_i32(h, 8);
            let dtype = DType::from_code(code)
                .ok_or_else(|| Error::invalid_blob(format!("unknown type code {code}"), pos))?;
            let size = read_i32(h, 12);
            let block_size = read_i32(h, 16);
            if size < 0 || block_size < size {
                return Err(Error::invalid_blob(
                    format!("size {size} does not fit block {block_size}"),
                    pos,
                ));
            }
            let (size, block_size) = (size as usize, block_size as usize);
            if size % dtype.size() != 0 {
                return Err(Error::invalid_blob(
                    format!("size {size} not a multiple of {}", dtype.size()),
                    pos,
                ));
            }

            let name_field = &h[20..20 + NAME_FIELD_SIZE];
            let name_len = name_field
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::invalid_blob("unterminated name", pos + 20))?;
            let name = std::str::from_utf8(&name_field[..name_len])
                .map_err(|_| Error::invalid_blob("name is not UTF-8", pos + 20))?;

            let start = pos + RECORD_HEADER_SIZE;
            if data.len() - start < block_size {
                return Err(Error::invalid_blob("truncated payload", start));
            }

            arrays.push(BlobArray {
                name,
                dtype,
                size,
                data: &data[start..start + size],
            });
            pos = start + block_size;
        }

        Ok(Self { arrays })
    }

    /// Look an array up by name.
    pub fn find(&self, name: &str) -> Option<&BlobArray<'a>> {
        self.arrays.iter().find(|a| a.name == name)
    }

    /// Records in blob order.
    pub fn arrays(&self) -> &[BlobArray<'a>] {
        &self.arrays
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Condition;

    fn blob_of(arrays: &[NamedArray]) -> Vec<u8> {
        let mut w = BlobWriter::new(Vec::new());
        for a in arrays {
            w.write_array(a, ArrayOptions::default()).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn test_record_layout() {
        let bytes = blob_of(&[NamedArray::int8("w", vec![1, -1, 3])]);
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[0..4], b"DNNw");
        assert_eq!(read_i32(&bytes, 8), 3);
        assert_eq!(read_i32(&bytes, 12), 3);
        assert_eq!(read_i32(&bytes, 16), 64);
        assert_eq!(&bytes[20..22], b"w\0");
        assert_eq!(&bytes[64..67], &[1, 0xff, 3]);
        assert!(bytes[67..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_find() {
        let bytes = blob_of(&[
            NamedArray::float("a_bias", vec![0.5, -1.0]),
            NamedArray::int("a_idx", vec![1, 0]),
        ]);
        let blob = WeightBlob::parse(&bytes).unwrap();
        assert_eq!(blob.len(), 2);
        assert_eq!(blob.find("a_bias").unwrap().as_f32(), vec![0.5, -1.0]);
        let idx = blob.find("a_idx").unwrap();
        assert_eq!(idx.dtype, DType::Int);
        assert_eq!(idx.as_i32(), vec![1, 0]);
        assert!(blob.find("missing").is_none());
    }

    #[test]
    fn test_empty_array_has_no_payload_block() {
        let bytes = blob_of(&[NamedArray::float("empty", vec![])]);
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE);
        let blob = WeightBlob::parse(&bytes).unwrap();
        assert_eq!(blob.find("empty").unwrap().size, 0);
    }

    #[test]
    fn test_name_too_long() {
        let mut w = BlobWriter::new(Vec::new());
        let name = "x".repeat(NAME_FIELD_SIZE);
        let err = w
            .write_array(&NamedArray::int(name, vec![]), ArrayOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::NameTooLong { len: 44, max: 43, .. }));
        // 43 bytes still fits with its terminator
        let ok = "y".repeat(NAME_FIELD_SIZE - 1);
        w.write_array(&NamedArray::int(ok, vec![1]), ArrayOptions::default())
            .unwrap();
    }

    #[test]
    fn test_size_field_overflow() {
        let fits = i32::MAX as usize - RECORD_ALIGN + 1;
        assert!(record_header("w", DType::Int8, fits, 0).is_ok());

        let err = record_header("w", DType::Int8, i32::MAX as usize + 1, 128).unwrap_err();
        assert!(matches!(err, Error::InvalidBlob { offset: 128, .. }));
        // payload fits but its padded block does not
        let err = record_header("w", DType::Int8, i32::MAX as usize - 1, 0).unwrap_err();
        assert_eq!(err.category(), "invalid_blob");
    }

    #[test]
    fn test_check_array_follows_conditions() {
        let w = BlobWriter::new(Vec::new());
        let long = NamedArray::int8("z".repeat(NAME_FIELD_SIZE), vec![1]);
        assert!(w.check_array(&long, ArrayOptions::default()).is_err());
        // never written without DOT_PROD, so never checked
        assert!(w
            .check_array(&long, ArrayOptions::when(Condition::ifdef("DOT_PROD")))
            .is_ok());
    }

    #[test]
    fn test_conditions() {
        let a = NamedArray::int8("dp", vec![1]);
        let b = NamedArray::float("dp", vec![1.0]);

        let mut w = BlobWriter::new(Vec::new()).with_defines(["DOT_PROD"]);
        w.write_array(&a, ArrayOptions::when(Condition::ifdef("DOT_PROD"))).unwrap();
        w.write_array(&b, ArrayOptions::when(Condition::ifndef("DOT_PROD"))).unwrap();
        assert_eq!(w.records(), 1);
        let bytes = w.finish().unwrap();
        assert_eq!(WeightBlob::parse(&bytes).unwrap().find("dp").unwrap().dtype, DType::Int8);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut bytes = blob_of(&[NamedArray::int8("w", vec![1])]);
        assert!(matches!(
            WeightBlob::parse(&bytes[..100]),
            Err(Error::InvalidBlob { offset: 64, .. })
        ));
        bytes[0] = b'X';
        assert!(matches!(
            WeightBlob::parse(&bytes),
            Err(Error::InvalidBlob { offset: 0, .. })
        ));
        assert!(WeightBlob::parse(&[0u8; 10]).is_err());
        assert!(WeightBlob::parse(&[]).unwrap().is_empty());
    }
}
