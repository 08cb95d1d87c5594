//! Output sink abstraction and the named arrays written to it.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use wquant_core::{DType, Result};

/// Values of an emitted array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    Float(Vec<f32>),
    Int8(Vec<i8>),
    Int(Vec<i32>),
    QWeight(Vec<i8>),
}

/// A flat, typed, named array: the unit written to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArray {
    pub name: String,
    pub data: ArrayData,
}

impl NamedArray {
    pub fn float(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            data: ArrayData::Float(values),
        }
    }

    pub fn int8(name: impl Into<String>, values: Vec<i8>) -> Self {
        Self {
            name: name.into(),
            data: ArrayData::Int8(values),
        }
    }

    pub fn int(name: impl Into<String>, values: Vec<i32>) -> Self {
        Self {
            name: name.into(),
            data: ArrayData::Int(values),
        }
    }

    pub fn qweight(name: impl Into<String>, values: Vec<i8>) -> Self {
        Self {
            name: name.into(),
            data: ArrayData::QWeight(values),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            ArrayData::Float(_) => DType::Float,
            ArrayData::Int8(_) => DType::Int8,
            ArrayData::Int(_) => DType::Int,
            ArrayData::QWeight(_) => DType::QWeight,
        }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        match &self.data {
            ArrayData::Float(v) => v.len(),
            ArrayData::Int(v) => v.len(),
            ArrayData::Int8(v) | ArrayData::QWeight(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size()
    }

    /// Little-endian payload, as stored in a weight blob.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        match &self.data {
            ArrayData::Float(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            ArrayData::Int(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            ArrayData::Int8(v) | ArrayData::QWeight(v) => out.extend(v.iter().map(|&x| x as u8)),
        }
        out
    }

    /// C initializer body: comma separated, eight values per line.
    pub fn c_values(&self) -> String {
        let items: Vec<String> = match &self.data {
            ArrayData::Float(v) => v.iter().map(|x| format!("{x:?}")).collect(),
            ArrayData::Int(v) => v.iter().map(|x| x.to_string()).collect(),
            ArrayData::Int8(v) | ArrayData::QWeight(v) => v.iter().map(|x| x.to_string()).collect(),
        };

        let mut out = String::new();
        let last = items.len().saturating_sub(1);
        for (i, item) in items.iter().enumerate() {
            let _ = write!(out, "{item}");
            if i == last {
                break;
            }
            out.push(',');
            out.push_str(if i % 8 == 7 { "\n    " } else { " " });
        }
        out
    }
}

/// Preprocessor condition attached to an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub symbol: &'static str,
    /// `true` for `#ifdef`, `false` for `#ifndef`.
    pub defined: bool,
}

impl Condition {
    pub fn ifdef(symbol: &'static str) -> Self {
        Self {
            symbol,
            defined: true,
        }
    }

    pub fn ifndef(symbol: &'static str) -> Self {
        Self {
            symbol,
            defined: false,
        }
    }
}

/// How an array is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayOptions {
    /// Declare with internal linkage.
    pub is_static: bool,
    /// Float shadow of a quantized array, droppable with `DISABLE_DEBUG_FLOAT`.
    pub debug_float: bool,
    /// Only present when the condition holds.
    pub condition: Option<Condition>,
}

impl Default for ArrayOptions {
    fn default() -> Self {
        Self {
            is_static: true,
            debug_float: false,
            condition: None,
        }
    }
}

impl ArrayOptions {
    pub fn debug_float(debug_float: bool) -> Self {
        Self {
            debug_float,
            ..Self::default()
        }
    }

    pub fn when(condition: Condition) -> Self {
        Self {
            condition: Some(condition),
            ..Self::default()
        }
    }
}

/// Destination of an export session.
///
/// A sink receives every named array plus two append-only text streams: the
/// header (declarations, size constants) and the source (definitions).
/// Binary sinks ignore the text streams.
pub trait WeightSink {
    /// Arrays are referenced by name and loaded from a blob at runtime.
    fn binary_blob(&self) -> bool;

    /// Fail early if `write_array` would reject this array.
    fn check_array(&self, _array: &NamedArray, _options: ArrayOptions) -> Result<()> {
        Ok(())
    }

    /// Emit one array.
    fn write_array(&mut self, array: &NamedArray, options: ArrayOptions) -> Result<()>;

    /// Append to the header stream.
    fn write_header(&mut self, text: &str) -> Result<()>;

    /// Append to the source stream.
    fn write_source(&mut self, text: &str) -> Result<()>;
}
