//! Typed field values carried inside a message

use std::fmt;

/// Wire type tag of a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    I32,
    U32,
    I64,
    U64,
    F64,
    Text,
    Blob,
    /// Homogeneous array of the given scalar type
    Array(ScalarType),
}

/// The scalar subset of [`FieldType`], used as array element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScalarType {
    I32 = 0x01,
    U32 = 0x02,
    I64 = 0x03,
    U64 = 0x04,
    F64 = 0x05,
    Text = 0x06,
    Blob = 0x07,
}

/// Bit set on the tag of array fields
pub const ARRAY_TAG_FLAG: u8 = 0x80;

impl ScalarType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(ScalarType::I32),
            0x02 => Some(ScalarType::U32),
            0x03 => Some(ScalarType::I64),
            0x04 => Some(ScalarType::U64),
            0x05 => Some(ScalarType::F64),
            0x06 => Some(ScalarType::Text),
            0x07 => Some(ScalarType::Blob),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl FieldType {
    /// Get the wire tag for this type
    pub fn tag(self) -> u8 {
        match self {
            FieldType::I32 => ScalarType::I32.tag(),
            FieldType::U32 => ScalarType::U32.tag(),
            FieldType::I64 => ScalarType::I64.tag(),
            FieldType::U64 => ScalarType::U64.tag(),
            FieldType::F64 => ScalarType::F64.tag(),
            FieldType::Text => ScalarType::Text.tag(),
            FieldType::Blob => ScalarType::Blob.tag(),
            FieldType::Array(elem) => ARRAY_TAG_FLAG | elem.tag(),
        }
    }

    /// Parse a wire tag, returning None for unknown tags
    pub fn from_tag(tag: u8) -> Option<Self> {
        if tag & ARRAY_TAG_FLAG != 0 {
            return ScalarType::from_tag(tag & !ARRAY_TAG_FLAG).map(FieldType::Array);
        }
        ScalarType::from_tag(tag).map(|scalar| match scalar {
            ScalarType::I32 => FieldType::I32,
            ScalarType::U32 => FieldType::U32,
            ScalarType::I64 => FieldType::I64,
            ScalarType::U64 => FieldType::U64,
            ScalarType::F64 => FieldType::F64,
            ScalarType::Text => FieldType::Text,
            ScalarType::Blob => FieldType::Blob,
        })
    }

    pub fn is_array(self) -> bool {
        matches!(self, FieldType::Array(_))
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::I32 => "i32",
            ScalarType::U32 => "u32",
            ScalarType::I64 => "i64",
            ScalarType::U64 => "u64",
            ScalarType::F64 => "f64",
            ScalarType::Text => "text",
            ScalarType::Blob => "blob",
        };
        f.write_str(name)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::I32 => f.write_str("i32"),
            FieldType::U32 => f.write_str("u32"),
            FieldType::I64 => f.write_str("i64"),
            FieldType::U64 => f.write_str("u64"),
            FieldType::F64 => f.write_str("f64"),
            FieldType::Text => f.write_str("text"),
            FieldType::Blob => f.write_str("blob"),
            FieldType::Array(elem) => write!(f, "[{}]", elem),
        }
    }
}

/// Homogeneous array of scalar values
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F64(Vec<f64>),
    Text(Vec<String>),
    Blob(Vec<Vec<u8>>),
}

impl ArrayValue {
    /// Element type of this array
    pub fn element_type(&self) -> ScalarType {
        match self {
            ArrayValue::I32(_) => ScalarType::I32,
            ArrayValue::U32(_) => ScalarType::U32,
            ArrayValue::I64(_) => ScalarType::I64,
            ArrayValue::U64(_) => ScalarType::U64,
            ArrayValue::F64(_) => ScalarType::F64,
            ArrayValue::Text(_) => ScalarType::Text,
            ArrayValue::Blob(_) => ScalarType::Blob,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::I32(v) => v.len(),
            ArrayValue::U32(v) => v.len(),
            ArrayValue::I64(v) => v.len(),
            ArrayValue::U64(v) => v.len(),
            ArrayValue::F64(v) => v.len(),
            ArrayValue::Text(v) => v.len(),
            ArrayValue::Blob(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single field value: a scalar or a homogeneous array
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(ArrayValue),
}

impl FieldValue {
    /// Get the type of this value
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::I32(_) => FieldType::I32,
            FieldValue::U32(_) => FieldType::U32,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::U64(_) => FieldType::U64,
            FieldValue::F64(_) => FieldType::F64,
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Blob(_) => FieldType::Blob,
            FieldValue::Array(arr) => FieldType::Array(arr.element_type()),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldValue::Array(_))
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I32(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::U32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Blob(v)
    }
}

impl From<ArrayValue> for FieldValue {
    fn from(v: ArrayValue) -> Self {
        FieldValue::Array(v)
    }
}
