//! Message definitions
//!
//! A [`Message`] is an instruction code plus an ordered set of named fields.
//! Reading and writing are split into two capability traits,
//! [`ReadMessage`] and [`WriteMessage`], which `Message` implements both of.

use thiserror::Error;

use super::{ArrayValue, FieldType, FieldValue};

/// Field access errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("Field not set: {0}")]
    Missing(String),

    #[error("Field '{name}' has type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: FieldType,
        found: FieldType,
    },

    #[error("Field '{0}' holds an array")]
    UnexpectedArray(String),

    #[error("Field '{0}' is not an array")]
    NotArray(String),
}

pub type MessageResult<T> = Result<T, MessageError>;

fn mismatch(name: &str, expected: FieldType, found: &FieldValue) -> MessageError {
    MessageError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: found.field_type(),
    }
}

/// Read capability over a message
pub trait ReadMessage {
    /// Instruction code identifying the message schema
    fn instruction(&self) -> u8;

    /// Look up a scalar field
    fn read(&self, name: &str) -> MessageResult<&FieldValue>;

    /// Look up an array field
    fn read_arr(&self, name: &str) -> MessageResult<&ArrayValue>;

    fn read_i32(&self, name: &str) -> MessageResult<i32> {
        match self.read(name)? {
            FieldValue::I32(v) => Ok(*v),
            other => Err(mismatch(name, FieldType::I32, other)),
        }
    }

    fn read_u32(&self, name: &str) -> MessageResult<u32> {
        match self.read(name)? {
            FieldValue::U32(v) => Ok(*v),
            other => Err(mismatch(name, FieldType::U32, other)),
        }
    }

    fn read_i64(&self, name: &str) -> MessageResult<i64> {
        match self.read(name)? {
            FieldValue::I64(v) => Ok(*v),
            other => Err(mismatch(name, FieldType::I64, other)),
        }
    }

    fn read_u64(&self, name: &str) -> MessageResult<u64> {
        match self.read(name)? {
            FieldValue::U64(v) => Ok(*v),
            other => Err(mismatch(name, FieldType::U64, other)),
        }
    }

    fn read_f64(&self, name: &str) -> MessageResult<f64> {
        match self.read(name)? {
            FieldValue::F64(v) => Ok(*v),
            other => Err(mismatch(name, FieldType::F64, other)),
        }
    }

    fn read_text(&self, name: &str) -> MessageResult<&str> {
        match self.read(name)? {
            FieldValue::Text(v) => Ok(v.as_str()),
            other => Err(mismatch(name, FieldType::Text, other)),
        }
    }

    fn read_blob(&self, name: &str) -> MessageResult<&[u8]> {
        match self.read(name)? {
            FieldValue::Blob(v) => Ok(v.as_slice()),
            other => Err(mismatch(name, FieldType::Blob, other)),
        }
    }
}

/// Write capability over a message
pub trait WriteMessage {
    /// Set a scalar field, replacing any previous value under the same name
    fn write(&mut self, name: &str, value: FieldValue) -> MessageResult<()>;

    /// Set an array field, replacing any previous value under the same name
    fn write_arr(&mut self, name: &str, value: ArrayValue) -> MessageResult<()>;
}

/// A typed, named-field message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    instruction: u8,
    /// Insertion-ordered fields; names are unique
    fields: Vec<(String, FieldValue)>,
}

impl Message {
    pub fn new(instruction: u8) -> Self {
        Self {
            instruction,
            fields: Vec::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name.into(), value.into());
        self
    }

    /// Insert a field, returning the value it replaced.
    ///
    /// A replaced field keeps its original position.
    pub fn insert(&mut self, name: String, value: FieldValue) -> Option<FieldValue> {
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let index = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate over fields in insertion order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a reply with the same fields under a different instruction code
    pub fn into_reply(self, instruction: u8) -> Self {
        Self {
            instruction,
            fields: self.fields,
        }
    }
}

impl ReadMessage for Message {
    fn instruction(&self) -> u8 {
        self.instruction
    }

    fn read(&self, name: &str) -> MessageResult<&FieldValue> {
        match self.get(name) {
            Some(FieldValue::Array(_)) => Err(MessageError::UnexpectedArray(name.to_string())),
            Some(value) => Ok(value),
            None => Err(MessageError::Missing(name.to_string())),
        }
    }

    fn read_arr(&self, name: &str) -> MessageResult<&ArrayValue> {
        match self.get(name) {
            Some(FieldValue::Array(arr)) => Ok(arr),
            Some(_) => Err(MessageError::NotArray(name.to_string())),
            None => Err(MessageError::Missing(name.to_string())),
        }
    }
}

impl WriteMessage for Message {
    fn write(&mut self, name: &str, value: FieldValue) -> MessageResult<()> {
        if value.is_array() {
            return Err(MessageError::UnexpectedArray(name.to_string()));
        }
        self.insert(name.to_string(), value);
        Ok(())
    }

    fn write_arr(&mut self, name: &str, value: ArrayValue) -> MessageResult<()> {
        self.insert(name.to_string(), FieldValue::Array(value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_written_field() {
        let mut msg = Message::new(0x05);
        msg.write("user", FieldValue::from("alice")).unwrap();

        assert_eq!(msg.read_text("user").unwrap(), "alice");
        assert_eq!(
            msg.read("missing"),
            Err(MessageError::Missing("missing".to_string()))
        );
    }

    #[test]
    fn test_type_mismatch() {
        let msg = Message::new(1).with("count", 3u32);
        let err = msg.read_i64("count").unwrap_err();
        assert_eq!(
            err,
            MessageError::TypeMismatch {
                name: "count".to_string(),
                expected: FieldType::I64,
                found: FieldType::U32,
            }
        );
    }

    #[test]
    fn test_scalar_and_array_split() {
        let mut msg = Message::new(1);
        assert!(msg
            .write("ids", FieldValue::Array(ArrayValue::U32(vec![1, 2])))
            .is_err());
        msg.write_arr("ids", ArrayValue::U32(vec![1, 2])).unwrap();
        msg.write("name", FieldValue::from("x")).unwrap();

        assert_eq!(msg.read_arr("ids").unwrap(), &ArrayValue::U32(vec![1, 2]));
        assert!(matches!(msg.read("ids"), Err(MessageError::UnexpectedArray(_))));
        assert!(matches!(msg.read_arr("name"), Err(MessageError::NotArray(_))));
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut msg = Message::new(1).with("a", 1i32).with("b", 2i32);
        assert_eq!(msg.insert("a".to_string(), FieldValue::I32(10)), Some(FieldValue::I32(1)));

        let names: Vec<_> = msg.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(msg.read_i32("a").unwrap(), 10);
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn test_into_reply() {
        let reply = Message::new(0x03).with("k", "v").into_reply(0x04);
        assert_eq!(reply.instruction(), 0x04);
        assert_eq!(reply.read_text("k").unwrap(), "v");
    }
}
