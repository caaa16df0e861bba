//! Optional eager validation of a message against its instruction's field layout
//!
//! Field access on a [`Message`] is already checked lazily; a schema lets a
//! dispatcher reject a message before its handler ever runs.

use super::{FieldType, Message, MessageError, MessageResult};

#[derive(Debug, Clone, PartialEq)]
struct FieldSpec {
    name: String,
    ty: FieldType,
    required: bool,
}

/// Expected fields of one instruction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field that must be present with the given type
    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    /// Declare a field that may be absent, but must have the given type when set
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    /// Check every declared field. Undeclared fields are allowed.
    pub fn validate(&self, message: &Message) -> MessageResult<()> {
        for field in &self.fields {
            match message.get(&field.name) {
                None if field.required => return Err(MessageError::Missing(field.name.clone())),
                None => {}
                Some(value) if value.field_type() != field.ty => {
                    return Err(MessageError::TypeMismatch {
                        name: field.name.clone(),
                        expected: field.ty,
                        found: value.field_type(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ArrayValue, ScalarType};

    fn login_schema() -> Schema {
        Schema::new()
            .required("user", FieldType::Text)
            .required("password", FieldType::Text)
            .optional("roles", FieldType::Array(ScalarType::Text))
    }

    #[test]
    fn test_valid_message() {
        let msg = Message::new(0x05)
            .with("user", "alice")
            .with("password", "secret")
            .with("extra", 1u32);
        assert!(login_schema().validate(&msg).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let msg = Message::new(0x05).with("user", "alice");
        assert_eq!(
            login_schema().validate(&msg),
            Err(MessageError::Missing("password".to_string()))
        );
    }

    #[test]
    fn test_wrong_optional_type() {
        let msg = Message::new(0x05)
            .with("user", "alice")
            .with("password", "secret")
            .with("roles", ArrayValue::U32(vec![1]));
        assert!(matches!(
            login_schema().validate(&msg),
            Err(MessageError::TypeMismatch { .. })
        ));
    }
}
