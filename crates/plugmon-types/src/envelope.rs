//! Uniform `{code, msg, data}` response envelope for control requests.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

pub const OK: u16 = 200;
pub const NO_CONTENT: u16 = 204;
pub const BAD_REQUEST: u16 = 400;
pub const NOT_FOUND: u16 = 404;
pub const INTERNAL_ERROR: u16 = 500;

/// Response envelope. A `204` envelope carries no body fields on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub code: u16,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    #[must_use]
    pub fn new(code: u16, msg: Option<String>, data: Option<Value>) -> Self {
        Self { code, msg, data }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::new(OK, None, None)
    }

    #[must_use]
    pub fn ok_msg(msg: impl Into<String>) -> Self {
        Self::new(OK, Some(msg.into()), None)
    }

    #[must_use]
    pub fn ok_with(data: Value) -> Self {
        Self::new(OK, None, Some(data))
    }

    #[must_use]
    pub fn no_content() -> Self {
        Self::new(NO_CONTENT, None, None)
    }

    #[must_use]
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(BAD_REQUEST, Some(msg.into()), None)
    }

    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, Some(msg.into()), None)
    }

    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, Some(msg.into()), None)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.code == NO_CONTENT {
            let mut s = serializer.serialize_struct("Envelope", 1)?;
            s.serialize_field("code", &self.code)?;
            return s.end();
        }
        let mut s = serializer.serialize_struct("Envelope", 3)?;
        s.serialize_field("code", &self.code)?;
        s.serialize_field("msg", &self.msg)?;
        s.serialize_field("data", &self.data)?;
        s.end()
    }
}
