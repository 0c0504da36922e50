// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! Common Distributed Application Protocol (CDAP) envelope
//!
//! The daemon only speaks CDAP for the enrollment-authentication objects it
//! exchanges with peers over N-1 flows; everything else on the management
//! plane is handled by the IPCP workers themselves. This module provides the
//! message envelope and the frame codec used on that path.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WireError;

/// CDAP operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdapOpCode {
    /// Create a new object
    MCreate,
    /// Delete an existing object
    MDelete,
    /// Read an object's value
    MRead,
    /// Update an object's value
    MWrite,
    /// Start an operation
    MStart,
    /// Stop an operation
    MStop,
}

impl fmt::Display for CdapOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdapOpCode::MCreate => write!(f, "M_CREATE"),
            CdapOpCode::MDelete => write!(f, "M_DELETE"),
            CdapOpCode::MRead => write!(f, "M_READ"),
            CdapOpCode::MWrite => write!(f, "M_WRITE"),
            CdapOpCode::MStart => write!(f, "M_START"),
            CdapOpCode::MStop => write!(f, "M_STOP"),
        }
    }
}

/// Value carried by a CDAP object.
///
/// Challenge requests travel as plaintext strings; challenge replies carry
/// the ciphertext, which is not guaranteed to be valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdapValue {
    Str(String),
    Bytes(Vec<u8>),
}

impl CdapValue {
    /// Returns the value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CdapValue::Str(s) => Some(s),
            CdapValue::Bytes(_) => None,
        }
    }

    /// Returns the raw bytes of the value regardless of variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CdapValue::Str(s) => s.as_bytes(),
            CdapValue::Bytes(b) => b,
        }
    }
}

/// CDAP message envelope.
///
/// For authentication objects the class carries `challenge request` or
/// `challenge reply` and the name carries the cipher identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdapMessage {
    /// Operation code
    pub op_code: CdapOpCode,
    /// Object class
    pub obj_class: String,
    /// Object name
    pub obj_name: String,
    /// Object value
    pub obj_value: Option<CdapValue>,
    /// Unique invoke ID for request/response matching
    pub invoke_id: u32,
    /// Result code (0 = success, non-zero = error)
    pub result: i32,
    /// Result reason (error message if result != 0)
    pub result_reason: Option<String>,
}

impl CdapMessage {
    /// Creates an `M_WRITE` message for the given object.
    pub fn write(obj_class: &str, obj_name: &str, value: CdapValue) -> Self {
        Self {
            op_code: CdapOpCode::MWrite,
            obj_class: obj_class.to_string(),
            obj_name: obj_name.to_string(),
            obj_value: Some(value),
            invoke_id: 0,
            result: 0,
            result_reason: None,
        }
    }

    /// Serialises the message into a wire frame.
    pub fn to_frame(&self) -> Result<Vec<u8>, WireError> {
        postcard::to_allocvec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Parses a message from a wire frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
        Ok(postcard::from_bytes(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_display() {
        assert_eq!(CdapOpCode::MWrite.to_string(), "M_WRITE");
        assert_eq!(CdapOpCode::MRead.to_string(), "M_READ");
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = CdapMessage::write(
            "challenge request",
            "default_cipher",
            CdapValue::Str("a1b2c3d4".to_string()),
        );

        let frame = msg.to_frame().unwrap();
        let parsed = CdapMessage::from_frame(&frame).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_frame_round_trip_bytes_value() {
        let msg = CdapMessage::write(
            "challenge reply",
            "default_cipher",
            CdapValue::Bytes(vec![0x00, 0xff, 0x13, 0x37]),
        );

        let frame = msg.to_frame().unwrap();
        let parsed = CdapMessage::from_frame(&frame).unwrap();
        assert_eq!(parsed.obj_value.unwrap().as_bytes(), &[0x00, 0xff, 0x13, 0x37]);
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        assert!(CdapMessage::from_frame(&[0xde, 0xad]).is_err());
    }
}
