//! Method ids and their descriptors.

use std::fmt;

use serde_json::Value;

use crate::status::RpcError;

/// Closed set of methods the channel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MethodId {
    Ping = 0,
    Authenticate = 1,
    StorageRead = 2,
    StorageWrite = 3,
    Prefetch = 4,
    Diagnostics = 5,
    Logout = 6,
}

/// Name and expected payload shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: &'static str,
    /// Top-level payload fields that must be present.
    pub required: &'static [&'static str],
}

static DESCRIPTORS: [MethodDescriptor; 7] = [
    MethodDescriptor {
        id: MethodId::Ping,
        name: "ping",
        required: &[],
    },
    MethodDescriptor {
        id: MethodId::Authenticate,
        name: "authenticate",
        required: &["user", "secret"],
    },
    MethodDescriptor {
        id: MethodId::StorageRead,
        name: "storage.read",
        required: &["key"],
    },
    MethodDescriptor {
        id: MethodId::StorageWrite,
        name: "storage.write",
        required: &["key", "value"],
    },
    MethodDescriptor {
        id: MethodId::Prefetch,
        name: "prefetch",
        required: &["keys"],
    },
    MethodDescriptor {
        id: MethodId::Diagnostics,
        name: "diagnostics",
        required: &[],
    },
    MethodDescriptor {
        id: MethodId::Logout,
        name: "logout",
        required: &[],
    },
];

impl MethodId {
    pub const ALL: [MethodId; 7] = [
        Self::Ping,
        Self::Authenticate,
        Self::StorageRead,
        Self::StorageWrite,
        Self::Prefetch,
        Self::Diagnostics,
        Self::Logout,
    ];

    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn descriptor(self) -> &'static MethodDescriptor {
        &DESCRIPTORS[self as usize]
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

impl MethodDescriptor {
    /// Check the payload against the expected shape.
    pub fn validate(&self, payload: &Value) -> Result<(), RpcError> {
        if self.required.is_empty() {
            return Ok(());
        }
        let Some(object) = payload.as_object() else {
            return Err(RpcError::invalid_argument(format!(
                "{}: payload must be an object",
                self.name
            )));
        };
        let missing: Vec<&str> = self
            .required
            .iter()
            .copied()
            .filter(|field| object.get(*field).is_none_or(Value::is_null))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RpcError::invalid_argument(format!(
                "{}: missing required field(s): {}",
                self.name,
                missing.join(", ")
            ))
            .with_details(serde_json::json!({ "missing": missing })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use serde_json::json;

    #[test]
    fn test_descriptor_table_is_indexed_by_id() {
        for id in MethodId::ALL {
            assert_eq!(id.descriptor().id, id);
            assert_eq!(MethodId::from_u16(id.as_u16()), Some(id));
        }
        assert_eq!(MethodId::from_u16(99), None);
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let err = MethodId::StorageWrite
            .descriptor()
            .validate(&json!({"key": "a", "value": null}))
            .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);
        assert!(err.message.contains("value"));
        assert_eq!(err.details, Some(json!({"missing": ["value"]})));
    }

    #[test]
    fn test_validate_accepts_complete_payload() {
        assert!(
            MethodId::StorageRead
                .descriptor()
                .validate(&json!({"key": "a"}))
                .is_ok()
        );
        assert!(MethodId::Ping.descriptor().validate(&Value::Null).is_ok());
        assert!(
            MethodId::StorageRead
                .descriptor()
                .validate(&json!("a"))
                .is_err()
        );
    }
}
