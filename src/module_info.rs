//! Module descriptors and the registry that publishes them
//!
//! A descriptor names a runtime component, gives it a version-4 UUID and a
//! small JSON semantic profile such as `{"type":"runtime","sub":"svm"}`.

use crate::diagnostics::RuntimeError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 63;
pub const MAX_PROFILE_LEN: usize = 127;

/// UUID the runtime registers itself under
const CRATE_UUID: &str = "6f1c2d4e-8a3b-4c5d-9e7f-0a1b2c3d4e5f";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub module_name: String,
    pub uuid: String,
    pub semantic_profile: serde_json::Value,
    #[serde(default)]
    pub supports_blockchain: bool,
}

impl ModuleDescriptor {
    pub fn new(
        module_name: impl Into<String>,
        uuid: impl Into<String>,
        semantic_profile: serde_json::Value,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            uuid: uuid.into(),
            semantic_profile,
            supports_blockchain: false,
        }
    }

    /// Descriptor for this crate's dispatch runtime
    pub fn for_crate() -> Self {
        Self::new(
            "tiercl",
            CRATE_UUID,
            serde_json::json!({ "type": "runtime", "sub": "svm" }),
        )
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        let invalid = |reason: String| RuntimeError::InvalidModule {
            name: self.module_name.clone(),
            reason,
        };

        if self.module_name.is_empty() {
            return Err(invalid("module name is empty".to_string()));
        }
        if self.module_name.len() > MAX_NAME_LEN {
            return Err(invalid(format!("module name exceeds {MAX_NAME_LEN} bytes")));
        }
        if !is_uuid_v4(&self.uuid) {
            return Err(invalid(format!("`{}` is not a version-4 UUID", self.uuid)));
        }
        if !self.semantic_profile.is_object() {
            return Err(invalid("semantic profile must be a JSON object".to_string()));
        }
        let profile_len = self.semantic_profile.to_string().len();
        if profile_len > MAX_PROFILE_LEN {
            return Err(invalid(format!(
                "semantic profile is {profile_len} bytes, limit is {MAX_PROFILE_LEN}"
            )));
        }
        Ok(())
    }
}

/// Hyphenated 8-4-4-4-12 hex form with version nibble 4 and RFC 4122 variant
fn is_uuid_v4(text: &str) -> bool {
    let bytes = text.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    let layout_ok = bytes.iter().enumerate().all(|(i, &b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    });
    layout_ok && bytes[14] == b'4' && matches!(bytes[19].to_ascii_lowercase(), b'8' | b'9' | b'a' | b'b')
}

/// Registered modules in registration order
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: IndexMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only [`ModuleDescriptor::for_crate`]
    pub fn with_crate() -> Self {
        let descriptor = ModuleDescriptor::for_crate();
        let mut modules = IndexMap::new();
        modules.insert(descriptor.module_name.clone(), descriptor);
        Self { modules }
    }

    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), RuntimeError> {
        descriptor.validate()?;
        if self.modules.contains_key(&descriptor.module_name) {
            return Err(RuntimeError::DuplicateModule {
                name: descriptor.module_name,
            });
        }
        tracing::debug!("Registered module `{}` ({})", descriptor.module_name, descriptor.uuid);
        self.modules.insert(descriptor.module_name.clone(), descriptor);
        Ok(())
    }

    pub fn query(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.values()
    }

    /// JSON array of every descriptor
    pub fn to_json(&self) -> Result<String, RuntimeError> {
        let descriptors: Vec<&ModuleDescriptor> = self.modules.values().collect();
        serde_json::to_string_pretty(&descriptors).map_err(|e| RuntimeError::Serialization {
            what: "module registry",
            reason: e.to_string(),
        })
    }
}
