//! Deterministic cache key generation.
//!
//! A key encodes the method name, a canonical encoding of every argument and
//! (outside the hash) the policy version. Arguments that implement
//! [`CacheKeyProvider`] contribute their own part verbatim; everything else
//! is canonicalized through the policy's [`KeySerializer`]. The concatenation
//! is hashed with SHA-256 and base64-encoded, so keys stay short and opaque
//! while equal argument tuples always collide and different tuples virtually
//! never do.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};
use crate::policy::{KeySerializer, RuntimePolicy};

/// Capability for argument types that know their own cache-key contribution.
///
/// Preferred over serialization when present: the contribution is used
/// verbatim, so implementors control stability themselves.
pub trait CacheKeyProvider {
    fn cache_key_part(&self) -> String;
}

/// One canonicalizable argument.
#[derive(Debug, Clone)]
enum KeyPart {
    /// Verbatim contribution from a `CacheKeyProvider`.
    Provided(String),
    /// Structured value, canonicalized at generation time.
    Value(serde_json::Value),
    /// `Display`-rendered textual argument.
    Text(String),
}

/// Ordered argument list for one cache lookup.
///
/// Order is significant: `(a, b)` and `(b, a)` produce different keys.
/// Within a single argument, unordered collections (maps) are canonicalized
/// by the serializer.
#[derive(Debug, Clone, Default)]
pub struct KeyArgs {
    parts: Vec<KeyPart>,
    error: Option<String>,
}

impl KeyArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a serializable argument.
    #[must_use]
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.parts.push(KeyPart::Value(v)),
            Err(e) => self.error = Some(e.to_string()),
        }
        self
    }

    /// Append an argument that provides its own key part.
    #[must_use]
    pub fn provider(mut self, value: &dyn CacheKeyProvider) -> Self {
        self.parts.push(KeyPart::Provided(value.cache_key_part()));
        self
    }

    /// Append a `Display`-rendered argument (the ToString alternative).
    #[must_use]
    pub fn display_arg(mut self, value: &dyn std::fmt::Display) -> Self {
        self.parts.push(KeyPart::Text(value.to_string()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Deterministic key generator.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

/// Separator between hashed segments; cannot occur in method names or JSON.
const SEGMENT_SEPARATOR: u8 = 0x1f;

impl KeyGenerator {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generate the cache key for `(method, args, policy)`.
    ///
    /// The policy's version (when set) is appended outside the hash so keys
    /// for different versions differ verbatim.
    pub fn generate_key(
        &self,
        method: &str,
        args: &KeyArgs,
        policy: &RuntimePolicy,
    ) -> CacheResult<String> {
        if let Some(error) = &args.error {
            return Err(CacheError::Serialize(anyhow::anyhow!(
                "argument not serializable for key generation: {error}"
            )));
        }

        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update([SEGMENT_SEPARATOR]);
        for part in &args.parts {
            match part {
                KeyPart::Provided(s) | KeyPart::Text(s) => hasher.update(s.as_bytes()),
                KeyPart::Value(v) => match policy.serializer {
                    KeySerializer::CanonicalJson => {
                        let mut out = String::new();
                        write_canonical(v, &mut out);
                        hasher.update(out.as_bytes());
                    }
                    KeySerializer::PlainJson => {
                        let text = serde_json::to_string(v)
                            .map_err(|e| CacheError::Serialize(e.into()))?;
                        hasher.update(text.as_bytes());
                    }
                },
            }
            hasher.update([SEGMENT_SEPARATOR]);
        }

        let digest = URL_SAFE_NO_PAD.encode(hasher.finalize());
        let mut key = format!("{}{}:{}", self.prefix, method, digest);
        if let Some(version) = &policy.version {
            key.push_str(":v");
            key.push_str(version);
        }
        Ok(key)
    }
}

/// Write `value` as JSON with recursively sorted object keys. Array order is
/// preserved (ordered sequences are order-significant).
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // keys() came from the map; the lookup cannot fail
                if let Some(v) = map.get(*k) {
                    out.push_str(&serde_json::Value::String((*k).clone()).to_string());
                    out.push(':');
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn generator() -> KeyGenerator {
        KeyGenerator::new("test:")
    }

    #[test]
    fn same_inputs_same_key() {
        let keygen = generator();
        let policy = RuntimePolicy::default();
        let a = keygen
            .generate_key("Users::get", &KeyArgs::new().arg(&42).arg(&"alice"), &policy)
            .unwrap();
        let b = keygen
            .generate_key("Users::get", &KeyArgs::new().arg(&42).arg(&"alice"), &policy)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_args_different_keys() {
        let keygen = generator();
        let policy = RuntimePolicy::default();
        let a = keygen
            .generate_key("Users::get", &KeyArgs::new().arg(&1), &policy)
            .unwrap();
        let b = keygen
            .generate_key("Users::get", &KeyArgs::new().arg(&2), &policy)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn argument_order_matters() {
        let keygen = generator();
        let policy = RuntimePolicy::default();
        let ab = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&"a").arg(&"b"), &policy)
            .unwrap();
        let ba = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&"b").arg(&"a"), &policy)
            .unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn map_insertion_order_is_canonicalized() {
        let keygen = generator();
        let policy = RuntimePolicy::default();

        let mut forward = HashMap::new();
        forward.insert("alpha", 1);
        forward.insert("beta", 2);
        forward.insert("gamma", 3);
        let mut reverse = HashMap::new();
        reverse.insert("gamma", 3);
        reverse.insert("beta", 2);
        reverse.insert("alpha", 1);

        let a = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&forward), &policy)
            .unwrap();
        let b = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&reverse), &policy)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn version_suffix_is_outside_the_hash() {
        let keygen = generator();
        let unversioned = RuntimePolicy::default();
        let versioned = RuntimePolicy::default().version("7");

        let plain = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&1), &unversioned)
            .unwrap();
        let v7 = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&1), &versioned)
            .unwrap();

        assert_ne!(plain, v7);
        assert!(v7.ends_with(":v7"));
        assert!(v7.starts_with(&plain));
    }

    #[test]
    fn provider_contribution_wins_over_serialization() {
        struct Tenant(&'static str);
        impl CacheKeyProvider for Tenant {
            fn cache_key_part(&self) -> String {
                format!("tenant:{}", self.0)
            }
        }

        let keygen = generator();
        let policy = RuntimePolicy::default();
        let a = keygen
            .generate_key("M::m", &KeyArgs::new().provider(&Tenant("x")), &policy)
            .unwrap();
        let b = keygen
            .generate_key("M::m", &KeyArgs::new().provider(&Tenant("y")), &policy)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn plain_json_serializer_is_deterministic() {
        let keygen = generator();
        let policy = RuntimePolicy {
            serializer: crate::policy::KeySerializer::PlainJson,
            ..RuntimePolicy::default()
        };
        let a = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&(1, "x")), &policy)
            .unwrap();
        let b = keygen
            .generate_key("M::m", &KeyArgs::new().arg(&(1, "x")), &policy)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn display_args_use_their_rendering() {
        let keygen = generator();
        let policy = RuntimePolicy::default();
        let a = keygen
            .generate_key("M::m", &KeyArgs::new().display_arg(&7u32), &policy)
            .unwrap();
        let b = keygen
            .generate_key("M::m", &KeyArgs::new().display_arg(&8u32), &policy)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_carries_prefix_and_method() {
        let keygen = KeyGenerator::new("app1:");
        let policy = RuntimePolicy::default();
        let key = keygen
            .generate_key("Orders::list", &KeyArgs::new(), &policy)
            .unwrap();
        assert!(key.starts_with("app1:Orders::list:"));
    }

    #[test]
    fn canonical_writer_sorts_nested_objects() {
        let value = serde_json::json!({"b": {"d": 1, "c": [2, 1]}, "a": true});
        let mut out = String::new();
        write_canonical(&value, &mut out);
        assert_eq!(out, r#"{"a":true,"b":{"c":[2,1],"d":1}}"#);
    }
}
