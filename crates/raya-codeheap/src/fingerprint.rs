//! Structural class fingerprints
//!
//! A fingerprint summarizes everything compiled code may have baked in
//! about a class: its name, supertypes, field layout and method set. The
//! AOT compiler records it per class; at link time the engine recomputes
//! it from the live class and the two must be equal.

use sha2::{Digest, Sha256};

/// One declared field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldShape {
    /// Field name
    pub name: String,
    /// Type descriptor
    pub descriptor: String,
    /// Static fields do not affect instance layout but still participate
    pub is_static: bool,
}

impl FieldShape {
    /// An instance field
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self { name: name.to_string(), descriptor: descriptor.to_string(), is_static: false }
    }

    /// A static field
    pub fn new_static(name: &str, descriptor: &str) -> Self {
        Self { is_static: true, ..Self::new(name, descriptor) }
    }
}

/// Declared shape of a class
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassShape {
    /// Binary class name
    pub name: String,
    /// Binary name of the superclass
    pub super_name: Option<String>,
    /// Implemented interfaces in declaration order
    pub interfaces: Vec<String>,
    /// Fields in declaration order
    pub fields: Vec<FieldShape>,
    /// `(name, signature)` of each declared method
    pub methods: Vec<(String, String)>,
}

impl ClassShape {
    /// A class with no supertypes, fields or methods
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    /// Set the superclass
    pub fn with_super(mut self, name: &str) -> Self {
        self.super_name = Some(name.to_string());
        self
    }

    /// Add an interface
    pub fn with_interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    /// Add a field
    pub fn with_field(mut self, field: FieldShape) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a method
    pub fn with_method(mut self, name: &str, signature: &str) -> Self {
        self.methods.push((name.to_string(), signature.to_string()));
        self
    }

    /// First 8 bytes (little-endian) of SHA-256 over the canonical encoding
    pub fn fingerprint(&self) -> u64 {
        let digest = Sha256::digest(self.canonical_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Canonical encoding: every string length-prefixed, every list
    /// count-prefixed, in declaration order.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.name);
        match &self.super_name {
            Some(name) => {
                out.push(1);
                put_str(&mut out, name);
            }
            None => out.push(0),
        }

        out.extend_from_slice(&(self.interfaces.len() as u32).to_le_bytes());
        for interface in &self.interfaces {
            put_str(&mut out, interface);
        }

        out.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for field in &self.fields {
            put_str(&mut out, &field.name);
            put_str(&mut out, &field.descriptor);
            out.push(field.is_static as u8);
        }

        out.extend_from_slice(&(self.methods.len() as u32).to_le_bytes());
        for (name, signature) in &self.methods {
            put_str(&mut out, name);
            put_str(&mut out, signature);
        }
        out
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}
