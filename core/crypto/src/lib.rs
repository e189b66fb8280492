//! Cryptographic primitives for JobSync.
//!
//! This module provides:
//! - Authenticated encryption using AES-256-GCM
//! - A device-held field key with automatic zeroization
//! - Field-level encryption of sensitive entity attributes
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Failed encryption never falls back to storing plaintext

pub mod aead;
pub mod entity;
pub mod field;
pub mod keys;

pub use aead::{decrypt, encrypt};
pub use entity::{
    decrypt_client_fields, decrypt_entity_fields, decrypt_invoice_fields, decrypt_quote_fields,
    encrypt_client_fields, encrypt_entity_fields, encrypt_invoice_fields, encrypt_quote_fields,
    looks_encrypted, sensitive_fields,
};
pub use field::FieldCipher;
pub use keys::{FieldKey, FileKeyStore, KeyStore, MemoryKeyStore};
