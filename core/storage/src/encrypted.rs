//! Transparent field encryption over the local store.
//!
//! Writes seal the entity's sensitive fields and mark the row encrypted;
//! reads open sealed rows and pass legacy plaintext rows through.

use serde_json::Value;
use std::sync::Arc;

use jobsync_common::{EntityType, Record, Result};
use jobsync_crypto::{decrypt_entity_fields, encrypt_entity_fields, FieldCipher};

use crate::store::{EntityTable, LocalStore, StoredRecord};

/// Local store whose entity access goes through a [`FieldCipher`].
#[derive(Clone)]
pub struct EncryptedStore {
    store: Arc<LocalStore>,
    cipher: Arc<FieldCipher>,
}

impl EncryptedStore {
    pub fn new(store: Arc<LocalStore>, cipher: Arc<FieldCipher>) -> Self {
        Self { store, cipher }
    }

    /// The underlying store (queue and metadata access).
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn cipher(&self) -> &Arc<FieldCipher> {
        &self.cipher
    }

    pub fn table(&self, entity: EntityType) -> EncryptedTable<'_> {
        EncryptedTable {
            inner: self.store.entities(entity),
            cipher: &self.cipher,
            entity,
        }
    }
}

/// One entity collection with encryption applied.
pub struct EncryptedTable<'a> {
    inner: EntityTable<'a>,
    cipher: &'a FieldCipher,
    entity: EntityType,
}

impl EncryptedTable<'_> {
    fn seal(&self, record: &Record) -> Result<StoredRecord> {
        // Fail loudly before sealing: a missing key would otherwise null the fields.
        self.cipher.ensure_key()?;
        Ok(StoredRecord {
            data: encrypt_entity_fields(self.cipher, self.entity, record),
            encrypted: true,
        })
    }

    fn open(&self, row: StoredRecord) -> Record {
        if row.encrypted {
            decrypt_entity_fields(self.cipher, self.entity, &row.data)
        } else {
            row.data
        }
    }

    pub fn add(&self, record: &Record) -> Result<()> {
        self.inner.add(&self.seal(record)?)
    }

    pub fn put(&self, record: &Record) -> Result<()> {
        self.inner.put(&self.seal(record)?)
    }

    pub fn bulk_put(&self, records: &[Record]) -> Result<usize> {
        let sealed = records
            .iter()
            .map(|r| self.seal(r))
            .collect::<Result<Vec<_>>>()?;
        self.inner.bulk_put(&sealed)
    }

    pub fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.inner.get(id)?.map(|row| self.open(row)))
    }

    pub fn to_vec(&self) -> Result<Vec<Record>> {
        Ok(self
            .inner
            .to_vec()?
            .into_iter()
            .map(|row| self.open(row))
            .collect())
    }

    /// Indexed lookup. Sensitive fields are never indexed, so the
    /// comparison runs against plaintext columns.
    pub fn where_equals(&self, field: &str, value: &Value) -> Result<Vec<Record>> {
        Ok(self
            .inner
            .where_equals(field, value)?
            .into_iter()
            .map(|row| self.open(row))
            .collect())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }

    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    pub fn count(&self) -> Result<u64> {
        self.inner.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsync_crypto::MemoryKeyStore;
    use serde_json::json;

    fn setup() -> EncryptedStore {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        let cipher = Arc::new(FieldCipher::new(Arc::new(MemoryKeyStore::new())));
        EncryptedStore::new(store, cipher)
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_client_sealed_at_rest() {
        let enc = setup();
        let client = record(json!({
            "id": "c1",
            "owner_id": "u1",
            "name": "Jane Smith",
            "email": "jane@example.com",
            "notes": "gate code 1234"
        }));
        enc.table(EntityType::Client).put(&client).unwrap();

        let raw = enc.store().entities(EntityType::Client).get("c1").unwrap().unwrap();
        assert!(raw.encrypted);
        assert_ne!(raw.data["name"], json!("Jane Smith"));
        assert_ne!(raw.data["email"], json!("jane@example.com"));
        assert_eq!(raw.data["notes"], json!("gate code 1234"));

        let opened = enc.table(EntityType::Client).get("c1").unwrap().unwrap();
        assert_eq!(opened, client);
    }

    #[test]
    fn test_non_string_client_fields_roundtrip() {
        let enc = setup();
        let client = record(json!({
            "id": "c2",
            "owner_id": "u1",
            "name": "Jane Smith",
            "address": {"street": "1 Main", "city": "X"},
            "phone": 5551234
        }));
        enc.table(EntityType::Client).put(&client).unwrap();

        let raw = enc.store().entities(EntityType::Client).get("c2").unwrap().unwrap();
        assert!(raw.data["address"].is_string());
        assert!(raw.data["phone"].is_string());

        let opened = enc.table(EntityType::Client).get("c2").unwrap().unwrap();
        assert_eq!(opened, client);
    }

    #[test]
    fn test_invoice_amounts_restored_as_numbers() {
        let enc = setup();
        let invoice = record(json!({
            "id": "i1",
            "owner_id": "u1",
            "subtotal": 100,
            "tax_amount": 12.5,
            "total": 112.5
        }));
        enc.table(EntityType::Invoice).put(&invoice).unwrap();

        let raw = enc.store().entities(EntityType::Invoice).get("i1").unwrap().unwrap();
        assert!(raw.data["total"].is_string());

        let opened = enc.table(EntityType::Invoice).get("i1").unwrap().unwrap();
        assert_eq!(opened["subtotal"], json!(100));
        assert_eq!(opened["total"], json!(112.5));
    }

    #[test]
    fn test_legacy_plaintext_rows_pass_through() {
        let enc = setup();
        let legacy = record(json!({"id": "q1", "owner_id": "u1", "total": 50}));
        enc.store()
            .entities(EntityType::Quote)
            .put(&StoredRecord::plain(legacy.clone()))
            .unwrap();

        assert_eq!(enc.table(EntityType::Quote).get("q1").unwrap().unwrap(), legacy);
    }

    #[test]
    fn test_bulk_put_and_lookup() {
        let enc = setup();
        let clients = enc.table(EntityType::Client);
        clients
            .bulk_put(&[
                record(json!({"id": "c1", "owner_id": "u1", "name": "A"})),
                record(json!({"id": "c2", "owner_id": "u2", "name": "B"})),
            ])
            .unwrap();

        let owned = clients.where_equals("owner_id", &json!("u1")).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0]["name"], json!("A"));
        assert_eq!(clients.to_vec().unwrap().len(), 2);

        assert!(clients.delete("c2").unwrap());
        assert_eq!(clients.count().unwrap(), 1);
        clients.clear().unwrap();
        assert_eq!(clients.count().unwrap(), 0);
    }
}
