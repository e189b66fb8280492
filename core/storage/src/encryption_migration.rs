//! One-time re-encryption of rows written before field encryption existed.

use std::collections::BTreeMap;
use tracing::{info, warn};

use jobsync_common::{now_timestamp, EntityType, Result};
use jobsync_crypto::sensitive_fields;

use crate::encrypted::EncryptedStore;
use crate::store::META_ENCRYPTION_MIGRATED;

/// Outcome of [`migrate_to_encrypted`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionMigrationReport {
    /// The migration had already completed on an earlier run.
    pub skipped: bool,
    /// Rows re-encrypted per entity kind.
    pub migrated: BTreeMap<EntityType, usize>,
}

impl EncryptionMigrationReport {
    pub fn total(&self) -> usize {
        self.migrated.values().sum()
    }
}

/// Seal every plaintext row of the entities that carry sensitive fields.
///
/// Idempotent: completion is recorded in metadata and later calls return
/// immediately. Any failure aborts before completion is recorded, so the
/// next call retries; rows already sealed stay sealed.
pub fn migrate_to_encrypted(store: &EncryptedStore) -> Result<EncryptionMigrationReport> {
    let local = store.store();
    if local.get_metadata(META_ENCRYPTION_MIGRATED)?.is_some() {
        return Ok(EncryptionMigrationReport {
            skipped: true,
            ..Default::default()
        });
    }

    let mut report = EncryptionMigrationReport::default();
    for entity in EntityType::ALL {
        if sensitive_fields(entity).is_empty() {
            continue;
        }

        let plaintext: Vec<_> = local
            .entities(entity)
            .to_vec()?
            .into_iter()
            .filter(|row| !row.encrypted)
            .map(|row| row.data)
            .collect();

        let count = match store.table(entity).bulk_put(&plaintext) {
            Ok(count) => count,
            Err(e) => {
                warn!("Encryption migration failed on {}: {}", entity.table_name(), e);
                return Err(e);
            }
        };
        if count > 0 {
            info!("Encrypted {} legacy {} rows", count, entity.table_name());
        }
        report.migrated.insert(entity, count);
    }

    local.set_metadata(META_ENCRYPTION_MIGRATED, &now_timestamp())?;
    info!("Encryption migration complete ({} rows)", report.total());
    Ok(report)
}
