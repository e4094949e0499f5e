use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::EntityType;

/// One mutex per (entity_id, entity_type) so concurrent inbound messages,
/// binds, and recovery sweeps for the same entity never interleave, while
/// unrelated entities proceed independently.
#[derive(Default)]
pub struct EntityLockTable {
    table: Mutex<HashMap<(i64, EntityType), Arc<Mutex<()>>>>,
}

impl EntityLockTable {
    pub fn new() -> Self {
        Self { table: Mutex::new(HashMap::new()) }
    }

    pub async fn lock(&self, entity_id: i64, entity_type: EntityType) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.table.lock().await;
            table.entry((entity_id, entity_type)).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn distinct_entities_do_not_block_each_other() {
        let table = EntityLockTable::new();
        let g1 = table.lock(1, EntityType::User).await;
        let g2 = table.lock(2, EntityType::User).await;
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn same_entity_reuses_same_mutex() {
        let table = EntityLockTable::new();
        {
            let _g = table.lock(1, EntityType::User).await;
        }
        let _g2 = table.lock(1, EntityType::User).await;
    }
}
