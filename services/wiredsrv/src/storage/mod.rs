//! SQLite persistence of parameter slots and cached configuration blocks
//!
//! A slot row is keyed by `(peer_id, set_kind, channel, parameter_id,
//! remote_peer_id, remote_channel)`; slots without a link partner store
//! `0` / `-1` in the remote columns so the unique key stays total.

use chrono::Utc;
use common::sqlite::SqliteClient;
use sqlx::{sqlite::SqliteRow, Row};
use std::path::Path;
use tracing::{debug, info};

use crate::core::peer::{SlotKey, StoredSlot, WiredPeer};
use crate::core::store::ConfigurationBlock;
use crate::error::{Result, WiredError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS parameter_slots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        peer_id INTEGER NOT NULL,
        set_kind TEXT NOT NULL,
        channel INTEGER NOT NULL,
        parameter_id TEXT NOT NULL,
        remote_peer_id INTEGER NOT NULL DEFAULT 0,
        remote_channel INTEGER NOT NULL DEFAULT -1,
        data BLOB NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (peer_id, set_kind, channel, parameter_id, remote_peer_id, remote_channel)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config_blocks (
        peer_id INTEGER NOT NULL,
        block_address INTEGER NOT NULL,
        data BLOB NOT NULL,
        dirty INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (peer_id, block_address)
    )
    "#,
];

#[derive(Clone)]
pub struct PeerRepository {
    client: SqliteClient,
}

fn remote_columns(remote: Option<(u64, u32)>) -> (i64, i64) {
    match remote {
        Some((id, channel)) => (id as i64, i64::from(channel)),
        None => (0, -1),
    }
}

fn hydrate_slot(row: SqliteRow) -> Result<StoredSlot> {
    let kind: String = row.try_get("set_kind")?;
    let channel: i64 = row.try_get("channel")?;
    let remote_peer_id: i64 = row.try_get("remote_peer_id")?;
    let remote_channel: i64 = row.try_get("remote_channel")?;
    let remote = (remote_channel >= 0).then_some((remote_peer_id as u64, remote_channel as u32));

    Ok(StoredSlot {
        key: SlotKey {
            kind: kind.parse()?,
            channel: u32::try_from(channel)
                .map_err(|_| WiredError::storage(format!("invalid channel {}", channel)))?,
            parameter: row.try_get("parameter_id")?,
            remote,
        },
        data: row.try_get("data")?,
        storage_id: Some(row.try_get("id")?),
    })
}

impl PeerRepository {
    /// Open the database file and create the tables if needed
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let repository = Self {
            client: SqliteClient::new(path).await?,
        };
        repository.init().await?;
        Ok(repository)
    }

    pub async fn in_memory() -> Result<Self> {
        let repository = Self {
            client: SqliteClient::in_memory().await?,
        };
        repository.init().await?;
        Ok(repository)
    }

    async fn init(&self) -> Result<()> {
        self.client.apply_schema(SCHEMA).await?;
        debug!("Peer tables ready in {}", self.client.path());
        Ok(())
    }

    /// Insert or update a slot, returning its row id
    pub async fn save_slot(&self, peer_id: u64, slot: &StoredSlot) -> Result<i64> {
        let (remote_peer_id, remote_channel) = remote_columns(slot.key.remote);
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO parameter_slots
                (peer_id, set_kind, channel, parameter_id, remote_peer_id, remote_channel, data, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (peer_id, set_kind, channel, parameter_id, remote_peer_id, remote_channel)
            DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(peer_id as i64)
        .bind(slot.key.kind.as_str())
        .bind(i64::from(slot.key.channel))
        .bind(&slot.key.parameter)
        .bind(remote_peer_id)
        .bind(remote_channel)
        .bind(&slot.data)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.client.pool())
        .await?;
        Ok(id)
    }

    pub async fn load_slots(&self, peer_id: u64) -> Result<Vec<StoredSlot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, set_kind, channel, parameter_id, remote_peer_id, remote_channel, data
            FROM parameter_slots
            WHERE peer_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(peer_id as i64)
        .fetch_all(self.client.pool())
        .await?;

        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            slots.push(hydrate_slot(row)?);
        }
        Ok(slots)
    }

    /// Insert or update a cached block, returning its row id
    pub async fn save_block(&self, peer_id: u64, block: &ConfigurationBlock) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO config_blocks (peer_id, block_address, data, dirty, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (peer_id, block_address)
            DO UPDATE SET data = excluded.data, dirty = excluded.dirty, updated_at = excluded.updated_at
            RETURNING rowid
            "#,
        )
        .bind(peer_id as i64)
        .bind(i64::from(block.address))
        .bind(&block.data)
        .bind(block.dirty)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(self.client.pool())
        .await?;
        Ok(id)
    }

    pub async fn load_blocks(&self, peer_id: u64) -> Result<Vec<ConfigurationBlock>> {
        let rows = sqlx::query(
            r#"
            SELECT rowid, block_address, data, dirty
            FROM config_blocks
            WHERE peer_id = ?
            ORDER BY block_address ASC
            "#,
        )
        .bind(peer_id as i64)
        .fetch_all(self.client.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ConfigurationBlock> {
                let address: i64 = row.try_get("block_address")?;
                Ok(ConfigurationBlock {
                    address: u32::try_from(address).map_err(|_| {
                        WiredError::storage(format!("invalid block address {}", address))
                    })?,
                    data: row.try_get("data")?,
                    dirty: row.try_get("dirty")?,
                    storage_id: Some(row.try_get("rowid")?),
                })
            })
            .collect()
    }

    /// Forget everything stored for a peer
    pub async fn delete_peer(&self, peer_id: u64) -> Result<u64> {
        let slots = sqlx::query("DELETE FROM parameter_slots WHERE peer_id = ?")
            .bind(peer_id as i64)
            .execute(self.client.pool())
            .await?;
        let blocks = sqlx::query("DELETE FROM config_blocks WHERE peer_id = ?")
            .bind(peer_id as i64)
            .execute(self.client.pool())
            .await?;
        Ok(slots.rows_affected() + blocks.rows_affected())
    }

    /// Restore a freshly bound peer from its stored slots and blocks
    pub async fn restore_peer(&self, peer: &WiredPeer) -> Result<(usize, usize)> {
        let blocks = peer.restore_blocks(self.load_blocks(peer.id).await?).await;
        let slots = peer.restore_slots(self.load_slots(peer.id).await?).await;
        debug!("Peer {}: restored {} blocks and {} slots", peer.id, blocks, slots);
        Ok((blocks, slots))
    }

    /// Write all slots and cached blocks of a peer
    pub async fn save_peer(&self, peer: &WiredPeer) -> Result<()> {
        let slots = peer.snapshot_slots().await;
        for slot in &slots {
            let id = self.save_slot(peer.id, slot).await?;
            if slot.storage_id != Some(id) {
                peer.set_slot_storage_id(&slot.key, id).await;
            }
        }
        let blocks = peer.snapshot_blocks().await;
        for block in &blocks {
            self.save_block(peer.id, block).await?;
        }
        info!(
            "Peer {}: saved {} slots and {} blocks",
            peer.id,
            slots.len(),
            blocks.len()
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use device_model::ParameterSetKind;

    fn slot(kind: ParameterSetKind, channel: u32, id: &str, data: Vec<u8>) -> StoredSlot {
        StoredSlot {
            key: SlotKey::new(kind, channel, id),
            data,
            storage_id: None,
        }
    }

    #[tokio::test]
    async fn test_slot_upsert_keeps_row_id() {
        let repo = PeerRepository::in_memory().await.unwrap();
        let first = repo
            .save_slot(7, &slot(ParameterSetKind::Values, 1, "STATE", vec![0]))
            .await
            .unwrap();
        let second = repo
            .save_slot(7, &slot(ParameterSetKind::Values, 1, "STATE", vec![200]))
            .await
            .unwrap();
        assert_eq!(first, second);

        let loaded = repo.load_slots(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].data, vec![200]);
        assert_eq!(loaded[0].storage_id, Some(first));
        assert_eq!(loaded[0].key, SlotKey::new(ParameterSetKind::Values, 1, "STATE"));
    }

    #[tokio::test]
    async fn test_link_slots_are_distinct_per_partner() {
        let repo = PeerRepository::in_memory().await.unwrap();
        let mut a = slot(ParameterSetKind::Link, 1, "ON_TIME", vec![10]);
        a.key.remote = Some((40, 2));
        let mut b = a.clone();
        b.key.remote = Some((41, 2));
        b.data = vec![20];
        repo.save_slot(7, &a).await.unwrap();
        repo.save_slot(7, &b).await.unwrap();
        repo.save_slot(8, &slot(ParameterSetKind::Master, 0, "DISPLAY_ORDER", vec![3]))
            .await
            .unwrap();

        let loaded = repo.load_slots(7).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].key.remote, Some((40, 2)));
        assert_eq!(loaded[1].data, vec![20]);
    }

    #[tokio::test]
    async fn test_blocks_roundtrip_and_delete() {
        let repo = PeerRepository::in_memory().await.unwrap();
        let block = ConfigurationBlock {
            address: 0x10,
            data: vec![0xAB; 16],
            dirty: true,
            storage_id: None,
        };
        let id = repo.save_block(7, &block).await.unwrap();
        repo.save_slot(7, &slot(ParameterSetKind::Values, 1, "STATE", vec![0]))
            .await
            .unwrap();

        let loaded = repo.load_blocks(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].address, 0x10);
        assert!(loaded[0].dirty);
        assert_eq!(loaded[0].storage_id, Some(id));

        // a later save after the flush clears the pending mark
        let flushed = ConfigurationBlock {
            dirty: false,
            ..loaded[0].clone()
        };
        assert_eq!(repo.save_block(7, &flushed).await.unwrap(), id);
        assert!(!repo.load_blocks(7).await.unwrap()[0].dirty);

        assert_eq!(repo.delete_peer(7).await.unwrap(), 2);
        assert!(repo.load_blocks(7).await.unwrap().is_empty());
        assert!(repo.load_slots(7).await.unwrap().is_empty());
    }
}
