//! runtime/tile_store.rs — the distributed tile-matrix store (spec §4.9,
//! §6). `TileStore::get_tile`/`put_tile` are the only ops Load/Store
//! instructions need; an instruction's `max_read_time`/`max_write_time`
//! bound how long the executor will wait on a single call before treating
//! it as transient I/O failure (spec §4.7).

use crate::runtime::instruction::{Tile, TileRef};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait TileStore: Send + Sync {
    async fn get_tile(&self, tile: &TileRef) -> std::io::Result<Tile>;
    async fn put_tile(&self, tile: &TileRef, data: Tile) -> std::io::Result<()>;
}

#[derive(Default)]
pub struct InMemoryTileStore {
    tiles: RwLock<HashMap<TileRef, Tile>>,
}

impl InMemoryTileStore {
    pub fn new() -> Self {
        InMemoryTileStore {
            tiles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn seed(&self, tile: TileRef, data: Tile) {
        self.tiles.write().await.insert(tile, data);
    }
}

#[async_trait]
impl TileStore for InMemoryTileStore {
    async fn get_tile(&self, tile: &TileRef) -> std::io::Result<Tile> {
        self.tiles.read().await.get(tile).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such tile: {}", tile),
            )
        })
    }

    async fn put_tile(&self, tile: &TileRef, data: Tile) -> std::io::Result<()> {
        self.tiles.write().await.insert(tile.clone(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryTileStore::new();
        let t = TileRef::new("A", "bucket", vec![0, 0]);
        store
            .put_tile(&t, Tile::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]))
            .await
            .unwrap();
        let back = store.get_tile(&t).await.unwrap();
        assert_eq!(back.get(1, 1), 4.0);
    }

    #[tokio::test]
    async fn missing_tile_is_not_found() {
        let store = InMemoryTileStore::new();
        let t = TileRef::new("A", "bucket", vec![9, 9]);
        let err = store.get_tile(&t).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
