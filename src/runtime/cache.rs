//! runtime/cache.rs — the per-worker tile cache (spec §4.8). Bounded,
//! O(1) get/put LRU keyed by `TileRef`, shared across a worker's in-flight
//! executors so a tile loaded for one block can serve a sibling without a
//! second trip to the tile store. The source system's equivalent cache
//! evicted via a linear `list.remove` scan; this one keeps prev/next
//! pointers in an arena so eviction stays O(1) regardless of size.

use crate::runtime::instruction::{Tile, TileRef};
use std::collections::HashMap;
use std::sync::Arc;

struct Node {
    key: TileRef,
    value: Arc<Tile>,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache {
    capacity: usize,
    map: HashMap<TileRef, usize>,
    nodes: Vec<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Self {
        LruCache {
            capacity,
            map: HashMap::new(),
            nodes: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&mut self, key: &TileRef) -> Option<Arc<Tile>> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.attach_front(idx);
        Some(self.nodes[idx].value.clone())
    }

    pub fn put(&mut self, key: TileRef, value: Tile) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = Arc::new(value);
            self.detach(idx);
            self.attach_front(idx);
            return;
        }
        if self.nodes.len() >= self.capacity {
            if let Some(tail_idx) = self.tail {
                let evicted_key = self.nodes[tail_idx].key.clone();
                self.detach(tail_idx);
                self.map.remove(&evicted_key);
                self.remove_from_arena(tail_idx);
            }
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            value: Arc::new(value),
            prev: None,
            next: None,
        });
        self.map.insert(key, idx);
        self.attach_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].next = self.head;
        if let Some(h) = self.head {
            self.nodes[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Removes a detached node from the arena, patching up the index of
    /// whichever node `swap_remove` relocates into its slot.
    fn remove_from_arena(&mut self, idx: usize) {
        let last = self.nodes.len() - 1;
        self.nodes.swap_remove(idx);
        if idx == last {
            return;
        }
        let moved_key = self.nodes[idx].key.clone();
        self.map.insert(moved_key, idx);
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if let Some(p) = prev {
            self.nodes[p].next = Some(idx);
        }
        if let Some(n) = next {
            self.nodes[n].prev = Some(idx);
        }
        if self.head == Some(last) {
            self.head = Some(idx);
        }
        if self.tail == Some(last) {
            self.tail = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(id: usize) -> TileRef {
        TileRef::new("A", "bucket", vec![id])
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put(tile(0), Tile::zeros(1, 1));
        cache.put(tile(1), Tile::zeros(1, 1));
        assert!(cache.get(&tile(0)).is_some());
        cache.put(tile(2), Tile::zeros(1, 1));
        assert!(cache.get(&tile(1)).is_none(), "tile 1 was least recently used");
        assert!(cache.get(&tile(0)).is_some());
        assert!(cache.get(&tile(2)).is_some());
    }

    #[test]
    fn stays_within_capacity_across_many_inserts() {
        let mut cache = LruCache::new(3);
        for i in 0..50 {
            cache.put(tile(i), Tile::zeros(1, 1));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn put_existing_key_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.put(tile(0), Tile::zeros(1, 1));
        cache.put(tile(1), Tile::zeros(1, 1));
        cache.put(tile(0), Tile::zeros(2, 2));
        cache.put(tile(2), Tile::zeros(1, 1));
        assert!(cache.get(&tile(1)).is_none());
        assert_eq!(cache.get(&tile(0)).unwrap().shape(), (2, 2));
    }

    #[test]
    fn zero_capacity_never_retains() {
        let mut cache = LruCache::new(0);
        cache.put(tile(0), Tile::zeros(1, 1));
        assert!(cache.get(&tile(0)).is_none());
    }
}
