use std::collections::VecDeque;
use std::hash::Hash;

use dashmap::DashMap;
use parking_lot::Mutex;

/// A capacity-bounded concurrent map used to deduplicate collaborator
/// reads within one validation pass.
///
/// Insertion order doubles as the eviction order. A miss is always a miss;
/// callers fall through to the collaborator and populate on the way back.
pub struct BoundedCache<K: Eq + Hash + Clone, V: Clone> {
    map: DashMap<K, V>,
    order: Mutex<VecDeque<K>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be nonzero");
        BoundedCache {
            map: DashMap::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|v| v.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut order = self.order.lock();
        if self.map.insert(key.clone(), value).is_none() {
            order.push_back(key);
            while order.len() > self.capacity {
                if let Some(oldest) = order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
