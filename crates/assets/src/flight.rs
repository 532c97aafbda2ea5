use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Coalesces concurrent work on the same key.
///
/// Callers hold a [`FlightGuard`] while fetching; a second caller for the same
/// key waits for the first to finish and should then re-check the cache
/// before doing any work of its own.
pub struct SingleFlight<K> {
    inflight: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &K) -> FlightGuard<'_, K> {
        let lock = {
            let mut map = self.inflight.lock();
            Arc::clone(
                map.entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        FlightGuard {
            group: self,
            key: key.clone(),
            guard,
        }
    }

    /// Keys with a holder or waiters.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

pub struct FlightGuard<'a, K: Eq + Hash + Clone> {
    group: &'a SingleFlight<K>,
    key: K,
    guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        let mut map = self.group.inflight.lock();
        let lock = OwnedMutexGuard::mutex(&self.guard);
        // One reference from the map, one from this guard: nobody is waiting.
        if Arc::strong_count(lock) == 2
            && map.get(&self.key).is_some_and(|l| Arc::ptr_eq(l, lock))
        {
            map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::SingleFlight;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_serialized() {
        let group = Arc::new(SingleFlight::<String>::new());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _g = group.acquire(&"p1".to_string()).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let group = SingleFlight::<&'static str>::new();
        let a = group.acquire(&"a").await;
        let b = group.acquire(&"b").await;
        assert_eq!(group.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(group.in_flight(), 0);
    }
}
