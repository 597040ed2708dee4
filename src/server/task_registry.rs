//! In-memory task arena with per-slot ready/consumed state.
//!
//! A `DashMap<Key, (Value, Meta)>` shape with an interval-driven
//! background sweep, reused here for TTL expiry instead of flush-on-dirty.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::debug;

use crate::model::{ChunkDescriptor, Shape};

/// Per-chunk state machine: `Pending -> Ready -> Consumed`, terminal at
/// `Consumed`. No other transition is legal.
#[derive(Debug, Clone)]
pub enum ChunkSlot {
    Pending,
    Ready(Vec<u8>),
    Consumed,
}

/// Outcome of `TaskRegistry::take_chunk`.
#[derive(Debug)]
pub enum TakeResult {
    NotFound,
    NotReady,
    AlreadyConsumed,
    Ready(Vec<u8>),
    /// The background parse job failed before this slot ever became
    /// `Ready`. Parser errors raised in the background job are recorded
    /// against the task so that subsequent `take_chunk` calls eventually
    /// surface an error. The task is dropped as part of surfacing this.
    ParseFailed(String),
}

struct TaskData {
    shape: Shape,
    data_length: u64,
    chunk_size: u64,
    chunks: Vec<ChunkDescriptor>,
    slots: Mutex<Vec<ChunkSlot>>,
    created_at: Instant,
    ttl: Duration,
    parse_error: Mutex<Option<String>>,
    remaining: std::sync::atomic::AtomicUsize,
}

/// Holds in-flight tasks and mediates producer/consumer access to chunk
/// payloads with at-most-once delivery.
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskData>>,
}

impl TaskRegistry {
    /// Builds the registry and spawns its background TTL sweep from
    /// inside its own constructor.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            tasks: DashMap::new(),
        });
        let registry_clone = Arc::clone(&registry);
        tokio::spawn(async move {
            registry_clone.background_sweep_task().await;
        });
        registry
    }

    /// Allocates a fresh task with every slot `Pending`.
    pub fn create(
        &self,
        shape: Shape,
        data_length: u64,
        chunk_size: u64,
        chunks: Vec<ChunkDescriptor>,
        ttl: Duration,
    ) -> String {
        let task_id = generate_task_id();
        let slot_count = chunks.len();
        let task = Arc::new(TaskData {
            shape,
            data_length,
            chunk_size,
            chunks,
            slots: Mutex::new(vec![ChunkSlot::Pending; slot_count]),
            created_at: Instant::now(),
            ttl,
            parse_error: Mutex::new(None),
            remaining: std::sync::atomic::AtomicUsize::new(slot_count),
        });
        self.tasks.insert(task_id.clone(), task);
        debug!(task_id, "task created");
        task_id
    }

    pub fn shape_of(&self, task_id: &str) -> Option<Shape> {
        self.tasks.get(task_id).map(|t| t.shape)
    }

    pub fn chunks_of(&self, task_id: &str) -> Option<Vec<ChunkDescriptor>> {
        self.tasks.get(task_id).map(|t| t.chunks.clone())
    }

    pub fn data_length_of(&self, task_id: &str) -> Option<u64> {
        self.tasks.get(task_id).map(|t| t.data_length)
    }

    pub fn chunk_size_of(&self, task_id: &str) -> Option<u64> {
        self.tasks.get(task_id).map(|t| t.chunk_size)
    }

    /// Fills slot `index` with `bytes`, transitioning `Pending -> Ready`.
    /// Safe to call concurrently for distinct indices of the same task.
    pub async fn set_chunk(&self, task_id: &str, index: usize, bytes: Vec<u8>) -> bool {
        let Some(task) = self.tasks.get(task_id).map(|t| Arc::clone(&t)) else {
            return false;
        };
        let mut slots = task.slots.lock().await;
        let Some(slot) = slots.get_mut(index) else {
            return false;
        };
        match slot {
            ChunkSlot::Pending => {
                *slot = ChunkSlot::Ready(bytes);
                true
            }
            _ => false,
        }
    }

    /// Records a background parse failure against the task so in-flight and
    /// future `take_chunk` calls surface it.
    pub async fn fail(&self, task_id: &str, message: String) {
        if let Some(task) = self.tasks.get(task_id) {
            *task.parse_error.lock().await = Some(message);
        }
    }

    /// Atomic read-modify-write: on `Ready`, transitions to `Consumed` and
    /// yields the bytes by move. After the last slot becomes `Consumed`
    /// the task is eagerly destroyed.
    pub async fn take_chunk(&self, task_id: &str, index: usize) -> TakeResult {
        let Some(task) = self.tasks.get(task_id).map(|t| Arc::clone(&t)) else {
            return TakeResult::NotFound;
        };

        if let Some(message) = task.parse_error.lock().await.clone() {
            self.tasks.remove(task_id);
            debug!(task_id, "task dropped: background parse failed");
            return TakeResult::ParseFailed(message);
        }

        let mut slots = task.slots.lock().await;
        let Some(slot) = slots.get_mut(index) else {
            return TakeResult::NotFound;
        };

        let result = match slot {
            ChunkSlot::Pending => TakeResult::NotReady,
            ChunkSlot::Consumed => TakeResult::AlreadyConsumed,
            ChunkSlot::Ready(_) => {
                let ChunkSlot::Ready(bytes) = std::mem::replace(slot, ChunkSlot::Consumed) else {
                    unreachable!()
                };
                TakeResult::Ready(bytes)
            }
        };
        drop(slots);

        if matches!(result, TakeResult::Ready(_)) {
            let remaining = task
                .remaining
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            if remaining <= 1 {
                self.tasks.remove(task_id);
                debug!(task_id, "task fully consumed, dropping");
            }
        }

        result
    }

    /// Removes any task whose TTL has elapsed.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| now.duration_since(entry.created_at) > entry.ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for task_id in expired {
            self.tasks.remove(&task_id);
            debug!(task_id, "task expired via TTL sweep");
        }
    }

    async fn background_sweep_task(&self) {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            self.sweep(Instant::now());
        }
    }
}

fn generate_task_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::chunk_descriptors;

    fn sample_task(registry: &TaskRegistry, ttl: Duration) -> (String, Vec<ChunkDescriptor>) {
        let shape = Shape::new(4, 4, 4);
        let chunks = chunk_descriptors(shape.data_length(), 20);
        let task_id = registry.create(shape, shape.data_length(), 20, chunks.clone(), ttl);
        (task_id, chunks)
    }

    #[tokio::test]
    async fn take_before_set_is_not_ready() {
        let registry = TaskRegistry::new();
        let (task_id, _) = sample_task(&registry, Duration::from_secs(60));
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::NotReady
        ));
    }

    #[tokio::test]
    async fn take_chunk_is_at_most_once() {
        let registry = TaskRegistry::new();
        let (task_id, chunks) = sample_task(&registry, Duration::from_secs(60));
        for chunk in &chunks {
            let bytes = vec![0u8; chunk.byte_len() as usize];
            assert!(registry.set_chunk(&task_id, chunk.index as usize, bytes).await);
        }
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::Ready(_)
        ));
        // Second take on the same index: either AlreadyConsumed, or
        // NotFound if the whole task was reaped because it was the last
        // outstanding slot. With 4 chunks only the 4th take reaps the task.
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::AlreadyConsumed
        ));
    }

    #[tokio::test]
    async fn task_is_dropped_after_last_chunk_consumed() {
        let registry = TaskRegistry::new();
        let shape = Shape::new(2, 1, 1);
        let chunks = chunk_descriptors(shape.data_length(), 2);
        let task_id = registry.create(
            shape,
            shape.data_length(),
            2,
            chunks.clone(),
            Duration::from_secs(60),
        );
        registry
            .set_chunk(&task_id, 0, vec![0u8; chunks[0].byte_len() as usize])
            .await;
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::Ready(_)
        ));
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::NotFound
        ));
    }

    #[tokio::test]
    async fn sweep_removes_expired_tasks() {
        let registry = TaskRegistry::new();
        let (task_id, _) = sample_task(&registry, Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.sweep(Instant::now());
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::NotFound
        ));
    }

    #[tokio::test]
    async fn parse_failure_surfaces_and_drops_task() {
        let registry = TaskRegistry::new();
        let (task_id, _) = sample_task(&registry, Duration::from_secs(60));
        registry.fail(&task_id, "bad header".to_string()).await;
        match registry.take_chunk(&task_id, 0).await {
            TakeResult::ParseFailed(msg) => assert_eq!(msg, "bad header"),
            other => panic!("expected ParseFailed, got {other:?}"),
        }
        assert!(matches!(
            registry.take_chunk(&task_id, 0).await,
            TakeResult::NotFound
        ));
    }

    #[tokio::test]
    async fn concurrent_take_on_same_slot_only_one_wins() {
        let registry = TaskRegistry::new();
        let (task_id, chunks) = sample_task(&registry, Duration::from_secs(60));
        registry
            .set_chunk(&task_id, 0, vec![0u8; chunks[0].byte_len() as usize])
            .await;

        let r1 = Arc::clone(&registry);
        let id1 = task_id.clone();
        let r2 = Arc::clone(&registry);
        let id2 = task_id.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { matches!(r1.take_chunk(&id1, 0).await, TakeResult::Ready(_)) }),
            tokio::spawn(async move { matches!(r2.take_chunk(&id2, 0).await, TakeResult::Ready(_)) }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a ^ b, true, "exactly one caller should observe Ready");
    }
}
