//! 节点事件环：按优先级分环的有界事件存储。
//!
//! 持久化布局：`events/<priority>/ring` 下以事件号为键逐条落盘，挤出
//! 即删除；重启时恢复环内容并续用事件号序列。

use matter_codec_tlv::{Tag, TlvValue};
use matter_core::clock::Clock;
use matter_core::storage::{StorageContext, StorageService};
use matter_core::types::{
    ClusterId, EndpointNumber, EventId, EventNumber, EventPriority, FabricIndex,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// 每个优先级环的默认容量。
pub const DEFAULT_RING_CAPACITY: usize = 128;

/// 一条已落环的事件。
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub number: EventNumber,
    pub priority: EventPriority,
    pub endpoint: EndpointNumber,
    pub cluster: ClusterId,
    pub event_id: EventId,
    /// 墙钟时间戳（UNIX 纪元起）。
    pub epoch_timestamp: Duration,
    /// 单调系统时间戳（进程启动参照）。
    pub system_timestamp: Duration,
    /// fabric-scoped 事件携带归属 fabric。
    pub fabric_index: Option<FabricIndex>,
    pub payload: TlvValue,
}

type EventListener = Box<dyn Fn(&EventRecord) + Send + Sync>;

/// 事件环集合：Debug/Info/Critical 三条有界队列共享一个事件序号。
pub struct EventLog {
    clock: Arc<dyn Clock>,
    origin: std::time::Instant,
    next_number: AtomicU64,
    rings: [Mutex<VecDeque<EventRecord>>; 3],
    capacity: usize,
    storage: Option<Arc<dyn StorageService>>,
    listeners: Mutex<Vec<EventListener>>,
}

impl EventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_capacity(clock, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Arc<Self> {
        let origin = clock.now();
        Arc::new(Self {
            clock,
            origin,
            next_number: AtomicU64::new(1),
            rings: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            capacity,
            storage: None,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// 带持久化后端构造：恢复环内容并续用事件号。
    pub fn with_storage(
        clock: Arc<dyn Clock>,
        capacity: usize,
        storage: Arc<dyn StorageService>,
    ) -> Arc<Self> {
        let origin = clock.now();
        let log = Self {
            clock,
            origin,
            next_number: AtomicU64::new(1),
            rings: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            capacity,
            storage: Some(Arc::clone(&storage)),
            listeners: Mutex::new(Vec::new()),
        };

        let mut max_number = 0u64;
        for priority in [EventPriority::Debug, EventPriority::Info, EventPriority::Critical] {
            let context = Self::ring_context(priority);
            let mut restored: Vec<EventRecord> = storage
                .keys(&context)
                .into_iter()
                .filter_map(|key| {
                    let number = key.parse::<u64>().ok()?;
                    let bytes = storage.get(&context, &key)?;
                    decode_record(EventNumber(number), priority, &bytes)
                })
                .collect();
            restored.sort_by_key(|record| record.number);
            for record in &restored {
                max_number = max_number.max(record.number.raw());
            }
            *log.rings[Self::ring_index(priority)].lock().expect("ring lock") =
                restored.into_iter().collect();
        }
        log.next_number.store(max_number + 1, Ordering::Relaxed);
        Arc::new(log)
    }

    fn ring_context(priority: EventPriority) -> StorageContext {
        StorageContext::new("events").child(priority.as_str()).child("ring")
    }

    fn ring_index(priority: EventPriority) -> usize {
        match priority {
            EventPriority::Debug => 0,
            EventPriority::Info => 1,
            EventPriority::Critical => 2,
        }
    }

    /// 追加一条事件；环满时最老的条目被挤出。
    pub fn append(
        &self,
        priority: EventPriority,
        endpoint: EndpointNumber,
        cluster: ClusterId,
        event_id: EventId,
        fabric_index: Option<FabricIndex>,
        payload: TlvValue,
    ) -> EventNumber {
        let number = EventNumber(self.next_number.fetch_add(1, Ordering::Relaxed));
        let record = EventRecord {
            number,
            priority,
            endpoint,
            cluster,
            event_id,
            epoch_timestamp: self
                .clock
                .wall()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or(Duration::ZERO),
            system_timestamp: self.clock.now().duration_since(self.origin),
            fabric_index,
            payload,
        };

        {
            let mut ring = self.rings[Self::ring_index(priority)]
                .lock()
                .expect("ring lock");
            if ring.len() >= self.capacity {
                if let Some(evicted) = ring.pop_front() {
                    if let Some(storage) = &self.storage {
                        storage.remove(
                            &Self::ring_context(priority),
                            &evicted.number.raw().to_string(),
                        );
                    }
                }
            }
            ring.push_back(record.clone());
        }
        if let Some(storage) = &self.storage {
            storage.set(
                &Self::ring_context(priority),
                &record.number.raw().to_string(),
                encode_record(&record),
            );
        }

        let listeners = self.listeners.lock().expect("listener lock");
        for listener in listeners.iter() {
            listener(&record);
        }
        number
    }

    /// 注册新事件监听器（订阅引擎挂接点）。
    pub fn subscribe(&self, listener: impl Fn(&EventRecord) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listener lock")
            .push(Box::new(listener));
    }

    /// 读取事件号大于 `after` 的事件，按事件号排序。
    ///
    /// `fabric_filter`：fabric-scoped 事件只对归属 fabric 可见；
    /// 非 fabric-scoped 事件不过滤。
    pub fn events_after(
        &self,
        after: EventNumber,
        fabric_filter: Option<FabricIndex>,
    ) -> Vec<EventRecord> {
        let mut out = Vec::new();
        for ring in &self.rings {
            let ring = ring.lock().expect("ring lock");
            for record in ring.iter() {
                if record.number <= after {
                    continue;
                }
                if let (Some(owner), Some(viewer)) = (record.fabric_index, fabric_filter) {
                    if owner != viewer {
                        continue;
                    }
                }
                out.push(record.clone());
            }
        }
        out.sort_by_key(|record| record.number);
        out
    }

    /// 当前最大事件号。
    pub fn last_number(&self) -> EventNumber {
        EventNumber(self.next_number.load(Ordering::Relaxed).saturating_sub(1))
    }
}

fn encode_record(record: &EventRecord) -> Vec<u8> {
    let mut fields = vec![
        (
            Tag::Context(0),
            TlvValue::UnsignedInt(u64::from(record.endpoint.raw())),
        ),
        (
            Tag::Context(1),
            TlvValue::UnsignedInt(u64::from(record.cluster.raw())),
        ),
        (
            Tag::Context(2),
            TlvValue::UnsignedInt(u64::from(record.event_id.raw())),
        ),
        (
            Tag::Context(3),
            TlvValue::UnsignedInt(record.epoch_timestamp.as_millis() as u64),
        ),
        (
            Tag::Context(4),
            TlvValue::UnsignedInt(record.system_timestamp.as_millis() as u64),
        ),
        (Tag::Context(6), record.payload.clone()),
    ];
    if let Some(fabric) = record.fabric_index {
        fields.push((
            Tag::Context(5),
            TlvValue::UnsignedInt(u64::from(fabric.raw())),
        ));
    }
    matter_codec_tlv::encode(&TlvValue::Structure(fields))
}

fn decode_record(number: EventNumber, priority: EventPriority, bytes: &[u8]) -> Option<EventRecord> {
    let value = matter_codec_tlv::decode(bytes).ok()?;
    Some(EventRecord {
        number,
        priority,
        endpoint: EndpointNumber(value.field(0)?.as_u64()? as u16),
        cluster: ClusterId(value.field(1)?.as_u64()? as u32),
        event_id: EventId(value.field(2)?.as_u64()? as u32),
        epoch_timestamp: Duration::from_millis(value.field(3)?.as_u64()?),
        system_timestamp: Duration::from_millis(value.field(4)?.as_u64()?),
        fabric_index: value
            .field(5)
            .and_then(|v| v.as_u64())
            .map(|raw| FabricIndex(raw as u8)),
        payload: value.field(6).cloned().unwrap_or(TlvValue::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::MockClock;
    use matter_core::storage::MemoryStorage;

    fn log() -> Arc<EventLog> {
        EventLog::with_capacity(Arc::new(MockClock::new()), 3)
    }

    #[test]
    fn persisted_ring_survives_reload_and_resumes_numbering() {
        let storage: Arc<dyn StorageService> = Arc::new(MemoryStorage::default());
        let first = EventLog::with_storage(Arc::new(MockClock::new()), 4, Arc::clone(&storage));
        first.append(
            EventPriority::Critical,
            EndpointNumber(0),
            ClusterId(0x28),
            EventId(0),
            None,
            TlvValue::UnsignedInt(7),
        );

        let reloaded = EventLog::with_storage(Arc::new(MockClock::new()), 4, storage);
        let restored = reloaded.events_after(EventNumber(0), None);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].payload, TlvValue::UnsignedInt(7));
        let next = reloaded.append(
            EventPriority::Info,
            EndpointNumber(0),
            ClusterId(0x28),
            EventId(1),
            None,
            TlvValue::Null,
        );
        assert!(next > restored[0].number, "numbering resumes after reload");
    }

    #[test]
    fn numbers_are_monotonic_across_priorities() {
        let log = log();
        let a = log.append(
            EventPriority::Info,
            EndpointNumber(1),
            ClusterId(6),
            EventId(0),
            None,
            TlvValue::Null,
        );
        let b = log.append(
            EventPriority::Critical,
            EndpointNumber(1),
            ClusterId(6),
            EventId(1),
            None,
            TlvValue::Null,
        );
        assert!(b > a);
        assert_eq!(log.last_number(), b);
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let log = log();
        for i in 0..5u64 {
            log.append(
                EventPriority::Debug,
                EndpointNumber(0),
                ClusterId(0x28),
                EventId(i as u32),
                None,
                TlvValue::UnsignedInt(i),
            );
        }
        let survivors = log.events_after(EventNumber(0), None);
        assert_eq!(survivors.len(), 3, "capacity 3 keeps the newest three");
        assert_eq!(survivors[0].number, EventNumber(3));
    }

    #[test]
    fn fabric_scoped_events_filtered_by_viewer() {
        let log = log();
        log.append(
            EventPriority::Info,
            EndpointNumber(0),
            ClusterId(0x3e),
            EventId(0),
            Some(FabricIndex(1)),
            TlvValue::Null,
        );
        log.append(
            EventPriority::Info,
            EndpointNumber(0),
            ClusterId(0x3e),
            EventId(0),
            Some(FabricIndex(2)),
            TlvValue::Null,
        );

        let seen = log.events_after(EventNumber(0), Some(FabricIndex(1)));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].fabric_index, Some(FabricIndex(1)));
    }
}
