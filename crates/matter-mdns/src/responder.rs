//! 查询应答策略引擎：纯逻辑层，便于用虚拟时钟做确定性测试。
//!
//! # 策略（What）
//! - **重复抑制**：同一接口上 900 ms 内已组播过的记录不再出现在后续
//!   组播应答中；
//! - **单播应答**：仅当所有匹配的问题都置了 QU 位，且每条适用记录距
//!   上次组播不超过其 TTL 的四分之一时才走单播；否则组播并记下发送
//!   时刻；
//! - 应答集合 = 直接匹配的记录 + 实例相关的附加记录（SRV/TXT/地址）。

use crate::wire::{DnsMessage, Name, Question, Record, RecordData, rtype};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 组播重复抑制窗口。
pub const SUPPRESSION_WINDOW: Duration = Duration::from_millis(900);

/// 应答的投递方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseRoute {
    Multicast,
    Unicast,
}

type RecordKey = (Name, u16);

/// 单接口的应答器：持有物化记录与组播时间戳。
#[derive(Debug, Default)]
pub struct QueryResponder {
    records: Vec<Record>,
    last_multicast: HashMap<RecordKey, Instant>,
}

impl QueryResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以新的记录集合整体替换（记录生成器变化时调用）。
    pub fn replace_records(&mut self, records: Vec<Record>) {
        self.last_multicast.clear();
        self.records = records;
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// 生成一次主动通告（全部记录组播，并登记发送时刻）。
    pub fn announcement(&mut self, now: Instant) -> Option<DnsMessage> {
        if self.records.is_empty() {
            return None;
        }
        for record in &self.records {
            self.last_multicast
                .insert(record_key(record), now);
        }
        Some(DnsMessage::response(self.records.clone(), Vec::new()))
    }

    /// 处理一条查询，返回应答与投递方式。
    pub fn respond(
        &mut self,
        query: &DnsMessage,
        now: Instant,
    ) -> Option<(DnsMessage, ResponseRoute)> {
        if query.is_response {
            return None;
        }

        let mut answers: Vec<Record> = Vec::new();
        let mut matched_any = false;
        let mut all_unicast = !query.questions.is_empty();
        for question in &query.questions {
            let matches = self.match_question(question);
            if !matches.is_empty() {
                matched_any = true;
                if !question.unicast_response {
                    all_unicast = false;
                }
                for record in matches {
                    if !answers.contains(&record) {
                        answers.push(record);
                    }
                }
            }
        }
        if !matched_any {
            return None;
        }

        let additionals = self.additionals_for(&answers);

        let unicast_allowed = all_unicast
            && answers.iter().chain(additionals.iter()).all(|record| {
                self.last_multicast
                    .get(&record_key(record))
                    .is_some_and(|sent| {
                        now.duration_since(*sent) <= Duration::from_secs(u64::from(record.ttl)) / 4
                    })
            });

        if unicast_allowed {
            return Some((
                DnsMessage::response(answers, additionals),
                ResponseRoute::Unicast,
            ));
        }

        // 组播路径：套用重复抑制，全部被抑制则静默。
        let answers: Vec<Record> = answers
            .into_iter()
            .filter(|record| self.not_recently_multicast(record, now))
            .collect();
        if answers.is_empty() {
            return None;
        }
        let additionals: Vec<Record> = additionals
            .into_iter()
            .filter(|record| self.not_recently_multicast(record, now))
            .collect();
        for record in answers.iter().chain(additionals.iter()) {
            self.last_multicast.insert(record_key(record), now);
        }
        Some((
            DnsMessage::response(answers, additionals),
            ResponseRoute::Multicast,
        ))
    }

    fn not_recently_multicast(&self, record: &Record, now: Instant) -> bool {
        self.last_multicast
            .get(&record_key(record))
            .is_none_or(|sent| now.duration_since(*sent) >= SUPPRESSION_WINDOW)
    }

    fn match_question(&self, question: &Question) -> Vec<Record> {
        self.records
            .iter()
            .filter(|record| {
                record.name == question.name
                    && (question.qtype == rtype::ANY || question.qtype == record.data.rtype())
            })
            .cloned()
            .collect()
    }

    /// PTR 命中的实例补充 SRV/TXT，SRV 命中的目标主机补充地址记录。
    fn additionals_for(&self, answers: &[Record]) -> Vec<Record> {
        let mut additionals = Vec::new();
        let mut push = |record: &Record, additionals: &mut Vec<Record>| {
            if !answers.contains(record) && !additionals.contains(record) {
                additionals.push(record.clone());
            }
        };

        for answer in answers {
            match &answer.data {
                RecordData::Ptr(instance) => {
                    for record in &self.records {
                        if record.name == *instance {
                            push(record, &mut additionals);
                        }
                    }
                }
                RecordData::Srv { target, .. } => {
                    for record in &self.records {
                        if record.name == *target
                            && matches!(record.data, RecordData::A(_) | RecordData::Aaaa(_))
                        {
                            push(record, &mut additionals);
                        }
                    }
                }
                _ => {}
            }
        }

        // PTR 附加的 SRV 进一步带出主机地址。
        let srv_targets: Vec<Name> = additionals
            .iter()
            .filter_map(|record| match &record.data {
                RecordData::Srv { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();
        for target in srv_targets {
            for record in &self.records {
                if record.name == target
                    && matches!(record.data, RecordData::A(_) | RecordData::Aaaa(_))
                {
                    push(record, &mut additionals);
                }
            }
        }
        additionals
    }
}

fn record_key(record: &Record) -> RecordKey {
    (record.name.clone(), record.data.rtype())
}

/// 通告节奏：初始两连发，变更后重来，稳态周期刷新。
///
/// “对端握手成功后收敛广播”由 [`AnnouncementSchedule::reduce`] 实现：
/// 清空剩余连发，仅保留低频周期刷新。
#[derive(Debug)]
pub struct AnnouncementSchedule {
    burst_remaining: u8,
    refresh_interval: Duration,
}

impl Default for AnnouncementSchedule {
    fn default() -> Self {
        Self {
            burst_remaining: 2,
            refresh_interval: Duration::from_secs(150),
        }
    }
}

impl AnnouncementSchedule {
    /// 距下一次通告的等待时长。
    pub fn next_delay(&mut self) -> Duration {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            Duration::from_secs(1)
        } else {
            self.refresh_interval
        }
    }

    /// 记录集合变化：重置连发。
    pub fn mark_changed(&mut self) {
        self.burst_remaining = 2;
    }

    /// 对端已建立会话：收敛到低频刷新。
    pub fn reduce(&mut self) {
        self.burst_remaining = 0;
        self.refresh_interval = Duration::from_secs(600);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::{
        CommissionableAdvertisement, CommissioningMode, DEFAULT_PORT, SessionIntervals,
    };
    use matter_core::types::{DeviceTypeId, ProductId, VendorId};

    fn responder() -> QueryResponder {
        let advert = CommissionableAdvertisement {
            instance_id: "A1B2C3D4E5F60708".into(),
            discriminator: 3840,
            vendor_id: VendorId(0xfff1),
            product_id: ProductId(0x8000),
            mode: CommissioningMode::Basic,
            device_type: DeviceTypeId(0x0100),
            device_name: None,
            intervals: SessionIntervals::default(),
            pairing_hint: 0,
            pairing_instructions: None,
            idle_capable: false,
            port: DEFAULT_PORT,
        }
        .into_service();
        let mut responder = QueryResponder::new();
        responder.replace_records(
            advert.records(&Name::parse("device.local"), &["fe80::1".parse().expect("addr")]),
        );
        responder
    }

    fn ptr_query(unicast: bool) -> DnsMessage {
        DnsMessage::query(vec![Question {
            name: Name::parse("_matterc._udp.local"),
            qtype: rtype::PTR,
            unicast_response: unicast,
        }])
    }

    #[test]
    fn answer_carries_srv_txt_and_address_additionals() {
        let mut responder = responder();
        let now = Instant::now();
        let (reply, route) = responder.respond(&ptr_query(false), now).expect("reply");
        assert_eq!(route, ResponseRoute::Multicast);
        assert_eq!(reply.answers.len(), 1);
        let kinds: Vec<u16> = reply.additionals.iter().map(|r| r.data.rtype()).collect();
        assert!(kinds.contains(&rtype::SRV));
        assert!(kinds.contains(&rtype::TXT));
        assert!(kinds.contains(&rtype::AAAA));
    }

    #[test]
    fn duplicate_multicast_suppressed_within_window() {
        let mut responder = responder();
        let now = Instant::now();
        responder.respond(&ptr_query(false), now).expect("first");
        assert!(
            responder
                .respond(&ptr_query(false), now + Duration::from_millis(500))
                .is_none(),
            "identical answer within 900ms must be suppressed"
        );
        assert!(
            responder
                .respond(&ptr_query(false), now + Duration::from_millis(1000))
                .is_some(),
            "after the window the answer flows again"
        );
    }

    #[test]
    fn unicast_honoured_only_after_recent_multicast() {
        let mut responder = responder();
        let now = Instant::now();

        // 尚未组播过：即便 QU 置位也必须走组播。
        let (_, route) = responder.respond(&ptr_query(true), now).expect("reply");
        assert_eq!(route, ResponseRoute::Multicast);

        // 刚组播过：QU 查询可走单播且不受抑制窗口影响。
        let (_, route) = responder
            .respond(&ptr_query(true), now + Duration::from_millis(100))
            .expect("reply");
        assert_eq!(route, ResponseRoute::Unicast);
    }

    #[test]
    fn announcement_burst_then_periodic() {
        let mut schedule = AnnouncementSchedule::default();
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Duration::from_secs(150));

        schedule.mark_changed();
        assert_eq!(schedule.next_delay(), Duration::from_secs(1));

        schedule.reduce();
        assert_eq!(schedule.next_delay(), Duration::from_secs(600));
    }
}
