//! DNS 线缆格式编解码：查询/应答报文、资源记录与名称压缩。
//!
//! # 契约说明（What）
//! - 编码端不产生压缩指针（合法且实现简单）；解码端完整支持压缩指针，
//!   以兼容主流 mDNS 实现的应答；
//! - 仅覆盖 DNS-SD 所需的记录类型：PTR/SRV/TXT/A/AAAA，其余类型在解码
//!   时保留原始字节透传。

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// DNS 解析错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DnsError {
    #[error("dns message truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("dns name contains a bad label at offset {offset}")]
    BadLabel { offset: usize },
    #[error("dns compression pointer loop")]
    PointerLoop,
}

/// 大小写不敏感比较的 DNS 名称，内部以小写标签存储。
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Name {
    labels: Vec<String>,
}

impl Name {
    pub fn parse(text: &str) -> Self {
        Self {
            labels: text
                .trim_end_matches('.')
                .split('.')
                .filter(|label| !label.is_empty())
                .map(|label| label.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// 是否以 `suffix` 结尾（服务类型匹配）。
    pub fn ends_with(&self, suffix: &Name) -> bool {
        self.labels.len() >= suffix.labels.len()
            && self.labels[self.labels.len() - suffix.labels.len()..] == suffix.labels[..]
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for label in &self.labels {
            let bytes = label.as_bytes();
            out.push(bytes.len().min(63) as u8);
            out.extend_from_slice(&bytes[..bytes.len().min(63)]);
        }
        out.push(0);
    }

    fn decode(input: &[u8], pos: &mut usize) -> Result<Self, DnsError> {
        let mut labels = Vec::new();
        let mut cursor = *pos;
        let mut jumped = false;
        let mut hops = 0usize;
        loop {
            let len = *input
                .get(cursor)
                .ok_or(DnsError::Truncated { offset: cursor })? as usize;
            if len == 0 {
                cursor += 1;
                if !jumped {
                    *pos = cursor;
                }
                return Ok(Self { labels });
            }
            if len & 0xc0 == 0xc0 {
                let low = *input
                    .get(cursor + 1)
                    .ok_or(DnsError::Truncated { offset: cursor + 1 })?
                    as usize;
                if !jumped {
                    *pos = cursor + 2;
                }
                cursor = ((len & 0x3f) << 8) | low;
                jumped = true;
                hops += 1;
                if hops > 16 {
                    return Err(DnsError::PointerLoop);
                }
                continue;
            }
            if len > 63 {
                return Err(DnsError::BadLabel { offset: cursor });
            }
            let end = cursor + 1 + len;
            let raw = input
                .get(cursor + 1..end)
                .ok_or(DnsError::Truncated { offset: cursor })?;
            labels.push(String::from_utf8_lossy(raw).to_ascii_lowercase());
            cursor = end;
        }
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.", self.labels.join("."))
    }
}

/// 记录类型编号。
pub mod rtype {
    pub const A: u16 = 1;
    pub const PTR: u16 = 12;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const ANY: u16 = 255;
}

/// 资源记录数据。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordData {
    Ptr(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Txt(Vec<String>),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// 未识别类型的原始字节。
    Raw(u16, Vec<u8>),
}

impl RecordData {
    pub fn rtype(&self) -> u16 {
        match self {
            RecordData::Ptr(_) => rtype::PTR,
            RecordData::Srv { .. } => rtype::SRV,
            RecordData::Txt(_) => rtype::TXT,
            RecordData::A(_) => rtype::A,
            RecordData::Aaaa(_) => rtype::AAAA,
            RecordData::Raw(rtype, _) => *rtype,
        }
    }
}

/// 一条资源记录。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub name: Name,
    pub ttl: u32,
    /// cache-flush 位（mDNS 专用）。
    pub cache_flush: bool,
    pub data: RecordData,
}

/// 一条查询。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    /// QU 位：查询方请求单播应答。
    pub unicast_response: bool,
}

/// DNS 报文。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    /// TC 位：报文被截断，后续还有延续查询。
    pub truncated: bool,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl DnsMessage {
    pub fn response(answers: Vec<Record>, additionals: Vec<Record>) -> Self {
        Self {
            is_response: true,
            answers,
            additionals,
            ..Self::default()
        }
    }

    pub fn query(questions: Vec<Question>) -> Self {
        Self {
            questions,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        let mut flags = 0u16;
        if self.is_response {
            flags |= 0x8400; // QR + AA
        }
        if self.truncated {
            flags |= 0x0200;
        }
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for question in &self.questions {
            question.name.encode(&mut out);
            out.extend_from_slice(&question.qtype.to_be_bytes());
            let class = if question.unicast_response {
                0x8001
            } else {
                0x0001u16
            };
            out.extend_from_slice(&class.to_be_bytes());
        }
        for record in self.answers.iter().chain(self.additionals.iter()) {
            encode_record(record, &mut out);
        }
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, DnsError> {
        let header = input
            .get(..12)
            .ok_or(DnsError::Truncated { offset: 0 })?;
        let id = u16::from_be_bytes([header[0], header[1]]);
        let flags = u16::from_be_bytes([header[2], header[3]]);
        let question_count = u16::from_be_bytes([header[4], header[5]]) as usize;
        let answer_count = u16::from_be_bytes([header[6], header[7]]) as usize;
        let authority_count = u16::from_be_bytes([header[8], header[9]]) as usize;
        let additional_count = u16::from_be_bytes([header[10], header[11]]) as usize;

        let mut pos = 12usize;
        let mut questions = Vec::with_capacity(question_count);
        for _ in 0..question_count {
            let name = Name::decode(input, &mut pos)?;
            let fixed = input
                .get(pos..pos + 4)
                .ok_or(DnsError::Truncated { offset: pos })?;
            let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let class = u16::from_be_bytes([fixed[2], fixed[3]]);
            pos += 4;
            questions.push(Question {
                name,
                qtype,
                unicast_response: class & 0x8000 != 0,
            });
        }

        let mut answers = Vec::with_capacity(answer_count);
        for _ in 0..answer_count {
            answers.push(decode_record(input, &mut pos)?);
        }
        for _ in 0..authority_count {
            decode_record(input, &mut pos)?;
        }
        let mut additionals = Vec::with_capacity(additional_count);
        for _ in 0..additional_count {
            additionals.push(decode_record(input, &mut pos)?);
        }

        Ok(Self {
            id,
            is_response: flags & 0x8000 != 0,
            truncated: flags & 0x0200 != 0,
            questions,
            answers,
            additionals,
        })
    }
}

fn encode_record(record: &Record, out: &mut Vec<u8>) {
    record.name.encode(out);
    out.extend_from_slice(&record.data.rtype().to_be_bytes());
    let class = if record.cache_flush { 0x8001u16 } else { 0x0001 };
    out.extend_from_slice(&class.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::Ptr(target) => target.encode(&mut rdata),
        RecordData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            rdata.extend_from_slice(&priority.to_be_bytes());
            rdata.extend_from_slice(&weight.to_be_bytes());
            rdata.extend_from_slice(&port.to_be_bytes());
            target.encode(&mut rdata);
        }
        RecordData::Txt(entries) => {
            if entries.is_empty() {
                rdata.push(0);
            }
            for entry in entries {
                let bytes = entry.as_bytes();
                rdata.push(bytes.len().min(255) as u8);
                rdata.extend_from_slice(&bytes[..bytes.len().min(255)]);
            }
        }
        RecordData::A(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Aaaa(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Raw(_, bytes) => rdata.extend_from_slice(bytes),
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
}

fn decode_record(input: &[u8], pos: &mut usize) -> Result<Record, DnsError> {
    let name = Name::decode(input, pos)?;
    let fixed = input
        .get(*pos..*pos + 10)
        .ok_or(DnsError::Truncated { offset: *pos })?;
    let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let class = u16::from_be_bytes([fixed[2], fixed[3]]);
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
    *pos += 10;
    let rdata_start = *pos;
    let rdata = input
        .get(*pos..*pos + rdlen)
        .ok_or(DnsError::Truncated { offset: *pos })?;
    *pos += rdlen;

    let data = match rtype {
        rtype::PTR => {
            let mut cursor = rdata_start;
            RecordData::Ptr(Name::decode(input, &mut cursor)?)
        }
        rtype::SRV => {
            if rdata.len() < 6 {
                return Err(DnsError::Truncated { offset: rdata_start });
            }
            let mut cursor = rdata_start + 6;
            RecordData::Srv {
                priority: u16::from_be_bytes([rdata[0], rdata[1]]),
                weight: u16::from_be_bytes([rdata[2], rdata[3]]),
                port: u16::from_be_bytes([rdata[4], rdata[5]]),
                target: Name::decode(input, &mut cursor)?,
            }
        }
        rtype::TXT => {
            let mut entries = Vec::new();
            let mut cursor = 0usize;
            while cursor < rdata.len() {
                let len = rdata[cursor] as usize;
                cursor += 1;
                let end = (cursor + len).min(rdata.len());
                if len > 0 {
                    entries.push(String::from_utf8_lossy(&rdata[cursor..end]).into_owned());
                }
                cursor = end;
            }
            RecordData::Txt(entries)
        }
        rtype::A if rdata.len() == 4 => {
            RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
        }
        rtype::AAAA if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        other => RecordData::Raw(other, rdata.to_vec()),
    };

    Ok(Record {
        name,
        ttl,
        cache_flush: class & 0x8000 != 0,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> DnsMessage {
        let service = Name::parse("_matterc._udp.local");
        let instance = Name::parse("A1B2C3D4E5F60708._matterc._udp.local");
        let host = Name::parse("device.local");
        DnsMessage::response(
            vec![Record {
                name: service,
                ttl: 4500,
                cache_flush: false,
                data: RecordData::Ptr(instance.clone()),
            }],
            vec![
                Record {
                    name: instance.clone(),
                    ttl: 120,
                    cache_flush: true,
                    data: RecordData::Srv {
                        priority: 0,
                        weight: 0,
                        port: 5540,
                        target: host.clone(),
                    },
                },
                Record {
                    name: instance,
                    ttl: 4500,
                    cache_flush: true,
                    data: RecordData::Txt(vec!["D=3840".into(), "CM=1".into()]),
                },
                Record {
                    name: host,
                    ttl: 120,
                    cache_flush: true,
                    data: RecordData::Aaaa("fe80::1".parse().expect("addr")),
                },
            ],
        )
    }

    #[test]
    fn roundtrip_service_response() {
        let message = sample_response();
        let decoded = DnsMessage::decode(&message.encode()).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn decodes_compressed_names() {
        // 手工构造带压缩指针的应答：answer 名称指回 question 的名称。
        let question_name = Name::parse("_matter._tcp.local");
        let mut bytes = DnsMessage::query(vec![Question {
            name: question_name.clone(),
            qtype: rtype::PTR,
            unicast_response: false,
        }])
        .encode();
        // 把 answer 数量改为 1，并追加一条 PTR 记录，其名称为指向
        // 偏移 12（question 名称起点）的压缩指针。
        bytes[7] = 1;
        bytes.extend_from_slice(&[0xc0, 0x0c]); // name pointer
        bytes.extend_from_slice(&rtype::PTR.to_be_bytes());
        bytes.extend_from_slice(&0x0001u16.to_be_bytes());
        bytes.extend_from_slice(&4500u32.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&[0xc0, 0x0c]); // rdata pointer

        let decoded = DnsMessage::decode(&bytes).expect("decode");
        assert_eq!(decoded.answers.len(), 1);
        assert_eq!(decoded.answers[0].name, question_name);
        assert_eq!(decoded.answers[0].data, RecordData::Ptr(question_name));
    }

    #[test]
    fn qu_bit_roundtrips() {
        let query = DnsMessage::query(vec![Question {
            name: Name::parse("_matterc._udp.local"),
            qtype: rtype::PTR,
            unicast_response: true,
        }]);
        let decoded = DnsMessage::decode(&query.encode()).expect("decode");
        assert!(decoded.questions[0].unicast_response);
    }
}
