//! 交互模型消息面：路径、请求/响应结构与 TLV 编解码。

use matter_codec_tlv::{Tag, TlvValue, decode, encode};
use matter_core::error::{MatterError, Result, codes};
use matter_core::status::Status;
use matter_core::types::{
    AttributeId, ClusterId, CommandId, DataVersion, EndpointNumber, EventId, EventNumber,
};

/// 交互模型协议的 opcode 清单。
pub mod opcode {
    pub const STATUS_RESPONSE: u8 = 0x01;
    pub const READ_REQUEST: u8 = 0x02;
    pub const SUBSCRIBE_REQUEST: u8 = 0x03;
    pub const SUBSCRIBE_RESPONSE: u8 = 0x04;
    pub const REPORT_DATA: u8 = 0x05;
    pub const WRITE_REQUEST: u8 = 0x06;
    pub const WRITE_RESPONSE: u8 = 0x07;
    pub const INVOKE_REQUEST: u8 = 0x08;
    pub const INVOKE_RESPONSE: u8 = 0x09;
    pub const TIMED_REQUEST: u8 = 0x0a;
}

fn malformed(what: &str) -> MatterError {
    MatterError::framing(codes::TLV_MALFORMED, format!("im payload: {what}"))
}

fn opt_u64(value: &TlvValue, tag: u8) -> Option<u64> {
    value.field(tag).and_then(|v| v.as_u64())
}

fn opt_bool(value: &TlvValue, tag: u8) -> Option<bool> {
    value.field(tag).and_then(|v| v.as_bool())
}

fn array_field<'a>(value: &'a TlvValue, tag: u8) -> &'a [TlvValue] {
    value
        .field(tag)
        .and_then(|v| v.as_array())
        .unwrap_or(&[])
}

/// 属性路径；`None` 分量表示 wildcard。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct AttributePath {
    pub endpoint: Option<EndpointNumber>,
    pub cluster: Option<ClusterId>,
    pub attribute: Option<AttributeId>,
}

impl AttributePath {
    pub fn concrete(endpoint: EndpointNumber, cluster: ClusterId, attribute: AttributeId) -> Self {
        Self {
            endpoint: Some(endpoint),
            cluster: Some(cluster),
            attribute: Some(attribute),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.endpoint.is_none() || self.cluster.is_none() || self.attribute.is_none()
    }

    pub fn to_tlv(&self) -> TlvValue {
        let mut fields = Vec::new();
        if let Some(endpoint) = self.endpoint {
            fields.push((Tag::Context(0), TlvValue::UnsignedInt(u64::from(endpoint.raw()))));
        }
        if let Some(cluster) = self.cluster {
            fields.push((Tag::Context(1), TlvValue::UnsignedInt(u64::from(cluster.raw()))));
        }
        if let Some(attribute) = self.attribute {
            fields.push((
                Tag::Context(2),
                TlvValue::UnsignedInt(u64::from(attribute.raw())),
            ));
        }
        TlvValue::List(fields)
    }

    pub fn from_tlv(value: &TlvValue) -> Result<Self> {
        Ok(Self {
            endpoint: opt_u64(value, 0).map(|v| EndpointNumber(v as u16)),
            cluster: opt_u64(value, 1).map(|v| ClusterId(v as u32)),
            attribute: opt_u64(value, 2).map(|v| AttributeId(v as u32)),
        })
    }
}

/// 事件路径；分量同属性路径。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct EventPath {
    pub endpoint: Option<EndpointNumber>,
    pub cluster: Option<ClusterId>,
    pub event: Option<EventId>,
}

impl EventPath {
    pub fn to_tlv(&self) -> TlvValue {
        let mut fields = Vec::new();
        if let Some(endpoint) = self.endpoint {
            fields.push((Tag::Context(0), TlvValue::UnsignedInt(u64::from(endpoint.raw()))));
        }
        if let Some(cluster) = self.cluster {
            fields.push((Tag::Context(1), TlvValue::UnsignedInt(u64::from(cluster.raw()))));
        }
        if let Some(event) = self.event {
            fields.push((Tag::Context(2), TlvValue::UnsignedInt(u64::from(event.raw()))));
        }
        TlvValue::List(fields)
    }

    pub fn from_tlv(value: &TlvValue) -> Result<Self> {
        Ok(Self {
            endpoint: opt_u64(value, 0).map(|v| EndpointNumber(v as u16)),
            cluster: opt_u64(value, 1).map(|v| ClusterId(v as u32)),
            event: opt_u64(value, 2).map(|v| EventId(v as u32)),
        })
    }
}

/// 命令路径（调用不支持 wildcard）。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CommandPath {
    pub endpoint: EndpointNumber,
    pub cluster: ClusterId,
    pub command: CommandId,
}

impl CommandPath {
    pub fn to_tlv(&self) -> TlvValue {
        TlvValue::List(vec![
            (Tag::Context(0), TlvValue::UnsignedInt(u64::from(self.endpoint.raw()))),
            (Tag::Context(1), TlvValue::UnsignedInt(u64::from(self.cluster.raw()))),
            (Tag::Context(2), TlvValue::UnsignedInt(u64::from(self.command.raw()))),
        ])
    }

    pub fn from_tlv(value: &TlvValue) -> Result<Self> {
        Ok(Self {
            endpoint: EndpointNumber(
                opt_u64(value, 0).ok_or_else(|| malformed("command path endpoint"))? as u16,
            ),
            cluster: ClusterId(
                opt_u64(value, 1).ok_or_else(|| malformed("command path cluster"))? as u32,
            ),
            command: CommandId(
                opt_u64(value, 2).ok_or_else(|| malformed("command path command"))? as u32,
            ),
        })
    }
}

/// 客户端缓存版本过滤器。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataVersionFilter {
    pub endpoint: EndpointNumber,
    pub cluster: ClusterId,
    pub version: DataVersion,
}

impl DataVersionFilter {
    pub fn to_tlv(&self) -> TlvValue {
        TlvValue::Structure(vec![
            (Tag::Context(0), TlvValue::UnsignedInt(u64::from(self.endpoint.raw()))),
            (Tag::Context(1), TlvValue::UnsignedInt(u64::from(self.cluster.raw()))),
            (Tag::Context(2), TlvValue::UnsignedInt(u64::from(self.version.raw()))),
        ])
    }

    pub fn from_tlv(value: &TlvValue) -> Result<Self> {
        Ok(Self {
            endpoint: EndpointNumber(
                opt_u64(value, 0).ok_or_else(|| malformed("filter endpoint"))? as u16,
            ),
            cluster: ClusterId(opt_u64(value, 1).ok_or_else(|| malformed("filter cluster"))? as u32),
            version: DataVersion(
                opt_u64(value, 2).ok_or_else(|| malformed("filter version"))? as u32,
            ),
        })
    }
}

/// 读请求。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadRequest {
    pub attribute_paths: Vec<AttributePath>,
    pub event_paths: Vec<EventPath>,
    /// 只要事件号大于该值的事件。
    pub event_min: Option<EventNumber>,
    pub fabric_filtered: bool,
    pub data_version_filters: Vec<DataVersionFilter>,
}

impl ReadRequest {
    fn fields(&self) -> Vec<(Tag, TlvValue)> {
        vec![
            (
                Tag::Context(0),
                TlvValue::Array(self.attribute_paths.iter().map(|p| p.to_tlv()).collect()),
            ),
            (
                Tag::Context(1),
                TlvValue::Array(self.event_paths.iter().map(|p| p.to_tlv()).collect()),
            ),
            (
                Tag::Context(2),
                self.event_min
                    .map(|n| TlvValue::UnsignedInt(n.raw()))
                    .unwrap_or(TlvValue::Null),
            ),
            (Tag::Context(3), TlvValue::Bool(self.fabric_filtered)),
            (
                Tag::Context(4),
                TlvValue::Array(self.data_version_filters.iter().map(|f| f.to_tlv()).collect()),
            ),
        ]
    }

    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(self.fields()))
    }

    fn parse(value: &TlvValue) -> Result<Self> {
        Ok(Self {
            attribute_paths: array_field(value, 0)
                .iter()
                .map(AttributePath::from_tlv)
                .collect::<Result<_>>()?,
            event_paths: array_field(value, 1)
                .iter()
                .map(EventPath::from_tlv)
                .collect::<Result<_>>()?,
            event_min: opt_u64(value, 2).map(EventNumber),
            fabric_filtered: opt_bool(value, 3).unwrap_or(false),
            data_version_filters: array_field(value, 4)
                .iter()
                .map(DataVersionFilter::from_tlv)
                .collect::<Result<_>>()?,
        })
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        Self::parse(&decode(bytes)?)
    }
}

/// 订阅请求：读形态的路径集 + 节流区间。
#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeRequest {
    pub read: ReadRequest,
    pub min_interval_s: u16,
    pub max_interval_s: u16,
}

impl SubscribeRequest {
    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = self.read.fields();
        fields.push((
            Tag::Context(5),
            TlvValue::UnsignedInt(u64::from(self.min_interval_s)),
        ));
        fields.push((
            Tag::Context(6),
            TlvValue::UnsignedInt(u64::from(self.max_interval_s)),
        ));
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            read: ReadRequest::parse(&value)?,
            min_interval_s: opt_u64(&value, 5).ok_or_else(|| malformed("min interval"))? as u16,
            max_interval_s: opt_u64(&value, 6).ok_or_else(|| malformed("max interval"))? as u16,
        })
    }
}

/// 订阅响应。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscribeResponse {
    pub subscription_id: u32,
    pub max_interval_s: u16,
}

impl SubscribeResponse {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![
            (
                Tag::Context(0),
                TlvValue::UnsignedInt(u64::from(self.subscription_id)),
            ),
            (
                Tag::Context(1),
                TlvValue::UnsignedInt(u64::from(self.max_interval_s)),
            ),
        ]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            subscription_id: opt_u64(&value, 0).ok_or_else(|| malformed("subscription id"))? as u32,
            max_interval_s: opt_u64(&value, 1).ok_or_else(|| malformed("max interval"))? as u16,
        })
    }
}

/// 一条属性报告：数据或逐路径状态。
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeReport {
    Data {
        path: AttributePath,
        version: DataVersion,
        value: TlvValue,
    },
    Status {
        path: AttributePath,
        status: Status,
    },
}

impl AttributeReport {
    pub fn path(&self) -> &AttributePath {
        match self {
            AttributeReport::Data { path, .. } | AttributeReport::Status { path, .. } => path,
        }
    }

    fn to_tlv(&self) -> TlvValue {
        match self {
            AttributeReport::Data {
                path,
                version,
                value,
            } => TlvValue::Structure(vec![
                (Tag::Context(0), path.to_tlv()),
                (Tag::Context(1), TlvValue::UnsignedInt(u64::from(version.raw()))),
                (Tag::Context(2), value.clone()),
            ]),
            AttributeReport::Status { path, status } => TlvValue::Structure(vec![
                (Tag::Context(0), path.to_tlv()),
                (Tag::Context(3), TlvValue::UnsignedInt(u64::from(status.raw()))),
            ]),
        }
    }

    fn from_tlv(value: &TlvValue) -> Result<Self> {
        let path =
            AttributePath::from_tlv(value.field(0).ok_or_else(|| malformed("report path"))?)?;
        if let Some(status) = opt_u64(value, 3) {
            return Ok(AttributeReport::Status {
                path,
                status: Status::from_raw(status as u8),
            });
        }
        Ok(AttributeReport::Data {
            path,
            version: DataVersion(opt_u64(value, 1).ok_or_else(|| malformed("report version"))? as u32),
            value: value
                .field(2)
                .cloned()
                .ok_or_else(|| malformed("report value"))?,
        })
    }
}

/// 一条事件报告。
#[derive(Clone, Debug, PartialEq)]
pub struct EventReport {
    pub path: EventPath,
    pub number: EventNumber,
    pub priority: u8,
    pub epoch_timestamp_ms: u64,
    pub payload: TlvValue,
}

impl EventReport {
    fn to_tlv(&self) -> TlvValue {
        TlvValue::Structure(vec![
            (Tag::Context(0), self.path.to_tlv()),
            (Tag::Context(1), TlvValue::UnsignedInt(self.number.raw())),
            (Tag::Context(2), TlvValue::UnsignedInt(u64::from(self.priority))),
            (Tag::Context(3), TlvValue::UnsignedInt(self.epoch_timestamp_ms)),
            (Tag::Context(4), self.payload.clone()),
        ])
    }

    fn from_tlv(value: &TlvValue) -> Result<Self> {
        Ok(Self {
            path: EventPath::from_tlv(value.field(0).ok_or_else(|| malformed("event path"))?)?,
            number: EventNumber(opt_u64(value, 1).ok_or_else(|| malformed("event number"))?),
            priority: opt_u64(value, 2).unwrap_or(1) as u8,
            epoch_timestamp_ms: opt_u64(value, 3).unwrap_or(0),
            payload: value.field(4).cloned().unwrap_or(TlvValue::Null),
        })
    }
}

/// 报告数据帧（读响应与订阅上报共用）。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportData {
    pub subscription_id: Option<u32>,
    pub attribute_reports: Vec<AttributeReport>,
    pub event_reports: Vec<EventReport>,
    pub more_chunked_messages: bool,
    pub suppress_response: bool,
}

impl ReportData {
    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        if let Some(id) = self.subscription_id {
            fields.push((Tag::Context(0), TlvValue::UnsignedInt(u64::from(id))));
        }
        fields.push((
            Tag::Context(1),
            TlvValue::Array(self.attribute_reports.iter().map(|r| r.to_tlv()).collect()),
        ));
        fields.push((
            Tag::Context(2),
            TlvValue::Array(self.event_reports.iter().map(|r| r.to_tlv()).collect()),
        ));
        fields.push((Tag::Context(3), TlvValue::Bool(self.more_chunked_messages)));
        fields.push((Tag::Context(4), TlvValue::Bool(self.suppress_response)));
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            subscription_id: opt_u64(&value, 0).map(|v| v as u32),
            attribute_reports: array_field(&value, 1)
                .iter()
                .map(AttributeReport::from_tlv)
                .collect::<Result<_>>()?,
            event_reports: array_field(&value, 2)
                .iter()
                .map(EventReport::from_tlv)
                .collect::<Result<_>>()?,
            more_chunked_messages: opt_bool(&value, 3).unwrap_or(false),
            suppress_response: opt_bool(&value, 4).unwrap_or(false),
        })
    }
}

/// 写请求中的一笔数据。
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeData {
    pub path: AttributePath,
    pub value: TlvValue,
}

/// 写请求。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteRequest {
    pub timed_request: bool,
    pub writes: Vec<AttributeData>,
}

impl WriteRequest {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![
            (Tag::Context(0), TlvValue::Bool(self.timed_request)),
            (
                Tag::Context(1),
                TlvValue::Array(
                    self.writes
                        .iter()
                        .map(|write| {
                            TlvValue::Structure(vec![
                                (Tag::Context(0), write.path.to_tlv()),
                                (Tag::Context(1), write.value.clone()),
                            ])
                        })
                        .collect(),
                ),
            ),
        ]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            timed_request: opt_bool(&value, 0).unwrap_or(false),
            writes: array_field(&value, 1)
                .iter()
                .map(|entry| {
                    Ok(AttributeData {
                        path: AttributePath::from_tlv(
                            entry.field(0).ok_or_else(|| malformed("write path"))?,
                        )?,
                        value: entry
                            .field(1)
                            .cloned()
                            .ok_or_else(|| malformed("write value"))?,
                    })
                })
                .collect::<Result<_>>()?,
        })
    }
}

/// 逐路径写状态。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttributeStatus {
    pub path: AttributePath,
    pub status: Status,
}

/// 写响应。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteResponse {
    pub statuses: Vec<AttributeStatus>,
}

impl WriteResponse {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![(
            Tag::Context(0),
            TlvValue::Array(
                self.statuses
                    .iter()
                    .map(|entry| {
                        TlvValue::Structure(vec![
                            (Tag::Context(0), entry.path.to_tlv()),
                            (
                                Tag::Context(1),
                                TlvValue::UnsignedInt(u64::from(entry.status.raw())),
                            ),
                        ])
                    })
                    .collect(),
            ),
        )]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            statuses: array_field(&value, 0)
                .iter()
                .map(|entry| {
                    Ok(AttributeStatus {
                        path: AttributePath::from_tlv(
                            entry.field(0).ok_or_else(|| malformed("status path"))?,
                        )?,
                        status: Status::from_raw(
                            opt_u64(entry, 1).ok_or_else(|| malformed("status code"))? as u8,
                        ),
                    })
                })
                .collect::<Result<_>>()?,
        })
    }
}

/// 调用请求中的一条命令。
#[derive(Clone, Debug, PartialEq)]
pub struct CommandData {
    pub path: CommandPath,
    pub fields: TlvValue,
    /// 多命令调用的去重引用。
    pub command_ref: Option<u16>,
}

/// 调用请求。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvokeRequest {
    pub timed_request: bool,
    pub invokes: Vec<CommandData>,
}

impl InvokeRequest {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![
            (Tag::Context(0), TlvValue::Bool(self.timed_request)),
            (
                Tag::Context(1),
                TlvValue::Array(
                    self.invokes
                        .iter()
                        .map(|invoke| {
                            let mut fields = vec![
                                (Tag::Context(0), invoke.path.to_tlv()),
                                (Tag::Context(1), invoke.fields.clone()),
                            ];
                            if let Some(reference) = invoke.command_ref {
                                fields.push((
                                    Tag::Context(2),
                                    TlvValue::UnsignedInt(u64::from(reference)),
                                ));
                            }
                            TlvValue::Structure(fields)
                        })
                        .collect(),
                ),
            ),
        ]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            timed_request: opt_bool(&value, 0).unwrap_or(false),
            invokes: array_field(&value, 1)
                .iter()
                .map(|entry| {
                    Ok(CommandData {
                        path: CommandPath::from_tlv(
                            entry.field(0).ok_or_else(|| malformed("invoke path"))?,
                        )?,
                        fields: entry
                            .field(1)
                            .cloned()
                            .unwrap_or(TlvValue::Structure(Vec::new())),
                        command_ref: opt_u64(entry, 2).map(|v| v as u16),
                    })
                })
                .collect::<Result<_>>()?,
        })
    }
}

/// 调用响应的一个条目：状态或带类型响应。
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeResponseItem {
    pub path: CommandPath,
    pub status: Option<Status>,
    pub fields: Option<TlvValue>,
    pub command_ref: Option<u16>,
}

/// 调用响应。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvokeResponse {
    pub responses: Vec<InvokeResponseItem>,
}

impl InvokeResponse {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![(
            Tag::Context(0),
            TlvValue::Array(
                self.responses
                    .iter()
                    .map(|item| {
                        let mut fields = vec![(Tag::Context(0), item.path.to_tlv())];
                        if let Some(status) = item.status {
                            fields.push((
                                Tag::Context(1),
                                TlvValue::UnsignedInt(u64::from(status.raw())),
                            ));
                        }
                        if let Some(value) = &item.fields {
                            fields.push((Tag::Context(2), value.clone()));
                        }
                        if let Some(reference) = item.command_ref {
                            fields.push((
                                Tag::Context(3),
                                TlvValue::UnsignedInt(u64::from(reference)),
                            ));
                        }
                        TlvValue::Structure(fields)
                    })
                    .collect(),
            ),
        )]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            responses: array_field(&value, 0)
                .iter()
                .map(|entry| {
                    Ok(InvokeResponseItem {
                        path: CommandPath::from_tlv(
                            entry.field(0).ok_or_else(|| malformed("response path"))?,
                        )?,
                        status: opt_u64(entry, 1).map(|v| Status::from_raw(v as u8)),
                        fields: entry.field(2).cloned(),
                        command_ref: opt_u64(entry, 3).map(|v| v as u16),
                    })
                })
                .collect::<Result<_>>()?,
        })
    }
}

/// 计时请求：为随后的写/调用开一个短窗口。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimedRequest {
    pub timeout_ms: u16,
}

impl TimedRequest {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![(
            Tag::Context(0),
            TlvValue::UnsignedInt(u64::from(self.timeout_ms)),
        )]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            timeout_ms: opt_u64(&value, 0).ok_or_else(|| malformed("timed timeout"))? as u16,
        })
    }
}

/// 整体交互状态响应。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusResponse {
    pub status: Status,
}

impl StatusResponse {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![(
            Tag::Context(0),
            TlvValue::UnsignedInt(u64::from(self.status.raw())),
        )]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            status: Status::from_raw(
                opt_u64(&value, 0).ok_or_else(|| malformed("status"))? as u8
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_roundtrip_with_wildcards() {
        let request = ReadRequest {
            attribute_paths: vec![
                AttributePath {
                    endpoint: Some(EndpointNumber(1)),
                    cluster: Some(ClusterId(6)),
                    attribute: None,
                },
                AttributePath::concrete(EndpointNumber(0), ClusterId(0x28), AttributeId(5)),
            ],
            event_paths: vec![EventPath {
                endpoint: None,
                cluster: Some(ClusterId(0x28)),
                event: None,
            }],
            event_min: Some(EventNumber(17)),
            fabric_filtered: true,
            data_version_filters: vec![DataVersionFilter {
                endpoint: EndpointNumber(1),
                cluster: ClusterId(6),
                version: DataVersion(41),
            }],
        };
        let decoded = ReadRequest::from_tlv(&request.to_tlv()).expect("decode");
        assert_eq!(decoded, request);
        assert!(decoded.attribute_paths[0].is_wildcard());
    }

    #[test]
    fn report_data_roundtrip_mixed_reports() {
        let report = ReportData {
            subscription_id: Some(9),
            attribute_reports: vec![
                AttributeReport::Data {
                    path: AttributePath::concrete(EndpointNumber(1), ClusterId(6), AttributeId(0)),
                    version: DataVersion(3),
                    value: TlvValue::Bool(true),
                },
                AttributeReport::Status {
                    path: AttributePath::concrete(EndpointNumber(1), ClusterId(6), AttributeId(9)),
                    status: Status::UnsupportedAttribute,
                },
            ],
            event_reports: vec![EventReport {
                path: EventPath {
                    endpoint: Some(EndpointNumber(0)),
                    cluster: Some(ClusterId(0x28)),
                    event: Some(EventId(0)),
                },
                number: EventNumber(4),
                priority: 2,
                epoch_timestamp_ms: 123456,
                payload: TlvValue::Null,
            }],
            more_chunked_messages: true,
            suppress_response: false,
        };
        assert_eq!(ReportData::from_tlv(&report.to_tlv()).expect("decode"), report);
    }

    #[test]
    fn invoke_roundtrip_with_command_refs() {
        let request = InvokeRequest {
            timed_request: false,
            invokes: vec![
                CommandData {
                    path: CommandPath {
                        endpoint: EndpointNumber(1),
                        cluster: ClusterId(6),
                        command: CommandId(2),
                    },
                    fields: TlvValue::Structure(Vec::new()),
                    command_ref: Some(1),
                },
                CommandData {
                    path: CommandPath {
                        endpoint: EndpointNumber(1),
                        cluster: ClusterId(6),
                        command: CommandId(0),
                    },
                    fields: TlvValue::Structure(Vec::new()),
                    command_ref: Some(2),
                },
            ],
        };
        assert_eq!(
            InvokeRequest::from_tlv(&request.to_tlv()).expect("decode"),
            request
        );
    }

    #[test]
    fn write_and_status_roundtrip() {
        let request = WriteRequest {
            timed_request: true,
            writes: vec![AttributeData {
                path: AttributePath::concrete(EndpointNumber(1), ClusterId(0x201), AttributeId(0x50)),
                value: TlvValue::Array(vec![TlvValue::UnsignedInt(1)]),
            }],
        };
        assert_eq!(WriteRequest::from_tlv(&request.to_tlv()).expect("decode"), request);

        let response = WriteResponse {
            statuses: vec![AttributeStatus {
                path: request.writes[0].path,
                status: Status::InvalidInState,
            }],
        };
        assert_eq!(
            WriteResponse::from_tlv(&response.to_tlv()).expect("decode"),
            response
        );
    }
}
