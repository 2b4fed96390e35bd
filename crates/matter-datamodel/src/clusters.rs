//! 标准集群的 schema 定义（规范生成库的工作区内置子集）。
//!
//! 这里只收录协议核心自身依赖的集群：根端点三件套（Descriptor、
//! BasicInformation、GeneralCommissioning、OperationalCredentials、
//! NetworkCommissioning）、演示负载 OnOff，以及带原子属性的
//! Thermostat 子集。其余集群由外部 schema 库按同样形态供给。

use crate::schema::{
    AttributeAccess, AttributeSchema, ClusterSchema, CommandSchema, Conformance, Constraint,
    EventSchema, Privilege, Quality, ValueKind,
};
use matter_codec_tlv::TlvValue;
use matter_core::types::{AttributeId, ClusterId, CommandId, EventId, EventPriority};

pub const ON_OFF: ClusterId = ClusterId(0x0006);
pub const DESCRIPTOR: ClusterId = ClusterId(0x001d);
pub const BASIC_INFORMATION: ClusterId = ClusterId(0x0028);
pub const GENERAL_COMMISSIONING: ClusterId = ClusterId(0x0030);
pub const NETWORK_COMMISSIONING: ClusterId = ClusterId(0x0031);
pub const OPERATIONAL_CREDENTIALS: ClusterId = ClusterId(0x003e);
pub const THERMOSTAT: ClusterId = ClusterId(0x0201);

/// OnOff 命令号。
pub mod on_off_commands {
    use matter_core::types::CommandId;
    pub const OFF: CommandId = CommandId(0x00);
    pub const ON: CommandId = CommandId(0x01);
    pub const TOGGLE: CommandId = CommandId(0x02);
}

/// GeneralCommissioning 命令号。
pub mod general_commissioning_commands {
    use matter_core::types::CommandId;
    pub const ARM_FAIL_SAFE: CommandId = CommandId(0x00);
    pub const ARM_FAIL_SAFE_RESPONSE: CommandId = CommandId(0x01);
    pub const SET_REGULATORY_CONFIG: CommandId = CommandId(0x02);
    pub const SET_REGULATORY_CONFIG_RESPONSE: CommandId = CommandId(0x03);
    pub const COMMISSIONING_COMPLETE: CommandId = CommandId(0x04);
    pub const COMMISSIONING_COMPLETE_RESPONSE: CommandId = CommandId(0x05);
}

/// OperationalCredentials 命令号。
pub mod operational_credentials_commands {
    use matter_core::types::CommandId;
    pub const CSR_REQUEST: CommandId = CommandId(0x04);
    pub const CSR_RESPONSE: CommandId = CommandId(0x05);
    pub const ADD_NOC: CommandId = CommandId(0x06);
    pub const UPDATE_NOC: CommandId = CommandId(0x07);
    pub const NOC_RESPONSE: CommandId = CommandId(0x08);
    pub const UPDATE_FABRIC_LABEL: CommandId = CommandId(0x09);
    pub const REMOVE_FABRIC: CommandId = CommandId(0x0a);
    pub const ADD_TRUSTED_ROOT_CERTIFICATE: CommandId = CommandId(0x0b);
}

/// Thermostat 原子写命令号与属性号。
pub mod thermostat_ids {
    use matter_core::types::{AttributeId, CommandId};
    pub const PRESETS: AttributeId = AttributeId(0x0050);
    pub const SCHEDULES: AttributeId = AttributeId(0x0051);
    pub const ATOMIC_REQUEST: CommandId = CommandId(0xfe);
    pub const ATOMIC_RESPONSE: CommandId = CommandId(0xfd);
}

fn attr(
    id: u32,
    name: &'static str,
    kind: ValueKind,
    access: AttributeAccess,
    default: Option<TlvValue>,
) -> AttributeSchema {
    AttributeSchema {
        id: AttributeId(id),
        name,
        kind,
        conformance: Conformance::Mandatory,
        quality: Quality::none(),
        access,
        constraint: Constraint::default(),
        default,
    }
}

/// OnOff 集群（0x0006）。
pub fn on_off() -> ClusterSchema {
    ClusterSchema {
        id: ON_OFF,
        name: "OnOff",
        revision: 6,
        attributes: vec![
            AttributeSchema {
                quality: Quality {
                    nonvolatile: true,
                    ..Quality::none()
                },
                ..attr(
                    0x0000,
                    "onOff",
                    ValueKind::Bool,
                    AttributeAccess::RO_VIEW,
                    Some(TlvValue::Bool(false)),
                )
            },
            attr(
                0x4000,
                "globalSceneControl",
                ValueKind::Bool,
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Bool(true)),
            ),
            AttributeSchema {
                quality: Quality {
                    nullable: true,
                    ..Quality::none()
                },
                ..attr(
                    0x4001,
                    "onTime",
                    ValueKind::Unsigned { bits: 16 },
                    AttributeAccess::RW_OPERATE,
                    Some(TlvValue::UnsignedInt(0)),
                )
            },
        ],
        commands: vec![
            CommandSchema {
                id: on_off_commands::OFF,
                name: "Off",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Operate,
                timed: false,
                response: None,
            },
            CommandSchema {
                id: on_off_commands::ON,
                name: "On",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Operate,
                timed: false,
                response: None,
            },
            CommandSchema {
                id: on_off_commands::TOGGLE,
                name: "Toggle",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Operate,
                timed: false,
                response: None,
            },
        ],
        events: Vec::new(),
    }
}

/// Descriptor 集群（0x001D）。
pub fn descriptor() -> ClusterSchema {
    ClusterSchema {
        id: DESCRIPTOR,
        name: "Descriptor",
        revision: 2,
        attributes: vec![
            attr(
                0x0000,
                "deviceTypeList",
                ValueKind::Array,
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Array(Vec::new())),
            ),
            attr(
                0x0001,
                "serverList",
                ValueKind::Array,
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Array(Vec::new())),
            ),
            attr(
                0x0002,
                "clientList",
                ValueKind::Array,
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Array(Vec::new())),
            ),
            attr(
                0x0003,
                "partsList",
                ValueKind::Array,
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Array(Vec::new())),
            ),
        ],
        commands: Vec::new(),
        events: Vec::new(),
    }
}

/// BasicInformation 集群（0x0028）。
pub fn basic_information() -> ClusterSchema {
    ClusterSchema {
        id: BASIC_INFORMATION,
        name: "BasicInformation",
        revision: 3,
        attributes: vec![
            attr(
                0x0001,
                "vendorName",
                ValueKind::Utf8 { max_len: 32 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Utf8(String::new())),
            ),
            attr(
                0x0002,
                "vendorId",
                ValueKind::Unsigned { bits: 16 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(0)),
            ),
            attr(
                0x0003,
                "productName",
                ValueKind::Utf8 { max_len: 32 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Utf8(String::new())),
            ),
            attr(
                0x0004,
                "productId",
                ValueKind::Unsigned { bits: 16 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(0)),
            ),
            AttributeSchema {
                quality: Quality {
                    nonvolatile: true,
                    ..Quality::none()
                },
                ..attr(
                    0x0005,
                    "nodeLabel",
                    ValueKind::Utf8 { max_len: 32 },
                    AttributeAccess::RW_MANAGE,
                    Some(TlvValue::Utf8(String::new())),
                )
            },
            attr(
                0x0009,
                "softwareVersion",
                ValueKind::Unsigned { bits: 32 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(1)),
            ),
            attr(
                0x000a,
                "softwareVersionString",
                ValueKind::Utf8 { max_len: 64 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Utf8("1.0".into())),
            ),
        ],
        commands: Vec::new(),
        events: vec![EventSchema {
            id: EventId(0x00),
            name: "StartUp",
            conformance: Conformance::Mandatory,
            priority: EventPriority::Critical,
            read: Privilege::View,
            fabric_scoped: false,
        }],
    }
}

/// GeneralCommissioning 集群（0x0030）。
pub fn general_commissioning() -> ClusterSchema {
    ClusterSchema {
        id: GENERAL_COMMISSIONING,
        name: "GeneralCommissioning",
        revision: 1,
        attributes: vec![
            AttributeSchema {
                quality: Quality {
                    nonvolatile: true,
                    ..Quality::none()
                },
                ..attr(
                    0x0000,
                    "breadcrumb",
                    ValueKind::Unsigned { bits: 64 },
                    AttributeAccess::RW_ADMIN,
                    Some(TlvValue::UnsignedInt(0)),
                )
            },
            attr(
                0x0001,
                "basicCommissioningInfo",
                ValueKind::Structure,
                AttributeAccess::RO_VIEW,
                Some(TlvValue::Structure(Vec::new())),
            ),
            attr(
                0x0002,
                "regulatoryConfig",
                ValueKind::Unsigned { bits: 8 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(0)),
            ),
            attr(
                0x0003,
                "locationCapability",
                ValueKind::Unsigned { bits: 8 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(2)),
            ),
        ],
        commands: vec![
            CommandSchema {
                id: general_commissioning_commands::ARM_FAIL_SAFE,
                name: "ArmFailSafe",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(general_commissioning_commands::ARM_FAIL_SAFE_RESPONSE),
            },
            CommandSchema {
                id: general_commissioning_commands::SET_REGULATORY_CONFIG,
                name: "SetRegulatoryConfig",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(general_commissioning_commands::SET_REGULATORY_CONFIG_RESPONSE),
            },
            CommandSchema {
                id: general_commissioning_commands::COMMISSIONING_COMPLETE,
                name: "CommissioningComplete",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(general_commissioning_commands::COMMISSIONING_COMPLETE_RESPONSE),
            },
        ],
        events: Vec::new(),
    }
}

/// NetworkCommissioning 集群（0x0031，最小面）。
pub fn network_commissioning() -> ClusterSchema {
    ClusterSchema {
        id: NETWORK_COMMISSIONING,
        name: "NetworkCommissioning",
        revision: 1,
        attributes: vec![
            attr(
                0x0000,
                "maxNetworks",
                ValueKind::Unsigned { bits: 8 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(1)),
            ),
            AttributeSchema {
                quality: Quality {
                    nonvolatile: true,
                    ..Quality::none()
                },
                ..attr(
                    0x0001,
                    "networks",
                    ValueKind::Array,
                    AttributeAccess::RW_ADMIN,
                    Some(TlvValue::Array(Vec::new())),
                )
            },
            attr(
                0x0004,
                "interfaceEnabled",
                ValueKind::Bool,
                AttributeAccess::RW_MANAGE,
                Some(TlvValue::Bool(true)),
            ),
        ],
        commands: Vec::new(),
        events: Vec::new(),
    }
}

/// OperationalCredentials 集群（0x003E）。
pub fn operational_credentials() -> ClusterSchema {
    ClusterSchema {
        id: OPERATIONAL_CREDENTIALS,
        name: "OperationalCredentials",
        revision: 1,
        attributes: vec![
            AttributeSchema {
                quality: Quality {
                    fabric_scoped: true,
                    ..Quality::none()
                },
                ..attr(
                    0x0001,
                    "fabrics",
                    ValueKind::Array,
                    AttributeAccess::RO_VIEW,
                    Some(TlvValue::Array(Vec::new())),
                )
            },
            attr(
                0x0002,
                "supportedFabrics",
                ValueKind::Unsigned { bits: 8 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(5)),
            ),
            attr(
                0x0003,
                "commissionedFabrics",
                ValueKind::Unsigned { bits: 8 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::UnsignedInt(0)),
            ),
        ],
        commands: vec![
            CommandSchema {
                id: operational_credentials_commands::CSR_REQUEST,
                name: "CSRRequest",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(operational_credentials_commands::CSR_RESPONSE),
            },
            CommandSchema {
                id: operational_credentials_commands::ADD_NOC,
                name: "AddNOC",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(operational_credentials_commands::NOC_RESPONSE),
            },
            CommandSchema {
                id: operational_credentials_commands::UPDATE_NOC,
                name: "UpdateNOC",
                conformance: Conformance::Optional,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(operational_credentials_commands::NOC_RESPONSE),
            },
            CommandSchema {
                id: operational_credentials_commands::UPDATE_FABRIC_LABEL,
                name: "UpdateFabricLabel",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(operational_credentials_commands::NOC_RESPONSE),
            },
            CommandSchema {
                id: operational_credentials_commands::REMOVE_FABRIC,
                name: "RemoveFabric",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: Some(operational_credentials_commands::NOC_RESPONSE),
            },
            CommandSchema {
                id: operational_credentials_commands::ADD_TRUSTED_ROOT_CERTIFICATE,
                name: "AddTrustedRootCertificate",
                conformance: Conformance::Mandatory,
                invoke: Privilege::Administer,
                timed: false,
                response: None,
            },
        ],
        events: Vec::new(),
    }
}

/// Thermostat 子集（0x0201）：携带原子属性的演示面。
pub fn thermostat() -> ClusterSchema {
    ClusterSchema {
        id: THERMOSTAT,
        name: "Thermostat",
        revision: 7,
        attributes: vec![
            attr(
                0x0000,
                "localTemperature",
                ValueKind::Signed { bits: 16 },
                AttributeAccess::RO_VIEW,
                Some(TlvValue::SignedInt(2000)),
            ),
            AttributeSchema {
                quality: Quality {
                    atomic: true,
                    nonvolatile: true,
                    ..Quality::none()
                },
                ..attr(
                    thermostat_ids::PRESETS.raw(),
                    "presets",
                    ValueKind::Array,
                    AttributeAccess::RW_MANAGE,
                    Some(TlvValue::Array(Vec::new())),
                )
            },
            AttributeSchema {
                quality: Quality {
                    atomic: true,
                    nonvolatile: true,
                    ..Quality::none()
                },
                ..attr(
                    thermostat_ids::SCHEDULES.raw(),
                    "schedules",
                    ValueKind::Array,
                    AttributeAccess::RW_MANAGE,
                    Some(TlvValue::Array(Vec::new())),
                )
            },
        ],
        commands: vec![CommandSchema {
            id: thermostat_ids::ATOMIC_REQUEST,
            name: "AtomicRequest",
            conformance: Conformance::Mandatory,
            invoke: Privilege::Manage,
            timed: true,
            response: Some(thermostat_ids::ATOMIC_RESPONSE),
        }],
        events: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ClusterPlan;

    #[test]
    fn standard_clusters_compile() {
        for schema in [
            on_off(),
            descriptor(),
            basic_information(),
            general_commissioning(),
            network_commissioning(),
            operational_credentials(),
            thermostat(),
        ] {
            let plan = ClusterPlan::compile(schema.clone(), 0);
            // 每个 mandatory 属性编译后都有默认值（激活后可读）。
            for attr in plan.attributes() {
                if attr.schema.conformance.is_mandatory() {
                    assert!(
                        attr.default.is_some(),
                        "{}::{} lacks a default",
                        schema.name,
                        attr.schema.name
                    );
                }
            }
        }
    }

    #[test]
    fn thermostat_marks_atomic_attributes() {
        let plan = ClusterPlan::compile(thermostat(), 0);
        assert!(
            plan.attribute(thermostat_ids::PRESETS)
                .expect("presets")
                .schema
                .quality
                .atomic
        );
        assert!(
            plan.attribute(thermostat_ids::SCHEDULES)
                .expect("schedules")
                .schema
                .quality
                .atomic
        );
    }
}
