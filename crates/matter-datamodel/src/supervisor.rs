//! 监督层编译：集群元数据装载时的逐元素计划。
//!
//! # 编译产物（What）
//! 对每个适用元素产出：默认值（含“已知默认”缓存）、访问控制判定、
//! 校验器与规范化器。校验失败的归因固定为四类：*path not found*、
//! *invalid data type*、*out of range*、*constraint*。
//!
//! # 已知默认缓存（How）
//! feature 切换会让继承的属性在派生集群里失效；其默认值被抹除但进入
//! `known_defaults`，之后重新启用该 feature 的再编译可以原样恢复。

use crate::schema::{AttributeSchema, ClusterSchema, Privilege, ValueKind};
use matter_codec_tlv::TlvValue;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{AttributeId, ClusterId, FabricIndex};
use std::collections::{BTreeMap, HashMap};

/// 一次访问的主体描述（由会话层解析得出）。
#[derive(Clone, Copy, Debug)]
pub struct AccessSubject {
    pub privilege: Privilege,
    pub fabric_index: Option<FabricIndex>,
}

impl AccessSubject {
    /// 管理员主体（本地/测试通道）。
    pub fn administer(fabric_index: Option<FabricIndex>) -> Self {
        Self {
            privilege: Privilege::Administer,
            fabric_index,
        }
    }
}

/// 单个属性的编译产物。
#[derive(Clone, Debug)]
pub struct CompiledAttribute {
    pub schema: AttributeSchema,
    pub default: Option<TlvValue>,
}

/// 一个 `(集群, feature 集)` 的编译计划。
#[derive(Clone, Debug)]
pub struct ClusterPlan {
    pub schema: ClusterSchema,
    pub feature_map: u32,
    attributes: BTreeMap<u32, CompiledAttribute>,
    known_defaults: HashMap<u32, TlvValue>,
}

impl ClusterPlan {
    /// 按 feature-map 展开 conformance 并编译。
    pub fn compile(schema: ClusterSchema, feature_map: u32) -> Self {
        let mut attributes = BTreeMap::new();
        let mut known_defaults = HashMap::new();
        for attr in &schema.attributes {
            if attr.conformance.applies(feature_map) {
                attributes.insert(
                    attr.id.raw(),
                    CompiledAttribute {
                        schema: attr.clone(),
                        default: attr.default.clone(),
                    },
                );
            } else if let Some(default) = &attr.default {
                // 不适用的属性默认值被抹除，但缓存供重新启用时恢复。
                known_defaults.insert(attr.id.raw(), default.clone());
            }
        }
        Self {
            schema,
            feature_map,
            attributes,
            known_defaults,
        }
    }

    /// 以新的 feature-map 重新编译；已知默认恢复给重新适用的属性。
    pub fn recompile(&self, feature_map: u32) -> Self {
        let mut next = Self::compile(self.schema.clone(), feature_map);
        for (id, attribute) in next.attributes.iter_mut() {
            if attribute.default.is_none() {
                if let Some(cached) = self.known_defaults.get(id) {
                    attribute.default = Some(cached.clone());
                }
            }
        }
        next
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.schema.id
    }

    /// 当前适用的属性集合。
    pub fn attributes(&self) -> impl Iterator<Item = &CompiledAttribute> {
        self.attributes.values()
    }

    pub fn attribute(&self, id: AttributeId) -> Option<&CompiledAttribute> {
        self.attributes.get(&id.raw())
    }

    /// 读访问判定。
    pub fn check_read(&self, id: AttributeId, subject: &AccessSubject) -> Result<()> {
        let attribute = self.require(id)?;
        if subject.privilege < attribute.schema.access.read {
            return Err(access_denied(id, "read"));
        }
        Ok(())
    }

    /// 写访问判定（含 fabric-scoped 匹配）。
    pub fn check_write(
        &self,
        id: AttributeId,
        subject: &AccessSubject,
        target_fabric: Option<FabricIndex>,
    ) -> Result<()> {
        let attribute = self.require(id)?;
        let Some(required) = attribute.schema.access.write else {
            return Err(MatterError::data_model(
                codes::ACCESS_DENIED,
                format!("{id} is read-only"),
            ));
        };
        if subject.privilege < required {
            return Err(access_denied(id, "write"));
        }
        if attribute.schema.quality.fabric_scoped
            && target_fabric.is_some()
            && subject.fabric_index != target_fabric
        {
            return Err(MatterError::data_model(
                codes::ACCESS_DENIED,
                format!("{id} is fabric-scoped to another fabric"),
            ));
        }
        if attribute.schema.quality.fixed {
            return Err(MatterError::data_model(
                codes::ACCESS_DENIED,
                format!("{id} is fixed"),
            ));
        }
        Ok(())
    }

    /// 校验并规范化候选值。
    ///
    /// # 契约说明（What）
    /// - nullable 数值的边界哨兵（无符号最大/有符号最小）规范化为
    ///   `Null`；
    /// - 返回的值即应写入 datasource 的形态。
    pub fn validate(&self, id: AttributeId, value: &TlvValue) -> Result<TlvValue> {
        let attribute = self.require(id)?;
        let schema = &attribute.schema;

        if value.is_null() {
            return if schema.quality.nullable {
                Ok(TlvValue::Null)
            } else {
                Err(MatterError::data_model(
                    codes::CONSTRAINT,
                    format!("{id} is not nullable"),
                ))
            };
        }

        match schema.kind {
            ValueKind::Bool => match value {
                TlvValue::Bool(_) => Ok(value.clone()),
                _ => Err(wrong_type(id, "bool", value)),
            },
            ValueKind::Unsigned { bits } => {
                let raw = value
                    .as_u64()
                    .ok_or_else(|| wrong_type(id, "unsigned", value))?;
                let type_max = ValueKind::unsigned_max(bits);
                if raw > type_max {
                    return Err(out_of_range(id, raw as i128));
                }
                if schema.quality.nullable && raw == type_max {
                    return Ok(TlvValue::Null);
                }
                check_constraint(id, raw as i64, schema)?;
                Ok(value.clone())
            }
            ValueKind::Signed { bits } => {
                let raw = value
                    .as_i64()
                    .ok_or_else(|| wrong_type(id, "signed", value))?;
                if raw < ValueKind::signed_min(bits) || raw > ValueKind::signed_max(bits) {
                    return Err(out_of_range(id, raw as i128));
                }
                if schema.quality.nullable && raw == ValueKind::signed_min(bits) {
                    return Ok(TlvValue::Null);
                }
                check_constraint(id, raw, schema)?;
                Ok(value.clone())
            }
            ValueKind::Utf8 { max_len } => {
                let text = value.as_str().ok_or_else(|| wrong_type(id, "utf8", value))?;
                if text.len() > max_len as usize {
                    return Err(MatterError::data_model(
                        codes::CONSTRAINT,
                        format!("{id} exceeds max length {max_len}"),
                    ));
                }
                Ok(value.clone())
            }
            ValueKind::Bytes { max_len } => {
                let bytes = value
                    .as_bytes()
                    .ok_or_else(|| wrong_type(id, "bytes", value))?;
                if bytes.len() > max_len as usize {
                    return Err(MatterError::data_model(
                        codes::CONSTRAINT,
                        format!("{id} exceeds max length {max_len}"),
                    ));
                }
                Ok(value.clone())
            }
            ValueKind::Structure => match value {
                TlvValue::Structure(_) => Ok(value.clone()),
                _ => Err(wrong_type(id, "structure", value)),
            },
            ValueKind::Array => match value {
                TlvValue::Array(_) => Ok(value.clone()),
                _ => Err(wrong_type(id, "array", value)),
            },
        }
    }

    fn require(&self, id: AttributeId) -> Result<&CompiledAttribute> {
        self.attributes.get(&id.raw()).ok_or_else(|| {
            MatterError::data_model(
                codes::PATH_NOT_FOUND,
                format!("{} has no {id}", self.schema.id),
            )
        })
    }
}

fn check_constraint(id: AttributeId, raw: i64, schema: &AttributeSchema) -> Result<()> {
    if let Some(min) = schema.constraint.min {
        if raw < min {
            return Err(MatterError::data_model(
                codes::CONSTRAINT,
                format!("{id} below constraint min {min}"),
            ));
        }
    }
    if let Some(max) = schema.constraint.max {
        if raw > max {
            return Err(MatterError::data_model(
                codes::CONSTRAINT,
                format!("{id} above constraint max {max}"),
            ));
        }
    }
    Ok(())
}

fn access_denied(id: AttributeId, op: &str) -> MatterError {
    MatterError::data_model(
        codes::ACCESS_DENIED,
        format!("insufficient privilege to {op} {id}"),
    )
}

fn wrong_type(id: AttributeId, expected: &str, got: &TlvValue) -> MatterError {
    MatterError::data_model(
        codes::INVALID_DATA_TYPE,
        format!("{id} expects {expected}, got {}", got.type_name()),
    )
}

fn out_of_range(id: AttributeId, raw: i128) -> MatterError {
    MatterError::data_model(
        codes::OUT_OF_RANGE,
        format!("{id} value {raw} outside type bounds"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeAccess, Conformance, Constraint, Quality};

    fn test_cluster() -> ClusterSchema {
        ClusterSchema {
            id: ClusterId(0x1234),
            name: "TestCluster",
            revision: 1,
            attributes: vec![
                AttributeSchema {
                    id: AttributeId(0),
                    name: "level",
                    kind: ValueKind::Unsigned { bits: 8 },
                    conformance: Conformance::Mandatory,
                    quality: Quality {
                        nullable: true,
                        ..Quality::none()
                    },
                    access: AttributeAccess::RW_OPERATE,
                    constraint: Constraint {
                        min: Some(1),
                        max: Some(200),
                    },
                    default: Some(TlvValue::UnsignedInt(1)),
                },
                AttributeSchema {
                    id: AttributeId(1),
                    name: "featureBound",
                    kind: ValueKind::Bool,
                    conformance: Conformance::Feature {
                        bit: 0,
                        when_set: true,
                    },
                    quality: Quality::none(),
                    access: AttributeAccess::RW_OPERATE,
                    constraint: Constraint::default(),
                    default: Some(TlvValue::Bool(true)),
                },
            ],
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn nullable_boundary_normalizes_to_null() {
        let plan = ClusterPlan::compile(test_cluster(), 0);
        let normalized = plan
            .validate(AttributeId(0), &TlvValue::UnsignedInt(0xff))
            .expect("boundary accepted");
        assert!(normalized.is_null());
    }

    #[test]
    fn constraint_and_range_errors_are_distinct() {
        let plan = ClusterPlan::compile(test_cluster(), 0);
        let err = plan
            .validate(AttributeId(0), &TlvValue::UnsignedInt(0))
            .expect_err("below constraint");
        assert_eq!(err.code(), codes::CONSTRAINT);

        let err = plan
            .validate(AttributeId(0), &TlvValue::UnsignedInt(0x100))
            .expect_err("above type bound");
        assert_eq!(err.code(), codes::OUT_OF_RANGE);

        let err = plan
            .validate(AttributeId(0), &TlvValue::Bool(true))
            .expect_err("wrong type");
        assert_eq!(err.code(), codes::INVALID_DATA_TYPE);

        let err = plan
            .validate(AttributeId(9), &TlvValue::Bool(true))
            .expect_err("unknown attribute");
        assert_eq!(err.code(), codes::PATH_NOT_FOUND);
    }

    #[test]
    fn known_defaults_survive_feature_toggles() {
        let plan = ClusterPlan::compile(test_cluster(), 0);
        assert!(plan.attribute(AttributeId(1)).is_none());

        let enabled = plan.recompile(0b1);
        let restored = enabled.attribute(AttributeId(1)).expect("re-enabled");
        assert_eq!(restored.default, Some(TlvValue::Bool(true)));
    }

    #[test]
    fn write_access_enforces_privilege_and_fixed() {
        let plan = ClusterPlan::compile(test_cluster(), 0);
        let viewer = AccessSubject {
            privilege: Privilege::View,
            fabric_index: None,
        };
        assert!(plan.check_write(AttributeId(0), &viewer, None).is_err());

        let operator = AccessSubject {
            privilege: Privilege::Operate,
            fabric_index: None,
        };
        plan.check_write(AttributeId(0), &operator, None)
            .expect("operate may write");
    }
}
