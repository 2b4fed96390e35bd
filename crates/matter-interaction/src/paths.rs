//! 路径展开：wildcard 解析与逐路径准入。
//!
//! # 语义（What）
//! - wildcard 分量展开为全部匹配元素；越权或不可读的元素**静默跳过**；
//! - 具体路径的失败要逐路径回状态：`UnsupportedEndpoint` /
//!   `UnsupportedCluster` / `UnsupportedAttribute` / `UnsupportedAccess`。

use crate::messages::{AttributePath, AttributeStatus, EventPath};
use matter_core::status::Status;
use matter_datamodel::supervisor::AccessSubject;
use matter_datamodel::{Behavior, Endpoint};
use matter_core::types::AttributeId;
use std::sync::Arc;

/// 展开后的一个可读属性。
pub struct ResolvedAttribute {
    pub path: AttributePath,
    pub behavior: Arc<Behavior>,
    pub attribute: AttributeId,
}

/// 展开属性路径集合。
pub fn expand_attribute_paths(
    root: &Arc<Endpoint>,
    paths: &[AttributePath],
    subject: &AccessSubject,
) -> (Vec<ResolvedAttribute>, Vec<AttributeStatus>) {
    let mut resolved = Vec::new();
    let mut errors = Vec::new();

    for path in paths {
        let wildcard = path.is_wildcard();
        let endpoints: Vec<Arc<Endpoint>> = match path.endpoint {
            Some(number) => match root.find(number) {
                Some(endpoint) => vec![endpoint],
                None => {
                    if !wildcard {
                        errors.push(AttributeStatus {
                            path: *path,
                            status: Status::UnsupportedEndpoint,
                        });
                    }
                    continue;
                }
            },
            None => root.walk(),
        };

        let mut matched_any = false;
        for endpoint in endpoints {
            let behaviors: Vec<Arc<Behavior>> = match path.cluster {
                Some(cluster) => match endpoint.behavior(cluster) {
                    Some(behavior) => vec![behavior],
                    None => continue,
                },
                None => endpoint.behaviors(),
            };
            for behavior in behaviors {
                let attributes: Vec<AttributeId> = match path.attribute {
                    Some(id) => vec![id],
                    None => behavior
                        .datasource()
                        .plan()
                        .attributes()
                        .map(|attr| attr.schema.id)
                        .collect(),
                };
                for attribute in attributes {
                    match behavior.datasource().plan().check_read(attribute, subject) {
                        Ok(()) => {
                            matched_any = true;
                            resolved.push(ResolvedAttribute {
                                path: AttributePath::concrete(
                                    endpoint.number(),
                                    behavior.cluster_id(),
                                    attribute,
                                ),
                                behavior: Arc::clone(&behavior),
                                attribute,
                            });
                        }
                        Err(err) if !wildcard => {
                            errors.push(AttributeStatus {
                                path: *path,
                                status: Status::from(&err),
                            });
                            matched_any = true;
                        }
                        Err(_) => {}
                    }
                }
            }
        }

        if !wildcard && !matched_any {
            errors.push(AttributeStatus {
                path: *path,
                status: match path.cluster {
                    Some(cluster)
                        if path
                            .endpoint
                            .and_then(|n| root.find(n))
                            .map(|e| e.behavior(cluster).is_none())
                            .unwrap_or(false) =>
                    {
                        Status::UnsupportedCluster
                    }
                    _ => Status::UnsupportedAttribute,
                },
            });
        }
    }
    (resolved, errors)
}

/// 事件路径是否匹配一条事件记录的位置。
pub fn event_path_matches(
    path: &EventPath,
    endpoint: matter_core::types::EndpointNumber,
    cluster: matter_core::types::ClusterId,
    event: matter_core::types::EventId,
) -> bool {
    path.endpoint.map_or(true, |e| e == endpoint)
        && path.cluster.map_or(true, |c| c == cluster)
        && path.event.map_or(true, |id| id == event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_datamodel::clusters;
    use matter_datamodel::supervisor::ClusterPlan;
    use matter_datamodel::transaction::Datasource;
    use matter_core::types::{ClusterId, EndpointNumber};

    fn tree() -> Arc<Endpoint> {
        let root = Endpoint::new(EndpointNumber(0), "root", Vec::new());
        let basic = Behavior::new(
            Datasource::new(
                EndpointNumber(0),
                Arc::new(ClusterPlan::compile(clusters::basic_information(), 0)),
                None,
            ),
            false,
        );
        root.add_behavior(basic);

        let light = Endpoint::new(EndpointNumber(1), "light", Vec::new());
        let on_off = Behavior::new(
            Datasource::new(
                EndpointNumber(1),
                Arc::new(ClusterPlan::compile(clusters::on_off(), 0)),
                None,
            ),
            false,
        );
        light.add_behavior(on_off);
        root.add_child(light);
        root
    }

    #[test]
    fn full_wildcard_reaches_every_attribute() {
        let root = tree();
        let subject = AccessSubject::administer(None);
        let (resolved, errors) =
            expand_attribute_paths(&root, &[AttributePath::default()], &subject);
        assert!(errors.is_empty());
        // BasicInformation 7 个属性 + OnOff 3 个。
        assert_eq!(resolved.len(), 10);
    }

    #[test]
    fn cluster_wildcard_scopes_to_endpoint() {
        let root = tree();
        let subject = AccessSubject::administer(None);
        let (resolved, errors) = expand_attribute_paths(
            &root,
            &[AttributePath {
                endpoint: Some(EndpointNumber(1)),
                cluster: Some(ClusterId(0x0006)),
                attribute: None,
            }],
            &subject,
        );
        assert!(errors.is_empty());
        assert_eq!(resolved.len(), 3);
        assert!(resolved.iter().all(|r| r.path.endpoint == Some(EndpointNumber(1))));
    }

    #[test]
    fn concrete_misses_produce_path_statuses() {
        let root = tree();
        let subject = AccessSubject::administer(None);
        let (resolved, errors) = expand_attribute_paths(
            &root,
            &[
                AttributePath::concrete(
                    EndpointNumber(9),
                    ClusterId(0x0006),
                    matter_core::types::AttributeId(0),
                ),
                AttributePath::concrete(
                    EndpointNumber(1),
                    ClusterId(0x0050),
                    matter_core::types::AttributeId(0),
                ),
            ],
            &subject,
        );
        assert!(resolved.is_empty());
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].status, Status::UnsupportedEndpoint);
        assert_eq!(errors[1].status, Status::UnsupportedCluster);
    }
}
