//! Placement constraint expressions.
//!
//! Constraints are `<attribute><op><value>` strings on the task spec,
//! e.g. `node.labels.region==east` or `node.role!=manager`. Supported
//! attributes: `node.id`, `node.hostname`, `node.role`,
//! `node.labels.<key>`, `node.platform.os`, `node.platform.arch`.

use flotilla_store::{Node, NodeResources, Placement, TaskSpec};

use crate::error::{SchedulerError, SchedulerResult};
use crate::heap::NodeInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Ne,
}

/// One parsed constraint expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub attribute: String,
    pub op: ConstraintOp,
    pub value: String,
}

impl Constraint {
    /// Parse a single expression. `!=` is checked first since `==`
    /// would otherwise match its tail.
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let (attribute, op, value) = if let Some((lhs, rhs)) = expr.split_once("!=") {
            (lhs, ConstraintOp::Ne, rhs)
        } else if let Some((lhs, rhs)) = expr.split_once("==") {
            (lhs, ConstraintOp::Eq, rhs)
        } else {
            return Err(SchedulerError::InvalidConstraint(expr.to_string()));
        };

        let attribute = attribute.trim();
        let value = value.trim();
        if attribute.is_empty() || value.is_empty() {
            return Err(SchedulerError::InvalidConstraint(expr.to_string()));
        }

        Ok(Self {
            attribute: attribute.to_string(),
            op,
            value: value.to_string(),
        })
    }

    pub fn parse_all(exprs: &[String]) -> SchedulerResult<Vec<Self>> {
        exprs.iter().map(|e| Self::parse(e)).collect()
    }

    /// Evaluate against a node. An attribute the node does not carry
    /// satisfies only `!=`.
    pub fn matches(&self, node: &Node) -> bool {
        let actual: Option<String> = match self.attribute.as_str() {
            "node.id" => Some(node.id.clone()),
            "node.hostname" => node.description.as_ref().map(|d| d.hostname.clone()),
            "node.role" => Some(node.role.as_str().to_string()),
            "node.platform.os" => node.description.as_ref().map(|d| d.platform.os.clone()),
            "node.platform.arch" => node
                .description
                .as_ref()
                .map(|d| d.platform.architecture.clone()),
            attr => attr
                .strip_prefix("node.labels.")
                .and_then(|key| node.spec.annotations.labels.get(key).cloned()),
        };

        match (self.op, actual) {
            (ConstraintOp::Eq, Some(actual)) => actual == self.value,
            (ConstraintOp::Eq, None) => false,
            (ConstraintOp::Ne, Some(actual)) => actual != self.value,
            (ConstraintOp::Ne, None) => true,
        }
    }
}

/// Full placement check: constraints, platform list, and resource fit.
pub fn node_fits(spec: &TaskSpec, constraints: &[Constraint], info: &NodeInfo) -> bool {
    if !constraints.iter().all(|c| c.matches(&info.node)) {
        return false;
    }
    if !platform_fits(&spec.placement, &info.node) {
        return false;
    }
    resources_fit(&spec.resources.reservations, &info.available())
}

fn platform_fits(placement: &Placement, node: &Node) -> bool {
    if placement.platforms.is_empty() {
        return true;
    }
    let Some(desc) = &node.description else {
        return false;
    };
    placement.platforms.iter().any(|p| {
        (p.os.is_empty() || p.os == desc.platform.os)
            && (p.architecture.is_empty() || p.architecture == desc.platform.architecture)
    })
}

fn resources_fit(reservations: &NodeResources, available: &NodeResources) -> bool {
    reservations.nano_cpus <= available.nano_cpus
        && reservations.memory_bytes <= available.memory_bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_store::{
        Meta, NodeCertificate, NodeDescription, NodeRole, NodeSpec, NodeStatus, Platform,
    };

    fn node(id: &str, role: NodeRole) -> Node {
        Node {
            id: id.into(),
            meta: Meta::default(),
            role,
            spec: NodeSpec::default(),
            description: Some(NodeDescription {
                hostname: format!("{id}.local"),
                platform: Platform {
                    architecture: "amd64".into(),
                    os: "linux".into(),
                },
                resources: NodeResources {
                    nano_cpus: 8_000_000_000,
                    memory_bytes: 16 << 30,
                },
                engine: Default::default(),
            }),
            status: NodeStatus::default(),
            certificate: NodeCertificate::default(),
            manager: None,
        }
    }

    #[test]
    fn parse_eq_and_ne() {
        let eq = Constraint::parse("node.labels.region==east").unwrap();
        assert_eq!(eq.op, ConstraintOp::Eq);
        assert_eq!(eq.attribute, "node.labels.region");
        assert_eq!(eq.value, "east");

        let ne = Constraint::parse("node.role != manager").unwrap();
        assert_eq!(ne.op, ConstraintOp::Ne);
        assert_eq!(ne.value, "manager");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Constraint::parse("node.role").is_err());
        assert!(Constraint::parse("==x").is_err());
        assert!(Constraint::parse("node.id==").is_err());
    }

    #[test]
    fn label_matching() {
        let mut n = node("n1", NodeRole::Worker);
        n.spec
            .annotations
            .labels
            .insert("region".into(), "east".into());

        assert!(Constraint::parse("node.labels.region==east")
            .unwrap()
            .matches(&n));
        assert!(!Constraint::parse("node.labels.region==west")
            .unwrap()
            .matches(&n));
        // Missing label: != is satisfied, == is not.
        assert!(Constraint::parse("node.labels.zone!=a").unwrap().matches(&n));
        assert!(!Constraint::parse("node.labels.zone==a").unwrap().matches(&n));
    }

    #[test]
    fn role_hostname_and_platform() {
        let n = node("n1", NodeRole::Worker);
        assert!(Constraint::parse("node.role==worker").unwrap().matches(&n));
        assert!(!Constraint::parse("node.role==manager").unwrap().matches(&n));
        assert!(Constraint::parse("node.hostname==n1.local")
            .unwrap()
            .matches(&n));
        assert!(Constraint::parse("node.platform.os==linux")
            .unwrap()
            .matches(&n));
        assert!(Constraint::parse("node.platform.arch!=arm64")
            .unwrap()
            .matches(&n));
    }

    #[test]
    fn resource_fit_rejects_oversized_reservation() {
        let n = node("n1", NodeRole::Worker);
        let info = NodeInfo::new(n);

        let mut spec = TaskSpec::default();
        spec.resources.reservations = NodeResources {
            nano_cpus: 4_000_000_000,
            memory_bytes: 8 << 30,
        };
        assert!(node_fits(&spec, &[], &info));

        spec.resources.reservations.memory_bytes = 32 << 30;
        assert!(!node_fits(&spec, &[], &info));
    }

    #[test]
    fn platform_list_must_intersect() {
        let n = node("n1", NodeRole::Worker);
        let info = NodeInfo::new(n);

        let mut spec = TaskSpec::default();
        spec.placement.platforms = vec![Platform {
            architecture: "arm64".into(),
            os: "linux".into(),
        }];
        assert!(!node_fits(&spec, &[], &info));

        spec.placement.platforms.push(Platform {
            architecture: String::new(),
            os: "linux".into(),
        });
        assert!(node_fits(&spec, &[], &info));
    }
}
