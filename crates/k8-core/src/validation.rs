//! System-wide self-check.
//!
//! Re-runs every attached component's self-check against the live graph
//! and reports bits that are reachable through more than one Bridge link,
//! where last-writer-wins ordering decides the value.

use crate::graph::PATH_SEPARATOR;
use crate::runtime::{Runtime, RuntimeContext};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Self-check errors of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentIssue {
    pub path: String,
    pub errors: Vec<String>,
}

/// A bit bridged more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HazardReport {
    /// `<component path>/<terminal>`.
    pub terminal: String,
    pub bit: u32,
    pub links: Vec<String>,
}

/// Aggregated result of [`check_system`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfCheckReport {
    pub components: Vec<ComponentIssue>,
    pub hazards: Vec<HazardReport>,
}

impl SelfCheckReport {
    /// No component reported errors. Hazards are warnings only.
    pub fn is_success(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.components.is_empty() && self.hazards.is_empty()
    }

    /// All component errors, prefixed with their path.
    pub fn errors(&self) -> Vec<String> {
        self.components
            .iter()
            .flat_map(|c| c.errors.iter().map(move |e| format!("{}: {e}", c.path)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

/// Check every attached component, in attach order.
pub fn check_system(rt: &Runtime) -> SelfCheckReport {
    let graph = rt.graph();
    let mut report = SelfCheckReport::default();

    let order = graph.root().map(|r| graph.descendants(r)).unwrap_or_default();
    for node in order {
        let (Some(n), Some(path)) = (graph.get(node), graph.path(node)) else {
            continue;
        };
        let type_name = rt
            .catalog()
            .get(n.descriptor().type_key)
            .map(|t| t.type_name.as_str())
            .unwrap_or("");
        let ctx = RuntimeContext::new(rt.catalog(), rt.registry(), graph, path, type_name);
        let result = n.instance().self_check(&ctx);
        if result.has_errors() {
            report.components.push(ComponentIssue {
                path: path.to_string(),
                errors: result.into_errors(),
            });
        }
    }

    for hazard in rt.linker().bridge_hazards() {
        let terminal = rt
            .terminals()
            .get(hazard.terminal)
            .map(|t| {
                let owner = graph.path(t.owner).unwrap_or("?");
                format!("{owner}{PATH_SEPARATOR}{}", t.name)
            })
            .unwrap_or_else(|| format!("{:?}", hazard.terminal));
        report.hazards.push(HazardReport {
            terminal,
            bit: hazard.bit,
            links: hazard.links,
        });
    }

    if !report.is_clean() {
        tracing::warn!(
            components = report.components.len(),
            hazards = report.hazards.len(),
            "self-check found problems"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMask;
    use crate::metadata::LinkType;
    use crate::round::SchedulerConfig;
    use crate::test_utils::{Probe, board_catalog};
    use std::sync::Arc;

    #[test]
    fn healthy_board_is_clean() {
        let mut rt = Runtime::new(Arc::new(board_catalog()), SchedulerConfig::default());
        rt.load_root("pair").unwrap();
        let report = check_system(&rt);
        assert!(report.is_clean());
        assert!(report.errors().is_empty());
    }

    #[test]
    fn component_turning_unhealthy_is_reported() {
        let mut rt = Runtime::new(Arc::new(board_catalog()), SchedulerConfig::default());
        rt.load_root("pair").unwrap();
        let b = rt.graph().resolve_path("~/b").unwrap();
        rt.graph_mut().component_mut::<Probe>(b).unwrap().broken = true;

        let report = check_system(&rt);
        assert!(!report.is_success());
        assert_eq!(report.components[0].path, "~/b");
        assert!(report.errors()[0].starts_with("~/b: "));
    }

    #[test]
    fn double_bridge_is_a_hazard() {
        let mut rt = Runtime::new(Arc::new(board_catalog()), SchedulerConfig::default());
        rt.load_root("pair").unwrap();
        let a = rt.terminal_at("~/a", "out").unwrap();
        let b = rt.terminal_at("~/b", "in").unwrap();
        rt.link("again", (a, Some(BusMask::bit(0))), (b, Some(BusMask::bit(0))), LinkType::Bridge)
            .unwrap();

        let report = check_system(&rt);
        assert!(report.is_success());
        assert!(!report.is_clean());
        assert!(report.hazards.iter().any(|h| h.terminal == "~/a/out" && h.bit == 0));
    }
}
