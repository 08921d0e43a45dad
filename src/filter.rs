use crate::model::OsKind;
use crate::tree::{Node, NodePayload};

/// Display filter over instance leaves. Project and zone nodes always pass
/// through; parents stay visible even when every leaf under them is hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    pub show_windows: bool,
    pub show_linux: bool,
    pub name_pattern: String,
}

impl Default for InstanceFilter {
    fn default() -> Self {
        Self {
            show_windows: true,
            show_linux: true,
            name_pattern: String::new(),
        }
    }
}

impl InstanceFilter {
    pub fn is_unrestricted(&self) -> bool {
        self.show_windows && self.show_linux && self.name_pattern.trim().is_empty()
    }

    pub fn matches(&self, os: OsKind, name: &str) -> bool {
        let os_allowed = match os {
            OsKind::Windows => self.show_windows,
            OsKind::Linux => self.show_linux,
        };
        if !os_allowed {
            return false;
        }

        let pattern = self.name_pattern.trim();
        if pattern.is_empty() {
            return true;
        }
        name.to_ascii_lowercase()
            .contains(&pattern.to_ascii_lowercase())
    }

    pub fn summary(&self) -> String {
        let os = match (self.show_windows, self.show_linux) {
            (true, true) => "all",
            (true, false) => "windows",
            (false, true) => "linux",
            (false, false) => "none",
        };
        let pattern = self.name_pattern.trim();
        if pattern.is_empty() {
            format!("os={os}")
        } else {
            format!("os={os} name~{pattern}")
        }
    }
}

/// Pure view transform from raw children to the filtered, ordered view.
/// Never performs I/O; ordering is whatever the loader established.
pub fn apply(children: &[Node], filter: &InstanceFilter) -> Vec<Node> {
    children
        .iter()
        .filter(|node| match node.payload() {
            NodePayload::Instance(detail) => filter.matches(detail.os, &detail.locator.name),
            _ => true,
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{InstanceFilter, apply};
    use crate::model::{InstanceStatus, OsKind, ProjectSummary, ZoneLocator};
    use crate::tree::Node;

    fn linux_only() -> InstanceFilter {
        InstanceFilter {
            show_windows: false,
            show_linux: true,
            name_pattern: String::new(),
        }
    }

    #[test]
    fn default_filter_is_unrestricted() {
        let filter = InstanceFilter::default();
        assert!(filter.is_unrestricted());
        assert!(filter.matches(OsKind::Windows, "anything"));
        assert!(filter.matches(OsKind::Linux, "anything"));
    }

    #[test]
    fn os_subset_hides_other_kind() {
        let filter = linux_only();
        assert!(filter.matches(OsKind::Linux, "web-1"));
        assert!(!filter.matches(OsKind::Windows, "web-1"));
    }

    #[test]
    fn name_pattern_is_case_insensitive_substring() {
        let filter = InstanceFilter {
            name_pattern: "WEB".to_string(),
            ..InstanceFilter::default()
        };
        assert!(filter.matches(OsKind::Linux, "frontend-web-3"));
        assert!(!filter.matches(OsKind::Linux, "db-1"));
    }

    #[test]
    fn blank_pattern_matches_everything() {
        let filter = InstanceFilter {
            name_pattern: "   ".to_string(),
            ..InstanceFilter::default()
        };
        assert!(filter.matches(OsKind::Windows, "anything"));
    }

    #[test]
    fn apply_filters_instances_only() {
        let zone = ZoneLocator::new("p", "us-central1-a");
        let children = vec![
            Node::project(ProjectSummary::accessible("p", "p")),
            Node::zone(zone.clone()),
            Node::instance(
                zone.clone(),
                "1".to_string(),
                "win-1".to_string(),
                OsKind::Windows,
                InstanceStatus::Running,
            ),
            Node::instance(
                zone,
                "2".to_string(),
                "lin-1".to_string(),
                OsKind::Linux,
                InstanceStatus::Running,
            ),
        ];

        let visible = apply(&children, &linux_only());
        let labels = visible
            .iter()
            .map(|node| node.display_text())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["p", "us-central1-a", "lin-1"]);

        let all = apply(&children, &InstanceFilter::default());
        assert_eq!(all.len(), 4);
    }
}
