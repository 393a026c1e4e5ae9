use serde::Serialize;
use std::collections::BTreeMap;

use crate::diff::change::{Change, ChangeCategory, ChangeKind, Severity};

/// Grouped view of a change list for reports and notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSummary {
    pub total: usize,
    pub by_category: BTreeMap<ChangeCategory, usize>,
    pub by_kind: BTreeMap<ChangeKind, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub critical: Vec<Change>,
    pub warnings: Vec<Change>,
}

impl ChangeSummary {
    pub fn from_changes(changes: &[Change]) -> Self {
        let mut s = ChangeSummary { total: changes.len(), ..Default::default() };
        for c in changes {
            *s.by_category.entry(c.category).or_default() += 1;
            *s.by_kind.entry(c.kind).or_default() += 1;
            *s.by_severity.entry(c.severity).or_default() += 1;
            match c.severity {
                Severity::Critical => s.critical.push(c.clone()),
                Severity::Warning => s.warnings.push(c.clone()),
                Severity::Info => {}
            }
        }
        s
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.by_severity.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::engine::diff;
    use crate::scan::snapshot::fixtures::*;
    use crate::utils::Criticality;

    #[test]
    fn groups_by_category_kind_and_severity() {
        let previous = snapshot(
            &["web-1", "db-1"],
            vec![
                service("nginx", "web-1", Criticality::Important),
                service("postgres", "db-1", Criticality::Critical),
            ],
        );
        let current = snapshot(&["web-1", "db-2"], vec![service("nginx", "web-1", Criticality::Important)]);
        let changes = diff(&current, Some(&previous), at(1)).unwrap();
        let summary = ChangeSummary::from_changes(&changes);

        assert_eq!(summary.total, 5);
        assert_eq!(summary.by_category[&ChangeCategory::Hosts], 2);
        assert_eq!(summary.by_category[&ChangeCategory::Services], 1);
        assert_eq!(summary.by_category[&ChangeCategory::Containers], 2);
        assert_eq!(summary.by_kind[&ChangeKind::ServiceRemoved], 1);
        assert_eq!(summary.by_severity[&Severity::Warning], 2);
        assert_eq!(summary.critical.len(), 1);
        assert_eq!(summary.critical[0].kind, ChangeKind::ServiceRemoved);
        assert_eq!(summary.warnings.len(), 2);
        assert_eq!(summary.highest_severity(), Some(Severity::Critical));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["by_severity"]["critical"], 1);
    }

    #[test]
    fn empty_list_has_empty_summary() {
        let summary = ChangeSummary::from_changes(&[]);
        assert!(summary.is_empty());
        assert_eq!(summary.highest_severity(), None);
    }
}
