use crate::types::LogRecord;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Key used by [`Grouper::AllDependent`].
pub const ALL_DEPENDENT_KEY: &str = "all";

/// Records grouped under their key. Iteration order is stable across calls.
pub type Groups = BTreeMap<String, Vec<Arc<LogRecord>>>;

/// How records are split into groups that are parsed sequentially.
///
/// Records in one group are parsed one at a time in input order; distinct
/// groups may run in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouper {
    /// Every record depends on the ones before it.
    AllDependent,
    /// No record depends on any other.
    AllIndependent,
    /// Records sharing the value of the dotted field path are dependent.
    /// Records without the field land in the `""` group.
    ByField(String),
}

impl Grouper {
    pub fn by_field(path: impl Into<String>) -> Self {
        Grouper::ByField(path.into())
    }

    pub fn group(&self, records: &[Arc<LogRecord>]) -> Groups {
        let mut groups = Groups::new();
        for record in records {
            groups
                .entry(self.key_of(record))
                .or_default()
                .push(record.clone());
        }
        groups
    }

    fn key_of(&self, record: &LogRecord) -> String {
        match self {
            Grouper::AllDependent => ALL_DEPENDENT_KEY.to_string(),
            Grouper::AllIndependent => format!("#{}", record.index),
            Grouper::ByField(path) => record.field(path).unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for Grouper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grouper::AllDependent => f.write_str("all-dependent"),
            Grouper::AllIndependent => f.write_str("all-independent"),
            Grouper::ByField(path) => write!(f, "by-field({})", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    fn records_with_nodes(nodes: &[Option<&str>]) -> Vec<Arc<LogRecord>> {
        nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let fields = match node {
                    Some(n) => json!({"node": n}),
                    None => json!({}),
                };
                Arc::new(LogRecord {
                    index,
                    id: format!("log-{}", index),
                    timestamp: Utc::now(),
                    fields,
                    body: String::new(),
                })
            })
            .collect()
    }

    fn indices(records: &[Arc<LogRecord>]) -> Vec<usize> {
        records.iter().map(|r| r.index).collect()
    }

    #[test]
    fn test_empty_input_has_no_groups() {
        for grouper in [
            Grouper::AllDependent,
            Grouper::AllIndependent,
            Grouper::by_field("node"),
        ] {
            assert!(grouper.group(&[]).is_empty(), "{}", grouper);
        }
    }

    #[test]
    fn test_all_dependent_single_group() {
        let records = records_with_nodes(&[Some("a"), Some("b"), None]);
        let groups = Grouper::AllDependent.group(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(indices(&groups[ALL_DEPENDENT_KEY]), vec![0, 1, 2]);
    }

    #[test]
    fn test_by_field_missing_field_goes_to_empty_group() {
        let records = records_with_nodes(&[Some("a"), None, Some("b"), Some("a"), None]);
        let groups = Grouper::by_field("node").group(&records);
        assert_eq!(groups.len(), 3);
        assert_eq!(indices(&groups["a"]), vec![0, 3]);
        assert_eq!(indices(&groups["b"]), vec![2]);
        assert_eq!(indices(&groups[""]), vec![1, 4]);
    }

    fn arbitrary_nodes() -> impl Strategy<Value = Vec<Option<String>>> {
        prop::collection::vec(
            prop::option::of(prop::sample::select(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
            ])),
            0..64,
        )
    }

    fn arbitrary_grouper() -> impl Strategy<Value = Grouper> {
        prop_oneof![
            Just(Grouper::AllDependent),
            Just(Grouper::AllIndependent),
            Just(Grouper::by_field("node")),
        ]
    }

    proptest! {
        #[test]
        fn prop_groups_partition_input(nodes in arbitrary_nodes(), grouper in arbitrary_grouper()) {
            let nodes: Vec<Option<&str>> = nodes.iter().map(|n| n.as_deref()).collect();
            let records = records_with_nodes(&nodes);
            let groups = grouper.group(&records);

            let mut seen: Vec<usize> = groups.values().flat_map(|g| indices(g)).collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, indices(&records));
            prop_assert!(groups.values().all(|g| !g.is_empty()));
        }

        #[test]
        fn prop_by_field_preserves_order(nodes in arbitrary_nodes()) {
            let nodes: Vec<Option<&str>> = nodes.iter().map(|n| n.as_deref()).collect();
            let records = records_with_nodes(&nodes);
            let groups = Grouper::by_field("node").group(&records);

            for (key, group) in &groups {
                let idx = indices(group);
                prop_assert!(idx.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(group.iter().all(|r| r.field("node").unwrap_or_default() == *key));
            }
        }

        #[test]
        fn prop_all_independent_one_group_per_record(nodes in arbitrary_nodes()) {
            let nodes: Vec<Option<&str>> = nodes.iter().map(|n| n.as_deref()).collect();
            let records = records_with_nodes(&nodes);
            prop_assert_eq!(Grouper::AllIndependent.group(&records).len(), records.len());
        }
    }
}
