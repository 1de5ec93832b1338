//! Table filter. Key-range filtering is enforced by the upstream; this
//! only filters by table name, parsed out of the `/* _stream ... */`
//! comment embedded in each DML statement.

use crate::state_machine::{BinlogData, SqlType};

const STREAM_MARKER: &str = "/* _stream ";

#[derive(Debug, Clone, Default)]
pub struct Filter {
    tables: Vec<String>,
}

impl Filter {
    pub fn new(tables: Vec<String>) -> Self {
        Filter { tables }
    }

    /// Whether this DML event applies to this consumer. Non-DML events
    /// should not be passed in; callers gate on `sql_type` beforehand.
    pub fn matches(&self, data: &BinlogData) -> bool {
        if self.tables.is_empty() {
            return true;
        }
        debug_assert_eq!(data.sql_type, Some(SqlType::Dml));

        data.sql.iter().any(|sql| self.matches_one(sql))
    }

    fn matches_one(&self, sql: &str) -> bool {
        let keyword = sql.split_whitespace().next().unwrap_or("").to_lowercase();
        if !matches!(keyword.as_str(), "insert" | "update" | "delete") {
            return false;
        }

        let Some(marker_pos) = sql.find(STREAM_MARKER) else {
            // Conservative reject: a recognized DML with no stream comment
            // never matches.
            return false;
        };

        let rest = &sql[marker_pos + STREAM_MARKER.len()..];
        let table = rest.split_whitespace().next().unwrap_or("");
        self.tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dml(sqls: &[&str]) -> BinlogData {
        BinlogData {
            sql_type: Some(SqlType::Dml),
            sql: sqls.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_table_list_matches_everything() {
        let f = Filter::new(vec![]);
        assert!(f.matches(&dml(&["insert into anything values (1)"])));
    }

    #[test]
    fn matches_configured_table_via_stream_comment() {
        let f = Filter::new(vec!["t".to_string()]);
        let d = dml(&["insert into t values (1) /* _stream t (id ) (1 ); */"]);
        assert!(f.matches(&d));
    }

    #[test]
    fn rejects_other_table() {
        let f = Filter::new(vec!["t".to_string()]);
        let d = dml(&["insert into u values (1) /* _stream u (id ) (1 ); */"]);
        assert!(!f.matches(&d));
    }

    #[test]
    fn rejects_statement_without_stream_comment() {
        let f = Filter::new(vec!["t".to_string()]);
        let d = dml(&["insert into t values (1)"]);
        assert!(!f.matches(&d));
    }

    #[test]
    fn ignores_non_dml_verbs() {
        let f = Filter::new(vec!["t".to_string()]);
        let d = dml(&["set @x = 1"]);
        assert!(!f.matches(&d));
    }

    #[test]
    fn idempotent_under_reordering_when_at_most_one_matches() {
        let f = Filter::new(vec!["t".to_string()]);
        let a = dml(&[
            "insert into u values (1) /* _stream u (id ) (1 ); */",
            "insert into t values (2) /* _stream t (id ) (2 ); */",
        ]);
        let b = dml(&[
            "insert into t values (2) /* _stream t (id ) (2 ); */",
            "insert into u values (1) /* _stream u (id ) (1 ); */",
        ]);
        assert_eq!(f.matches(&a), f.matches(&b));
    }
}
