use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CLAUSE_KEYWORDS: Regex = Regex::new(
        r"(?i)\s+\b(from|where|and|or|order\s+by|group\s+by|having|values|set|(?:left\s+outer\s+|right\s+outer\s+|inner\s+|cross\s+)?join)\b"
    )
    .unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

const INDENT: &str = "    ";

/// Channel every prepared statement is reported on.
///
/// Statements always go to the `session_jdbc::sql` log target at debug
/// level; `show_sql` additionally echoes them to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStatementLogger {
    show_sql: bool,
    format_sql: bool,
}

impl SqlStatementLogger {
    pub fn new(show_sql: bool, format_sql: bool) -> Self {
        Self {
            show_sql,
            format_sql,
        }
    }

    pub fn is_show_sql(&self) -> bool {
        self.show_sql
    }

    pub fn log_statement(&self, sql: &str) {
        if !self.show_sql && !log::log_enabled!(target: "session_jdbc::sql", log::Level::Debug) {
            return;
        }
        let statement = if self.format_sql {
            format_sql(sql)
        } else {
            sql.to_string()
        };
        log::debug!(target: "session_jdbc::sql", "{}", statement);
        if self.show_sql {
            println!("session_jdbc: {}", statement);
        }
    }
}

/// Break a statement onto one line per clause, leaving quoted literals alone.
pub fn format_sql(sql: &str) -> String {
    let mut formatted = String::with_capacity(sql.len() + 32);
    formatted.push('\n');
    formatted.push_str(INDENT);
    for (i, segment) in sql.trim().split('\'').enumerate() {
        if i > 0 {
            formatted.push('\'');
        }
        if i % 2 == 1 {
            formatted.push_str(segment);
            continue;
        }
        let collapsed = WHITESPACE.replace_all(segment, " ");
        let broken = CLAUSE_KEYWORDS.replace_all(&collapsed, |caps: &regex::Captures<'_>| {
            format!("\n{}{}{}", INDENT, INDENT, &caps[1])
        });
        formatted.push_str(&broken);
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_breaks_clauses() {
        let formatted = format_sql("select id, name from users where age > 18 and active = 1");
        assert_eq!(
            formatted,
            "\n    select id, name\n        from users\n        where age > 18\n        and active = 1"
        );
    }

    #[test]
    fn test_format_keeps_literals() {
        let formatted = format_sql("select * from t where note = 'from here and there'");
        assert!(formatted.contains("'from here and there'"));
        assert_eq!(formatted.matches('\n').count(), 3);
    }

    #[test]
    fn test_format_join() {
        let formatted = format_sql("select a.x from a left outer join b on a.id = b.id");
        assert!(formatted.contains("\n        left outer join b"));
    }
}
