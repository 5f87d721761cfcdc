use crate::DatabaseMetadata;

/// Classification of a raw statement used by the MCP confirmation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Mutating,
}

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "SHOW", "EXPLAIN", "WITH", "DESC", "DESCRIBE", "PRAGMA", "VALUES",
];

/// Classify a statement by its leading keyword after stripping comments.
///
/// Anything that is not a recognizably read-only single statement counts
/// as mutating: multi-statement batches, empty input, and unknown leading
/// keywords all land on the safe side. When engine metadata is available
/// the same rule applies; the catalog only exists so engine-specific read
/// keywords can be recognized in the future without loosening this gate.
pub fn classify_statement(query: &str, _metadata: Option<&DatabaseMetadata>) -> StatementKind {
    if is_safe_read_query(query) {
        StatementKind::Read
    } else {
        StatementKind::Mutating
    }
}

/// A statement is a safe read when it has a body, carries no second
/// statement after a separator, and opens with a read-only keyword.
pub fn is_safe_read_query(sql: &str) -> bool {
    let shape = scan_statement(sql);
    if !shape.has_body || shape.multiple {
        return false;
    }
    READ_KEYWORDS.contains(&shape.keyword.as_str())
}

/// What one pass over a statement learns about its shape.
#[derive(Debug, Default, PartialEq)]
struct StatementShape {
    /// Upcased leading keyword of the first statement, if one exists.
    keyword: String,
    /// Any statement text at all, comments and separators aside.
    has_body: bool,
    /// Statement text appeared after a `;` separator.
    multiple: bool,
}

/// Walk the statement once: comments vanish, quoted runs are opaque, the
/// first alphabetic run outside both becomes the keyword, and any text
/// after a semicolon marks the input as a batch.
fn scan_statement(sql: &str) -> StatementShape {
    let mut shape = StatementShape::default();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    let mut keyword_done = false;
    let mut after_separator = false;

    while let Some(current) = chars.next() {
        if let Some(q) = quote {
            if current == q {
                // A doubled quote stays inside the literal.
                if chars.peek() == Some(&q) {
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match current {
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for skipped in chars.by_ref() {
                    if previous == '*' && skipped == '/' {
                        break;
                    }
                    previous = skipped;
                }
            }
            '\'' | '"' => {
                if after_separator {
                    shape.multiple = true;
                }
                shape.has_body = true;
                if !shape.keyword.is_empty() {
                    keyword_done = true;
                }
                quote = Some(current);
            }
            ';' => {
                after_separator = true;
                keyword_done = true;
            }
            c if c.is_whitespace() => {
                if !shape.keyword.is_empty() {
                    keyword_done = true;
                }
            }
            c => {
                if after_separator {
                    shape.multiple = true;
                }
                shape.has_body = true;
                if !keyword_done {
                    if c.is_ascii_alphabetic() {
                        shape.keyword.push(c.to_ascii_uppercase());
                    } else if !shape.keyword.is_empty() {
                        keyword_done = true;
                    }
                }
            }
        }
    }

    shape
}

#[cfg(test)]
mod tests {
    use super::{StatementKind, classify_statement, is_safe_read_query, scan_statement};

    #[test]
    fn allows_basic_read_queries() {
        assert!(is_safe_read_query("SELECT * FROM users"));
        assert!(is_safe_read_query(
            "with cte as (select 1) select * from cte"
        ));
        assert!(is_safe_read_query("SHOW TABLES"));
        assert!(is_safe_read_query("DESC users"));
    }

    #[test]
    fn rejects_write_queries() {
        assert!(!is_safe_read_query("INSERT INTO users VALUES (1)"));
        assert!(!is_safe_read_query("UPDATE users SET name = 'a'"));
        assert!(!is_safe_read_query("DELETE FROM users"));
        assert!(!is_safe_read_query("DROP TABLE users"));
    }

    #[test]
    fn rejects_multiple_statements() {
        assert!(!is_safe_read_query("SELECT 1; DROP TABLE users"));
        assert!(!is_safe_read_query("SELECT 1; SELECT 2"));
    }

    #[test]
    fn allows_single_statement_with_trailing_semicolon() {
        assert!(is_safe_read_query("SELECT 1;"));
        assert!(is_safe_read_query("-- comment\nSELECT 1;"));
        assert!(is_safe_read_query("SELECT 1; -- trailing note"));
    }

    #[test]
    fn strips_comments_before_keyword_detection() {
        assert!(is_safe_read_query("-- hello\nSELECT * FROM users"));
        assert!(is_safe_read_query("/* hello */ SELECT * FROM users"));
        assert!(!is_safe_read_query("/* hello */ DELETE FROM users"));
    }

    #[test]
    fn quoted_text_is_opaque() {
        assert!(is_safe_read_query("SELECT ';' FROM users"));
        assert!(is_safe_read_query("SELECT 'it''s; fine'"));
        assert!(is_safe_read_query("SELECT \"weird;column\" FROM t"));
        assert!(!is_safe_read_query("SELECT 'x'; DELETE FROM t"));
    }

    #[test]
    fn scan_reports_statement_shape() {
        let shape = scan_statement("  (select 1)");
        assert_eq!(shape.keyword, "SELECT");
        assert!(shape.has_body);
        assert!(!shape.multiple);

        let shape = scan_statement("-- only a comment\n");
        assert!(!shape.has_body);
        assert!(shape.keyword.is_empty());

        let shape = scan_statement("SELECT 1;;");
        assert!(!shape.multiple, "empty trailing statements are harmless");
    }

    #[test]
    fn classification_lands_on_the_safe_side() {
        assert_eq!(
            classify_statement("SELECT 1", None),
            StatementKind::Read
        );
        assert_eq!(
            classify_statement("/* x */ TRUNCATE t", None),
            StatementKind::Mutating
        );
        assert_eq!(classify_statement("", None), StatementKind::Mutating);
        assert_eq!(
            classify_statement("SELECT 1; DELETE FROM t", None),
            StatementKind::Mutating
        );
        // Unknown leading keyword: mutating until proven otherwise.
        assert_eq!(
            classify_statement("MERGE INTO t USING s ON 1=1", None),
            StatementKind::Mutating
        );
    }
}
