use crate::{EngineError, SortCondition, SortDirection, Value, WhereCondition};

/// Database-specific SQL syntax (quoting, escaping, literals).
pub trait SqlDialect: Send + Sync {
    /// Quote an identifier (table/column name).
    ///
    /// - PostgreSQL/SQLite/ClickHouse: `"name"` (double quotes)
    /// - MySQL/MariaDB: `` `name` `` (backticks)
    fn quote_identifier(&self, name: &str) -> String;

    /// Build a qualified table reference.
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) if !s.is_empty() => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(table)
            ),
            _ => self.quote_identifier(table),
        }
    }

    /// Convert a native value to a SQL literal.
    fn value_to_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(s) => s.clone(),
            Value::Bytes(b) => format!("X'{}'", hex::encode(b)),
            other => format!("'{}'", self.escape_string(&other.to_wire_string())),
        }
    }

    /// Escape a string for use inside a single-quoted literal.
    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }

    /// Whether this dialect supports RETURNING in INSERT/UPDATE/DELETE.
    fn supports_returning(&self) -> bool {
        false
    }
}

/// ANSI default: double-quoted identifiers, `''` escaping.
pub struct AnsiSqlDialect;

impl SqlDialect for AnsiSqlDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Filter operators accepted by the relational renderer. Engine-specific
/// catalogs may narrow this through `DatabaseMetadata::operators`.
const SQL_OPERATORS: &[&str] = &[
    "=", "!=", "<>", "<", "<=", ">", ">=", "LIKE", "NOT LIKE", "ILIKE", "IN", "NOT IN",
    "IS NULL", "IS NOT NULL",
];

/// Render a `WhereCondition` tree into a SQL predicate.
///
/// Unknown operators surface `InvalidArgument` before any query runs.
/// Atomic values are rendered as typed literals: numeric and boolean
/// column types stay unquoted when the value parses, everything else is a
/// quoted string.
pub fn render_where(
    condition: &WhereCondition,
    dialect: &dyn SqlDialect,
) -> Result<String, EngineError> {
    match condition {
        WhereCondition::Atomic {
            key,
            operator,
            value,
            column_type,
        } => {
            let op = normalize_operator(operator)?;
            let column = dialect.quote_identifier(key);

            match op.as_str() {
                "IS NULL" | "IS NOT NULL" => Ok(format!("{column} {op}")),
                "IN" | "NOT IN" => {
                    let items: Vec<String> = value
                        .split(',')
                        .map(|item| atomic_literal(item.trim(), column_type.as_deref(), dialect))
                        .collect();
                    if items.is_empty() {
                        return Err(EngineError::invalid_argument(format!(
                            "empty value list for {op} on {key}"
                        )));
                    }
                    Ok(format!("{column} {op} ({})", items.join(", ")))
                }
                _ => {
                    let literal = atomic_literal(value, column_type.as_deref(), dialect);
                    Ok(format!("{column} {op} {literal}"))
                }
            }
        }
        WhereCondition::And(children) => render_group(children, " AND ", dialect),
        WhereCondition::Or(children) => render_group(children, " OR ", dialect),
    }
}

fn render_group(
    children: &[WhereCondition],
    joiner: &str,
    dialect: &dyn SqlDialect,
) -> Result<String, EngineError> {
    if children.is_empty() {
        // An empty group matches everything.
        return Ok("TRUE".to_string());
    }
    let parts: Result<Vec<String>, EngineError> = children
        .iter()
        .map(|child| render_where(child, dialect))
        .collect();
    Ok(format!("({})", parts?.join(joiner)))
}

fn normalize_operator(operator: &str) -> Result<String, EngineError> {
    let upper = operator.trim().to_ascii_uppercase();
    if SQL_OPERATORS.iter().any(|op| *op == upper) {
        Ok(upper)
    } else {
        Err(EngineError::invalid_argument(format!(
            "unknown filter operator: {operator}"
        )))
    }
}

fn atomic_literal(value: &str, column_type: Option<&str>, dialect: &dyn SqlDialect) -> String {
    let type_upper = column_type.unwrap_or("").to_ascii_uppercase();

    let numeric = type_upper.contains("INT")
        || type_upper.contains("NUMERIC")
        || type_upper.contains("DECIMAL")
        || type_upper.contains("FLOAT")
        || type_upper.contains("DOUBLE")
        || type_upper.contains("REAL");
    if numeric && value.parse::<f64>().is_ok() {
        return value.to_string();
    }

    if type_upper.contains("BOOL") {
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" => return "TRUE".to_string(),
            "false" | "0" => return "FALSE".to_string(),
            _ => {}
        }
    }

    format!("'{}'", dialect.escape_string(value))
}

/// Render sort conditions into an ORDER BY clause body.
pub fn render_order_by(sort: &[SortCondition], dialect: &dyn SqlDialect) -> String {
    sort.iter()
        .map(|s| {
            let direction = match s.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {direction}", dialect.quote_identifier(&s.column))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the SELECT/COUNT statements shared by the relational drivers.
pub struct SelectBuilder<'a> {
    dialect: &'a dyn SqlDialect,
}

impl<'a> SelectBuilder<'a> {
    pub fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        filter: Option<&WhereCondition>,
        sort: &[SortCondition],
        page_size: u32,
        page_offset: u64,
    ) -> Result<String, EngineError> {
        let mut sql = format!(
            "SELECT * FROM {}",
            self.dialect.qualified_table(schema, table)
        );
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&render_where(filter, self.dialect)?);
        }
        if !sort.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&render_order_by(sort, self.dialect));
        }
        sql.push_str(&format!(" LIMIT {page_size} OFFSET {page_offset}"));
        Ok(sql)
    }

    pub fn build_count(
        &self,
        schema: Option<&str>,
        table: &str,
        filter: Option<&WhereCondition>,
    ) -> Result<String, EngineError> {
        let mut sql = format!(
            "SELECT COUNT(*) FROM {}",
            self.dialect.qualified_table(schema, table)
        );
        if let Some(filter) = filter {
            sql.push_str(" WHERE ");
            sql.push_str(&render_where(filter, self.dialect)?);
        }
        Ok(sql)
    }

    pub fn build_insert(
        &self,
        schema: Option<&str>,
        table: &str,
        values: &[crate::Record],
    ) -> Result<String, EngineError> {
        if values.is_empty() {
            return Err(EngineError::invalid_argument("no values to insert"));
        }
        let columns: Vec<String> = values
            .iter()
            .map(|r| self.dialect.quote_identifier(&r.key))
            .collect();
        let literals: Vec<String> = values
            .iter()
            .map(|r| self.record_literal(r))
            .collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.dialect.qualified_table(schema, table),
            columns.join(", "),
            literals.join(", ")
        ))
    }

    /// UPDATE keyed on the non-updated columns in `values`. The caller has
    /// already verified that key columns are present.
    pub fn build_update(
        &self,
        schema: Option<&str>,
        table: &str,
        values: &[crate::Record],
        updated_columns: &[String],
    ) -> Result<String, EngineError> {
        let (changes, keys): (Vec<&crate::Record>, Vec<&crate::Record>) = values
            .iter()
            .partition(|r| updated_columns.iter().any(|c| c == &r.key));

        if changes.is_empty() {
            return Err(EngineError::invalid_argument("no columns to update"));
        }
        if keys.is_empty() {
            return Err(EngineError::conflict(
                "update requires the key columns alongside the changed values",
            ));
        }

        let set_clause: Vec<String> = changes
            .iter()
            .map(|r| {
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(&r.key),
                    self.record_literal(r)
                )
            })
            .collect();
        let where_clause: Vec<String> = keys.iter().map(|r| self.key_predicate(r)).collect();

        Ok(format!(
            "UPDATE {} SET {} WHERE {}",
            self.dialect.qualified_table(schema, table),
            set_clause.join(", "),
            where_clause.join(" AND ")
        ))
    }

    pub fn build_delete(
        &self,
        schema: Option<&str>,
        table: &str,
        key_values: &[crate::Record],
    ) -> Result<String, EngineError> {
        if key_values.is_empty() {
            return Err(EngineError::conflict("delete requires key values"));
        }
        let where_clause: Vec<String> =
            key_values.iter().map(|r| self.key_predicate(r)).collect();
        Ok(format!(
            "DELETE FROM {} WHERE {}",
            self.dialect.qualified_table(schema, table),
            where_clause.join(" AND ")
        ))
    }

    fn key_predicate(&self, record: &crate::Record) -> String {
        let column = self.dialect.quote_identifier(&record.key);
        if record.value.is_empty() {
            format!("{column} IS NULL")
        } else {
            format!("{column} = {}", self.record_literal(record))
        }
    }

    /// Literal for a wire record: the column type travels in `extras`.
    fn record_literal(&self, record: &crate::Record) -> String {
        if record.value.is_empty() {
            return "NULL".to_string();
        }
        let column_type = record
            .extras
            .as_ref()
            .and_then(|e| e.get("type"))
            .map(|s| s.as_str());
        atomic_literal(&record.value, column_type, self.dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;

    #[test]
    fn renders_atomic_conditions() {
        let filter = WhereCondition::atomic("name", "=", "alice");
        assert_eq!(
            render_where(&filter, &AnsiSqlDialect).unwrap(),
            "\"name\" = 'alice'"
        );
    }

    #[test]
    fn renders_nested_trees() {
        let filter = WhereCondition::Or(vec![
            WhereCondition::Atomic {
                key: "age".into(),
                operator: ">=".into(),
                value: "18".into(),
                column_type: Some("integer".into()),
            },
            WhereCondition::And(vec![
                WhereCondition::atomic("city", "=", "Reykjavík"),
                WhereCondition::atomic("active", "IS NOT NULL", ""),
            ]),
        ]);
        assert_eq!(
            render_where(&filter, &AnsiSqlDialect).unwrap(),
            "(\"age\" >= 18 OR (\"city\" = 'Reykjavík' AND \"active\" IS NOT NULL))"
        );
    }

    #[test]
    fn unknown_operator_is_invalid_argument() {
        let filter = WhereCondition::atomic("name", "SOUNDS LIKE", "x");
        let err = render_where(&filter, &AnsiSqlDialect).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn empty_group_matches_everything() {
        let filter = WhereCondition::And(vec![]);
        assert_eq!(render_where(&filter, &AnsiSqlDialect).unwrap(), "TRUE");
    }

    #[test]
    fn escapes_quotes_in_values_and_identifiers() {
        let filter = WhereCondition::atomic("na\"me", "=", "o'brien");
        assert_eq!(
            render_where(&filter, &AnsiSqlDialect).unwrap(),
            "\"na\"\"me\" = 'o''brien'"
        );
    }

    #[test]
    fn builds_paged_select() {
        let builder = SelectBuilder::new(&AnsiSqlDialect);
        let sql = builder
            .build_select(
                Some("public"),
                "users",
                None,
                &[SortCondition::desc("created_at")],
                25,
                50,
            )
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"public\".\"users\" ORDER BY \"created_at\" DESC LIMIT 25 OFFSET 50"
        );
    }

    #[test]
    fn update_requires_key_columns() {
        let builder = SelectBuilder::new(&AnsiSqlDialect);
        let values = vec![Record::new("name", "bob")];
        let err = builder
            .build_update(None, "users", &values, &["name".to_string()])
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn update_splits_changes_from_keys() {
        let builder = SelectBuilder::new(&AnsiSqlDialect);
        let values = vec![Record::new("id", "7"), Record::new("name", "bob")];
        let sql = builder
            .build_update(Some("public"), "users", &values, &["name".to_string()])
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"public\".\"users\" SET \"name\" = 'bob' WHERE \"id\" = '7'"
        );
    }
}
