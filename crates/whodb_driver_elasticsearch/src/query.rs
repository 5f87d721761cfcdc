use serde_json::{Value, json};
use whodb_core::{EngineError, SortCondition, SortDirection, WhereCondition};

/// Translate the common filter tree into an Elasticsearch query clause.
pub fn where_to_query(condition: &WhereCondition) -> Result<Value, EngineError> {
    match condition {
        WhereCondition::Atomic {
            key,
            operator,
            value,
            ..
        } => atomic_to_query(key, operator, value),
        WhereCondition::And(children) => {
            let clauses = children
                .iter()
                .map(where_to_query)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "bool": { "must": clauses } }))
        }
        WhereCondition::Or(children) => {
            let clauses = children
                .iter()
                .map(where_to_query)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "bool": { "should": clauses, "minimum_should_match": 1 } }))
        }
    }
}

fn atomic_to_query(key: &str, operator: &str, value: &str) -> Result<Value, EngineError> {
    let typed = typed_json(value);

    let clause = match operator.trim().to_ascii_uppercase().as_str() {
        "=" | "==" => json!({ "match": { key: typed } }),
        "!=" | "<>" => json!({ "bool": { "must_not": { "match": { key: typed } } } }),
        ">" => json!({ "range": { key: { "gt": typed } } }),
        ">=" => json!({ "range": { key: { "gte": typed } } }),
        "<" => json!({ "range": { key: { "lt": typed } } }),
        "<=" => json!({ "range": { key: { "lte": typed } } }),
        "LIKE" => {
            let pattern = value.replace('%', "*").replace('_', "?");
            json!({ "wildcard": { key: { "value": pattern, "case_insensitive": true } } })
        }
        "IN" => {
            let items: Vec<Value> = value.split(',').map(|v| typed_json(v.trim())).collect();
            json!({ "terms": { key: items } })
        }
        "NOT IN" => {
            let items: Vec<Value> = value.split(',').map(|v| typed_json(v.trim())).collect();
            json!({ "bool": { "must_not": { "terms": { key: items } } } })
        }
        "IS NULL" => json!({ "bool": { "must_not": { "exists": { "field": key } } } }),
        "IS NOT NULL" => json!({ "exists": { "field": key } }),
        other => {
            return Err(EngineError::invalid_argument(format!(
                "unknown filter operator: {other}"
            )));
        }
    };
    Ok(clause)
}

pub fn typed_json(value: &str) -> Value {
    if let Ok(i) = value.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return json!(f);
    }
    match value {
        "true" => json!(true),
        "false" => json!(false),
        _ => json!(value),
    }
}

pub fn sort_to_clauses(sort: &[SortCondition]) -> Vec<Value> {
    sort.iter()
        .map(|condition| {
            let order = match condition.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            };
            json!({ condition.column.clone(): { "order": order } })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_ranges_and_terms() {
        let filter = WhereCondition::atomic("age", ">=", "18");
        assert_eq!(
            where_to_query(&filter).unwrap(),
            json!({ "range": { "age": { "gte": 18 } } })
        );

        let filter = WhereCondition::atomic("status", "IN", "new,open");
        assert_eq!(
            where_to_query(&filter).unwrap(),
            json!({ "terms": { "status": ["new", "open"] } })
        );
    }

    #[test]
    fn like_becomes_wildcard() {
        let filter = WhereCondition::atomic("name", "LIKE", "al%e");
        assert_eq!(
            where_to_query(&filter).unwrap(),
            json!({ "wildcard": { "name": { "value": "al*e", "case_insensitive": true } } })
        );
    }

    #[test]
    fn groups_become_bool_queries() {
        let filter = WhereCondition::And(vec![
            WhereCondition::atomic("a", "=", "1"),
            WhereCondition::atomic("b", "=", "2"),
        ]);
        let query = where_to_query(&filter).unwrap();
        assert!(query["bool"]["must"].is_array());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let filter = WhereCondition::atomic("name", "SOUNDS LIKE", "x");
        assert!(where_to_query(&filter).is_err());
    }
}
