use bson::{Bson, Document, doc, oid::ObjectId};
use whodb_core::{EngineError, SortCondition, SortDirection, WhereCondition};

/// Translate the common filter tree into a MongoDB query document.
pub fn where_to_document(condition: &WhereCondition) -> Result<Document, EngineError> {
    match condition {
        WhereCondition::Atomic {
            key,
            operator,
            value,
            ..
        } => atomic_to_document(key, operator, value),
        WhereCondition::And(children) => group_to_document("$and", children),
        WhereCondition::Or(children) => group_to_document("$or", children),
    }
}

fn group_to_document(op: &str, children: &[WhereCondition]) -> Result<Document, EngineError> {
    if children.is_empty() {
        return Ok(Document::new());
    }
    let parts: Result<Vec<Document>, EngineError> =
        children.iter().map(where_to_document).collect();
    Ok(doc! { op: parts? })
}

fn atomic_to_document(key: &str, operator: &str, value: &str) -> Result<Document, EngineError> {
    let typed = typed_value(key, value);

    let condition = match operator.trim().to_ascii_uppercase().as_str() {
        "=" | "==" => return Ok(doc! { key: typed }),
        "!=" | "<>" => doc! { "$ne": typed },
        ">" => doc! { "$gt": typed },
        ">=" => doc! { "$gte": typed },
        "<" => doc! { "$lt": typed },
        "<=" => doc! { "$lte": typed },
        "IN" => {
            let items: Vec<Bson> = value
                .split(',')
                .map(|item| typed_value(key, item.trim()))
                .collect();
            doc! { "$in": items }
        }
        "NOT IN" => {
            let items: Vec<Bson> = value
                .split(',')
                .map(|item| typed_value(key, item.trim()))
                .collect();
            doc! { "$nin": items }
        }
        "LIKE" => doc! { "$regex": like_to_regex(value), "$options": "i" },
        "IS NULL" => doc! { "$eq": Bson::Null },
        "IS NOT NULL" => doc! { "$ne": Bson::Null },
        other => {
            return Err(EngineError::invalid_argument(format!(
                "unknown filter operator: {other}"
            )));
        }
    };

    Ok(doc! { key: condition })
}

/// Best-effort value typing: object ids for `_id`, then numbers and
/// booleans, falling back to the raw string.
pub fn typed_value(key: &str, value: &str) -> Bson {
    if key == "_id"
        && let Ok(oid) = ObjectId::parse_str(value)
    {
        return Bson::ObjectId(oid);
    }
    if let Ok(i) = value.parse::<i64>() {
        return Bson::Int64(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return Bson::Double(f);
    }
    match value {
        "true" => Bson::Boolean(true),
        "false" => Bson::Boolean(false),
        _ => Bson::String(value.to_string()),
    }
}

fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            c if "\\.+*?()|[]{}^$".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

pub fn sort_to_document(sort: &[SortCondition]) -> Document {
    let mut document = Document::new();
    for condition in sort {
        let direction = match condition.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        document.insert(condition.column.clone(), direction);
    }
    document
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_comparison_operators() {
        let filter = WhereCondition::atomic("age", ">=", "18");
        assert_eq!(
            where_to_document(&filter).unwrap(),
            doc! { "age": { "$gte": 18i64 } }
        );
    }

    #[test]
    fn translates_groups() {
        let filter = WhereCondition::Or(vec![
            WhereCondition::atomic("name", "=", "alice"),
            WhereCondition::atomic("name", "=", "bob"),
        ]);
        assert_eq!(
            where_to_document(&filter).unwrap(),
            doc! { "$or": [ { "name": "alice" }, { "name": "bob" } ] }
        );
    }

    #[test]
    fn object_ids_are_typed_for_id_lookups() {
        let oid = "507f1f77bcf86cd799439011";
        assert_eq!(
            typed_value("_id", oid),
            Bson::ObjectId(ObjectId::parse_str(oid).unwrap())
        );
        assert_eq!(typed_value("name", oid), Bson::String(oid.to_string()));
    }

    #[test]
    fn like_patterns_become_anchored_regexes() {
        let filter = WhereCondition::atomic("name", "LIKE", "al%ce");
        assert_eq!(
            where_to_document(&filter).unwrap(),
            doc! { "name": { "$regex": "^al.*ce$", "$options": "i" } }
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let filter = WhereCondition::atomic("name", "SOUNDS LIKE", "x");
        assert!(where_to_document(&filter).is_err());
    }
}
