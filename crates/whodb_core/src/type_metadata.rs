use crate::{DatabaseKind, EngineError};
use serde::{Deserialize, Serialize};

/// Broad category a column type belongs to. The frontend uses this for
/// editor affordances; the gateway only passes it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCategory {
    Numeric,
    Text,
    Binary,
    DateTime,
    Boolean,
    Json,
    Other,
}

/// One entry of a driver's static column-type catalog.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TypeDefinition {
    /// Canonical upcased base name, e.g. "VARCHAR".
    pub id: &'static str,
    pub label: &'static str,
    pub has_length: bool,
    pub has_precision: bool,
    pub default_length: Option<u32>,
    pub default_precision: Option<u32>,
    pub category: TypeCategory,
}

impl TypeDefinition {
    pub const fn simple(id: &'static str, category: TypeCategory) -> Self {
        Self {
            id,
            label: id,
            has_length: false,
            has_precision: false,
            default_length: None,
            default_precision: None,
            category,
        }
    }

    pub const fn with_length(id: &'static str, category: TypeCategory, default: u32) -> Self {
        Self {
            id,
            label: id,
            has_length: true,
            has_precision: false,
            default_length: Some(default),
            default_precision: None,
            category,
        }
    }

    pub const fn with_precision(
        id: &'static str,
        category: TypeCategory,
        length: u32,
        precision: u32,
    ) -> Self {
        Self {
            id,
            label: id,
            has_length: true,
            has_precision: true,
            default_length: Some(length),
            default_precision: Some(precision),
            category,
        }
    }
}

/// Static per-engine catalog supplied by each driver.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseMetadata {
    pub kind: DatabaseKind,
    pub type_definitions: &'static [TypeDefinition],
    /// Filter operators the engine accepts in `WhereCondition::Atomic`.
    pub operators: &'static [&'static str],
    /// Alias pairs resolved before the membership check, e.g.
    /// ("INT", "INTEGER").
    pub alias_map: &'static [(&'static str, &'static str)],
}

impl DatabaseMetadata {
    pub fn supports_operator(&self, operator: &str) -> bool {
        self.operators
            .iter()
            .any(|op| op.eq_ignore_ascii_case(operator))
    }
}

/// User-supplied type string rejected by `validate_column_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsupportedType {
    pub name: String,
    pub kind: DatabaseKind,
}

impl From<UnsupportedType> for EngineError {
    fn from(u: UnsupportedType) -> Self {
        EngineError::unsupported(format!(
            "column type {:?} is not supported by {}",
            u.name, u.kind
        ))
    }
}

/// Validate a user-supplied column type string against a driver catalog.
///
/// Parses `BASE[(params)]`, upcases the base, resolves aliases, and checks
/// membership. Missing length/precision parameters never reject (defaults
/// apply), and absent metadata means "accept" for backward compatibility.
/// Total over all inputs.
pub fn validate_column_type(
    name: &str,
    metadata: Option<&DatabaseMetadata>,
) -> Result<(), UnsupportedType> {
    let Some(metadata) = metadata else {
        return Ok(());
    };

    let base = name
        .split('(')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_uppercase();
    if base.is_empty() {
        return Err(UnsupportedType {
            name: name.to_string(),
            kind: metadata.kind,
        });
    }

    let resolved = resolve_alias(&base, metadata);

    if metadata
        .type_definitions
        .iter()
        .any(|def| def.id == resolved)
    {
        Ok(())
    } else {
        Err(UnsupportedType {
            name: name.to_string(),
            kind: metadata.kind,
        })
    }
}

fn resolve_alias(base: &str, metadata: &DatabaseMetadata) -> String {
    let mut current = base.to_string();
    // Alias chains are short; the bound only guards against a cyclic table.
    for _ in 0..8 {
        match metadata
            .alias_map
            .iter()
            .find(|(alias, _)| *alias == current)
        {
            Some((_, target)) => current = (*target).to_string(),
            None => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    static DEFS: &[TypeDefinition] = &[
        TypeDefinition::simple("INTEGER", TypeCategory::Numeric),
        TypeDefinition::with_length("VARCHAR", TypeCategory::Text, 255),
        TypeDefinition::with_precision("DECIMAL", TypeCategory::Numeric, 10, 2),
    ];

    static ALIASES: &[(&str, &str)] = &[("INT", "INTEGER"), ("INT4", "INT")];

    static META: DatabaseMetadata = DatabaseMetadata {
        kind: DatabaseKind::Postgres,
        type_definitions: DEFS,
        operators: &["=", "!=", ">", ">=", "<", "<=", "LIKE"],
        alias_map: ALIASES,
    };

    #[test]
    fn accepts_known_types_and_aliases() {
        assert!(validate_column_type("integer", Some(&META)).is_ok());
        assert!(validate_column_type("int", Some(&META)).is_ok());
        assert!(validate_column_type("int4", Some(&META)).is_ok());
    }

    #[test]
    fn missing_parameters_never_reject() {
        assert!(validate_column_type("VARCHAR", Some(&META)).is_ok());
        assert!(validate_column_type("varchar(32)", Some(&META)).is_ok());
        assert!(validate_column_type("DECIMAL(10,2)", Some(&META)).is_ok());
        assert!(validate_column_type("decimal", Some(&META)).is_ok());
    }

    #[test]
    fn unknown_type_is_rejected_with_context() {
        let err = validate_column_type("geometry", Some(&META)).unwrap_err();
        assert_eq!(err.name, "geometry");
        assert_eq!(err.kind, DatabaseKind::Postgres);
    }

    #[test]
    fn absent_metadata_accepts_everything() {
        assert!(validate_column_type("anything at all", None).is_ok());
        assert!(validate_column_type("", None).is_ok());
    }

    #[test]
    fn empty_base_is_rejected_when_metadata_present() {
        assert!(validate_column_type("", Some(&META)).is_err());
        assert!(validate_column_type("(10)", Some(&META)).is_err());
    }

    #[test]
    fn operator_check_is_case_insensitive() {
        assert!(META.supports_operator("like"));
        assert!(!META.supports_operator("SOUNDS LIKE"));
    }
}
