//! Fetch requests
//!
//! Predicates and sort descriptors are compiled to parameterized SQL against
//! a single entity table. Property names are checked against the entity
//! description before they reach SQL.

use super::error::{StorageError, StorageResult};
use super::schema::quote;
use crate::model::{EntityDescription, PRIMARY_KEY};
use crate::value::{AttributeKind, Value};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    fn operator(&self) -> &'static str {
        match self {
            Comparison::Equal => "=",
            Comparison::NotEqual => "<>",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
        }
    }
}

/// Filter over the properties of one entity
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        key: String,
        op: Comparison,
        value: Value,
    },
    /// Substring match on a text property (ASCII case-insensitive)
    Contains { key: String, needle: String },
    IsNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn compare(key: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Equal, value)
    }

    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::NotEqual, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Less, value)
    }

    pub fn le(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::LessOrEqual, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::Greater, value)
    }

    pub fn ge(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(key, Comparison::GreaterOrEqual, value)
    }

    pub fn contains(key: impl Into<String>, needle: impl Into<String>) -> Self {
        Predicate::Contains {
            key: key.into(),
            needle: needle.into(),
        }
    }

    pub fn is_null(key: impl Into<String>) -> Self {
        Predicate::IsNull(key.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut all) => {
                all.push(other);
                Predicate::And(all)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut any) => {
                any.push(other);
                Predicate::Or(any)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

/// Sort order on one property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// What to fetch from one entity
///
/// A `limit` of 0 means no limit. Without sort descriptors records come back
/// in primary key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub predicate: Option<Predicate>,
    pub sort: Vec<SortDescriptor>,
    pub offset: usize,
    pub limit: usize,
}

impl FetchRequest {
    /// Every record of the entity
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    pub fn sorted_by(mut self, sort: SortDescriptor) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// SQL text with its positional parameters
#[derive(Debug, Default)]
pub(crate) struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compile a predicate to a `WHERE` expression
pub(crate) fn compile_predicate(
    predicate: &Predicate,
    entity: &EntityDescription,
) -> StorageResult<SqlFragment> {
    let mut fragment = SqlFragment::default();
    write_predicate(predicate, entity, &mut fragment)?;
    Ok(fragment)
}

fn write_predicate(
    predicate: &Predicate,
    entity: &EntityDescription,
    out: &mut SqlFragment,
) -> StorageResult<()> {
    match predicate {
        Predicate::Compare { key, op, value } => {
            let kind = property_kind(entity, key)?;
            if value.is_null() {
                // Ordering against null never matches
                match op {
                    Comparison::Equal => out.sql.push_str(&format!("{} IS NULL", quote(key))),
                    Comparison::NotEqual => {
                        out.sql.push_str(&format!("{} IS NOT NULL", quote(key)))
                    }
                    _ => out.sql.push('0'),
                }
                return Ok(());
            }
            check_kind(entity, key, kind, value)?;
            out.sql
                .push_str(&format!("{} {} ?", quote(key), op.operator()));
            out.params.push(value.clone());
        }
        Predicate::Contains { key, needle } => {
            let kind = property_kind(entity, key)?;
            if kind != AttributeKind::Text {
                return Err(StorageError::TypeMismatch {
                    entity: entity.name.clone(),
                    property: key.clone(),
                    expected: AttributeKind::Text,
                    found: kind.to_string(),
                });
            }
            out.sql
                .push_str(&format!("{} LIKE ? ESCAPE '\\'", quote(key)));
            out.params
                .push(Value::Text(format!("%{}%", escape_like(needle))));
        }
        Predicate::IsNull(key) => {
            property_kind(entity, key)?;
            out.sql.push_str(&format!("{} IS NULL", quote(key)));
        }
        Predicate::And(all) => write_group(all, " AND ", "1", entity, out)?,
        Predicate::Or(any) => write_group(any, " OR ", "0", entity, out)?,
        Predicate::Not(inner) => {
            out.sql.push_str("NOT (");
            write_predicate(inner, entity, out)?;
            out.sql.push(')');
        }
    }
    Ok(())
}

fn write_group(
    predicates: &[Predicate],
    separator: &str,
    empty: &str,
    entity: &EntityDescription,
    out: &mut SqlFragment,
) -> StorageResult<()> {
    if predicates.is_empty() {
        out.sql.push_str(empty);
        return Ok(());
    }

    out.sql.push('(');
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            out.sql.push_str(separator);
        }
        out.sql.push('(');
        write_predicate(predicate, entity, out)?;
        out.sql.push(')');
    }
    out.sql.push(')');
    Ok(())
}

/// Compile sort descriptors to an `ORDER BY` list, primary key last
pub(crate) fn compile_order(
    sort: &[SortDescriptor],
    entity: &EntityDescription,
) -> StorageResult<String> {
    let mut terms = Vec::with_capacity(sort.len() + 1);
    for descriptor in sort {
        property_kind(entity, &descriptor.key)?;
        terms.push(format!(
            "{} {}",
            quote(&descriptor.key),
            if descriptor.ascending { "ASC" } else { "DESC" }
        ));
    }
    terms.push(format!("{} ASC", quote(PRIMARY_KEY)));
    Ok(terms.join(", "))
}

/// `LIMIT`/`OFFSET` clause; empty when neither is set
pub(crate) fn compile_window(offset: usize, limit: usize) -> String {
    match (offset, limit) {
        (0, 0) => String::new(),
        (0, limit) => format!(" LIMIT {}", limit),
        (offset, 0) => format!(" LIMIT -1 OFFSET {}", offset),
        (offset, limit) => format!(" LIMIT {} OFFSET {}", limit, offset),
    }
}

fn property_kind(entity: &EntityDescription, key: &str) -> StorageResult<AttributeKind> {
    entity
        .property_kind(key)
        .ok_or_else(|| StorageError::UnknownProperty {
            entity: entity.name.clone(),
            property: key.to_string(),
        })
}

fn check_kind(
    entity: &EntityDescription,
    key: &str,
    kind: AttributeKind,
    value: &Value,
) -> StorageResult<()> {
    let numeric = matches!(kind, AttributeKind::Real)
        && matches!(value, Value::Integer(_));
    if value.fits(kind) || numeric {
        return Ok(());
    }
    Err(StorageError::TypeMismatch {
        entity: entity.name.clone(),
        property: key.to_string(),
        expected: kind,
        found: value
            .kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "null".to_string()),
    })
}

fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
