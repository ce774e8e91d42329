//! Declarative query description consumed by every backend.

use serde_json::Value;

use super::schema::Relation;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    /// Case-insensitive substring match.
    Contains(String),
    Gte(Value),
    Lte(Value),
    Gt(Value),
    Lt(Value),
    In(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub condition: Condition,
}

impl Predicate {
    pub fn new(field: impl Into<String>, condition: Condition) -> Self {
        Self {
            field: field.into(),
            condition,
        }
    }
}

/// Predicates in `all` are ANDed together. When `any` is non-empty at least
/// one of its predicates must also hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub all: Vec<Predicate>,
    pub any: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.all.push(Predicate::new(field, Condition::Eq(value.into())));
        self
    }

    #[must_use]
    pub fn with(mut self, field: &str, condition: Condition) -> Self {
        self.all.push(Predicate::new(field, condition));
        self
    }

    #[must_use]
    pub fn or(mut self, field: &str, condition: Condition) -> Self {
        self.any.push(Predicate::new(field, condition));
        self
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Predicate> {
        self.all.iter().chain(self.any.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    Asc,
    #[default]
    Desc,
}

impl SortDir {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        }
    }
}

impl std::str::FromStr for SortDir {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDir::Asc),
            "desc" => Ok(SortDir::Desc),
            other => Err(format!("`{other}` is not one of: asc, desc")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub dir: SortDir,
}

#[derive(Debug, Clone)]
pub struct Include {
    pub relation: Relation,
    pub exclude: Vec<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Filter,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub exclude: Vec<&'static str>,
    pub include: Vec<Include>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, dir: SortDir) -> Self {
        self.order.push(OrderBy {
            column: column.to_owned(),
            dir,
        });
        self
    }

    #[must_use]
    pub fn page(mut self, limit: u64, offset: u64) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn exclude(mut self, columns: &[&'static str]) -> Self {
        self.exclude.extend_from_slice(columns);
        self
    }

    #[must_use]
    pub fn include(mut self, relation: Relation, exclude: &[&'static str]) -> Self {
        self.include.push(Include {
            relation,
            exclude: exclude.to_vec(),
        });
        self
    }
}
