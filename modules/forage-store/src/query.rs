use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field value is one of the elements of the (array) filter value.
    In,
    /// Field is an array containing the filter value.
    ArrayContains,
    /// Case-insensitive substring match on a string field.
    TextContains,
}

/// A single predicate over a dotted field path (`"payload.country"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Ne, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value)
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::ArrayContains, value)
    }

    pub fn text(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::new(field, FilterOp::TextContains, Value::String(needle.into()))
    }

    /// Evaluate against an in-memory document.
    pub fn matches(&self, doc: &Value) -> bool {
        let field = lookup(doc, &self.field);
        match self.op {
            FilterOp::Eq => field.unwrap_or(&Value::Null) == &self.value,
            FilterOp::Ne => field.unwrap_or(&Value::Null) != &self.value,
            FilterOp::Gt => cmp(field, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                cmp(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => cmp(field, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                cmp(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => match &self.value {
                Value::Array(options) => {
                    let field = field.unwrap_or(&Value::Null);
                    options.iter().any(|o| o == field)
                }
                _ => false,
            },
            FilterOp::ArrayContains => match field {
                Some(Value::Array(items)) => items.iter().any(|i| i == &self.value),
                _ => false,
            },
            FilterOp::TextContains => match (field, &self.value) {
                (Some(Value::String(haystack)), Value::String(needle)) => haystack
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Filters are ANDed. Without an explicit order, results come back oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Ordering used by the in-memory store. Ties fall back to `created_at`, then `id`.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for order in &self.order_by {
            let ord = cmp(lookup(a, &order.field), lookup(b, &order.field).unwrap_or(&Value::Null))
                .unwrap_or(Ordering::Equal);
            let ord = match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        cmp(lookup(a, "created_at"), lookup(b, "created_at").unwrap_or(&Value::Null))
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                cmp(lookup(a, "id"), lookup(b, "id").unwrap_or(&Value::Null))
                    .unwrap_or(Ordering::Equal)
            })
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

/// Compare two JSON scalars. RFC 3339 strings compare as instants so that
/// differing sub-second precision does not break ordering.
fn cmp(field: Option<&Value>, other: &Value) -> Option<Ordering> {
    match (field?, other) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => match (parse_instant(a), parse_instant(b)) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => Some(a.cmp(b)),
        },
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<FixedOffset>> {
    // Cheap shape check before attempting a parse on every string comparison.
    if s.len() < 20 || s.as_bytes().get(10) != Some(&b'T') {
        return None;
    }
    DateTime::parse_from_rfc3339(s).ok()
}
