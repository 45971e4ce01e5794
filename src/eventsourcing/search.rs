//! Simple searches over read models.
//!
//! Records are fetched page by page and filtered here. Stores that can do
//! better should be queried directly, this is for administration and tests.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::commons::RefoldResult;
use crate::constants::DEFAULT_PAGE_SIZE;

use super::{ReadModelRecord, ReadModelStore};

//------------ Filter --------------------------------------------------------

/// A condition on the value of a read model.
///
/// Paths are dot separated, numeric segments index into arrays. A path that
/// does not resolve only matches `Ne` and `Not`.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),

    /// A substring of a string, or an element of an array.
    Contains(String, Value),
    BeginsWith(String, String),
    Exists(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(path.to_string(), value.into())
    }

    pub fn ne(path: &str, value: impl Into<Value>) -> Self {
        Filter::Ne(path.to_string(), value.into())
    }

    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Gt(path.to_string(), value.into())
    }

    pub fn gte(path: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(path.to_string(), value.into())
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(path.to_string(), value.into())
    }

    pub fn lte(path: &str, value: impl Into<Value>) -> Self {
        Filter::Lte(path.to_string(), value.into())
    }

    pub fn is_in(path: &str, values: Vec<Value>) -> Self {
        Filter::In(path.to_string(), values)
    }

    pub fn contains(path: &str, value: impl Into<Value>) -> Self {
        Filter::Contains(path.to_string(), value.into())
    }

    pub fn begins_with(path: &str, prefix: &str) -> Self {
        Filter::BeginsWith(path.to_string(), prefix.to_string())
    }

    pub fn exists(path: &str) -> Self {
        Filter::Exists(path.to_string())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            filter => Filter::And(vec![filter, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            filter => Filter::Or(vec![filter, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Filter::Eq(path, expected) => {
                lookup(value, path).is_some_and(|found| found == expected)
            }
            Filter::Ne(path, expected) => {
                lookup(value, path).is_none_or(|found| found != expected)
            }
            Filter::Gt(path, bound) => {
                compare_at(value, path, bound) == Some(Ordering::Greater)
            }
            Filter::Gte(path, bound) => matches!(
                compare_at(value, path, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(path, bound) => {
                compare_at(value, path, bound) == Some(Ordering::Less)
            }
            Filter::Lte(path, bound) => matches!(
                compare_at(value, path, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::In(path, candidates) => lookup(value, path)
                .is_some_and(|found| candidates.contains(found)),
            Filter::Contains(path, needle) => match lookup(value, path) {
                Some(Value::String(s)) => {
                    needle.as_str().is_some_and(|needle| s.contains(needle))
                }
                Some(Value::Array(items)) => items.contains(needle),
                _ => false,
            },
            Filter::BeginsWith(path, prefix) => lookup(value, path)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Filter::Exists(path) => lookup(value, path).is_some(),
            Filter::And(filters) => filters.iter().all(|f| f.matches(value)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(value)),
            Filter::Not(filter) => !filter.matches(value),
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Null => None,
        found => Some(found),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn compare_at(value: &Value, path: &str, bound: &Value) -> Option<Ordering> {
    compare(lookup(value, path)?, bound)
}

//------------ Order ---------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Order {
    Asc,
    Desc,
}

//------------ Searcher ------------------------------------------------------

/// Finds read models of one type matching a filter.
///
/// Without a sort order results come ordered by id.
#[derive(Clone)]
pub struct Searcher {
    read_models: Arc<dyn ReadModelStore>,
    read_model: String,
    filter: Option<Filter>,
    sort: Option<(String, Order)>,
    limit: Option<usize>,
    page_size: usize,
}

impl Searcher {
    pub fn new(read_models: Arc<dyn ReadModelStore>, read_model: &str) -> Self {
        Searcher {
            read_models,
            read_model: read_model.to_string(),
            filter: None,
            sort: None,
            limit: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Adds a filter, all filters must match.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn sort_by(mut self, path: &str, order: Order) -> Self {
        self.sort = Some((path.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn search(&self) -> RefoldResult<Vec<ReadModelRecord>> {
        let mut found = vec![];
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .read_models
                .list(&self.read_model, cursor.as_deref(), self.page_size)
                .await?;

            found.extend(page.items.into_iter().filter(|record| {
                self.filter
                    .as_ref()
                    .is_none_or(|filter| filter.matches(&record.value))
            }));

            if self.sort.is_none() && self.limit.is_some_and(|l| found.len() >= l) {
                break;
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some((path, order)) = &self.sort {
            // Records without the field go last, whatever the order.
            found.sort_by(|a, b| {
                match (lookup(&a.value, path), lookup(&b.value, path)) {
                    (Some(a), Some(b)) => {
                        let ordering = compare(a, b).unwrap_or(Ordering::Equal);
                        match order {
                            Order::Asc => ordering,
                            Order::Desc => ordering.reverse(),
                        }
                    }
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }

        if let Some(limit) = self.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

//------------ Tests ---------------------------------------------------------
