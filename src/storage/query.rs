// ============================================================================
// Row queries - the storage-native form of search criteria
// ============================================================================
//
// Column references are positional; the data access layer resolves field
// names to column indexes before a query reaches storage.
//
// ============================================================================

use super::pattern::eval_like;
use crate::core::{DataError, EntityId, Result, Row, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum RowPredicate {
    IdEq(EntityId),
    Eq(usize, Value),
    Ne(usize, Value),
    Gt(usize, Value),
    Ge(usize, Value),
    Lt(usize, Value),
    Le(usize, Value),
    Like {
        column: usize,
        pattern: String,
        case_sensitive: bool,
    },
    In(usize, Vec<Value>),
    IsNull(usize),
    IsNotNull(usize),
    And(Vec<RowPredicate>),
    Or(Vec<RowPredicate>),
    Not(Box<RowPredicate>),
}

impl RowPredicate {
    pub fn evaluate(&self, id: EntityId, row: &Row) -> Result<bool> {
        Ok(match self {
            Self::IdEq(expected) => id == *expected,
            Self::Eq(column, value) => cell(row, *column)?.matches(value),
            Self::Ne(column, value) => {
                let actual = cell(row, *column)?;
                !actual.is_null() && !actual.matches(value)
            }
            Self::Gt(column, value) => compare(row, *column, value)? == Some(Ordering::Greater),
            Self::Ge(column, value) => matches!(
                compare(row, *column, value)?,
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(column, value) => compare(row, *column, value)? == Some(Ordering::Less),
            Self::Le(column, value) => matches!(
                compare(row, *column, value)?,
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Like {
                column,
                pattern,
                case_sensitive,
            } => match cell(row, *column)? {
                Value::Null => false,
                other => eval_like(&other.to_string(), pattern, *case_sensitive)?,
            },
            Self::In(column, values) => {
                let actual = cell(row, *column)?;
                values.iter().any(|value| actual.matches(value))
            }
            Self::IsNull(column) => cell(row, *column)?.is_null(),
            Self::IsNotNull(column) => !cell(row, *column)?.is_null(),
            Self::And(predicates) => {
                for predicate in predicates {
                    if !predicate.evaluate(id, row)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Or(predicates) => {
                for predicate in predicates {
                    if predicate.evaluate(id, row)? {
                        return Ok(true);
                    }
                }
                false
            }
            Self::Not(predicate) => !predicate.evaluate(id, row)?,
        })
    }

    /// Equality lookup that an index can answer, if any.
    pub fn index_lookup(&self) -> Option<(usize, &Value)> {
        match self {
            Self::Eq(column, value) if !value.is_null() => Some((*column, value)),
            Self::And(predicates) => predicates.iter().find_map(|p| p.index_lookup()),
            _ => None,
        }
    }
}

fn cell(row: &Row, column: usize) -> Result<&Value> {
    row.get(column)
        .ok_or_else(|| DataError::Persistence(format!("Column index {} out of range", column)))
}

fn compare(row: &Row, column: usize, value: &Value) -> Result<Option<Ordering>> {
    let actual = cell(row, column)?;
    if actual.is_null() || value.is_null() {
        return Ok(None);
    }
    actual.compare(value).map(Some)
}

/// Strategy for handling NULL values during sorting
///
/// - ASC: NULLS LAST
/// - DESC: NULLS FIRST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullOrdering {
    NullsFirst,
    NullsLast,
}

impl NullOrdering {
    pub fn default_for_direction(descending: bool) -> Self {
        if descending {
            Self::NullsFirst
        } else {
            Self::NullsLast
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Id,
    Column(usize),
}

/// A single sorting key (one column of the ORDER BY list)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: SortColumn,
    pub descending: bool,
    pub null_ordering: NullOrdering,
}

impl SortKey {
    pub fn new(column: SortColumn, descending: bool) -> Self {
        Self {
            column,
            descending,
            null_ordering: NullOrdering::default_for_direction(descending),
        }
    }

    fn compare(&self, a: &(EntityId, Row), b: &(EntityId, Row)) -> Ordering {
        let ordering = match self.column {
            SortColumn::Id => a.0.cmp(&b.0),
            SortColumn::Column(idx) => {
                let (left, right) = (&a.1[idx], &b.1[idx]);
                match (left.is_null(), right.is_null()) {
                    (true, true) => Ordering::Equal,
                    // Null placement is independent of direction, so undo the
                    // reversal applied below.
                    (true, false) => return self.null_side(Ordering::Less),
                    (false, true) => return self.null_side(Ordering::Greater),
                    (false, false) => left.compare(right).unwrap_or(Ordering::Equal),
                }
            }
        };

        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }

    /// `null_first` is the ordering when the left value is NULL and nulls go first.
    fn null_side(&self, null_first: Ordering) -> Ordering {
        match self.null_ordering {
            NullOrdering::NullsFirst => null_first,
            NullOrdering::NullsLast => null_first.reverse(),
        }
    }
}

/// Storage-native query: filter, stable multi-key sort, pagination, projection.
#[derive(Debug, Clone, Default)]
pub struct RowQuery {
    pub predicate: Option<RowPredicate>,
    pub sort: Vec<SortKey>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub projection: Option<Vec<usize>>,
}

impl RowQuery {
    pub fn filter(mut self, predicate: RowPredicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(RowPredicate::And(mut existing)) => {
                existing.push(predicate);
                RowPredicate::And(existing)
            }
            Some(existing) => RowPredicate::And(vec![existing, predicate]),
            None => predicate,
        });
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project(mut self, columns: Vec<usize>) -> Self {
        self.projection = Some(columns);
        self
    }

    pub(crate) fn matches(&self, id: EntityId, row: &Row) -> Result<bool> {
        match &self.predicate {
            Some(predicate) => predicate.evaluate(id, row),
            None => Ok(true),
        }
    }

    /// Sorts, counts, paginates and projects already-filtered rows.
    pub(crate) fn finish(&self, mut rows: Vec<(EntityId, Row)>) -> RowSet {
        if !self.sort.is_empty() {
            rows.sort_by(|a, b| {
                self.sort
                    .iter()
                    .map(|key| key.compare(a, b))
                    .find(|ordering| *ordering != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let total = rows.len();
        let page = rows
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX));

        let rows = match &self.projection {
            Some(columns) => page
                .map(|(id, row)| (id, columns.iter().map(|idx| row[*idx].clone()).collect()))
                .collect(),
            None => page.collect(),
        };

        RowSet { rows, total }
    }
}

/// Query output: the requested page plus the match count before pagination.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub rows: Vec<(EntityId, Row)>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<(EntityId, Row)> {
        vec![
            (1, vec![Value::from("Bob"), Value::Integer(30)]),
            (2, vec![Value::from("Ann"), Value::Null]),
            (3, vec![Value::from("Tom"), Value::Integer(20)]),
        ]
    }

    #[test]
    fn test_null_ordering_defaults() {
        assert_eq!(NullOrdering::default_for_direction(false), NullOrdering::NullsLast);
        assert_eq!(NullOrdering::default_for_direction(true), NullOrdering::NullsFirst);
    }

    #[test]
    fn test_sort_ascending_nulls_last() {
        let query = RowQuery::default().sort(SortKey::new(SortColumn::Column(1), false));
        let ids: Vec<_> = query.finish(rows()).rows.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_sort_descending_nulls_first() {
        let query = RowQuery::default().sort(SortKey::new(SortColumn::Column(1), true));
        let ids: Vec<_> = query.finish(rows()).rows.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_pagination_and_projection() {
        let query = RowQuery::default()
            .sort(SortKey::new(SortColumn::Id, true))
            .offset(1)
            .limit(1)
            .project(vec![0]);
        let set = query.finish(rows());
        assert_eq!(set.total, 3);
        assert_eq!(set.rows, vec![(2, vec![Value::from("Ann")])]);
    }

    #[test]
    fn test_predicates() {
        let row = vec![Value::from("Bob"), Value::Integer(30)];
        assert!(RowPredicate::Gt(1, Value::Integer(29)).evaluate(1, &row).unwrap());
        assert!(!RowPredicate::Lt(1, Value::Integer(30)).evaluate(1, &row).unwrap());
        assert!(RowPredicate::Le(1, Value::Integer(30)).evaluate(1, &row).unwrap());
        assert!(RowPredicate::In(0, vec!["Ann".into(), "Bob".into()]).evaluate(1, &row).unwrap());
        assert!(RowPredicate::Not(Box::new(RowPredicate::IdEq(2))).evaluate(1, &row).unwrap());
        assert!(RowPredicate::Or(vec![RowPredicate::IsNull(1), RowPredicate::Eq(0, "Bob".into())])
            .evaluate(1, &row)
            .unwrap());
        assert!(RowPredicate::Gt(0, Value::Integer(1)).evaluate(1, &row).is_err());
    }

    #[test]
    fn test_filter_accumulates_conjunction() {
        let query = RowQuery::default()
            .filter(RowPredicate::IsNotNull(0))
            .filter(RowPredicate::Eq(1, Value::Integer(30)));
        assert!(matches!(query.predicate, Some(RowPredicate::And(ref p)) if p.len() == 2));
        assert_eq!(
            query.predicate.as_ref().and_then(|p| p.index_lookup()),
            Some((1, &Value::Integer(30)))
        );
    }
}
