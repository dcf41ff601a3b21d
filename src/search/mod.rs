//! Ad-hoc query criteria over one schema, translated to storage row queries.

use crate::core::{DataError, EntityId, Result, Value};
use crate::entity::{Entity, FieldValue};
use crate::model::{DataDefinition, FieldDefinition, SchemaRegistry};
use crate::storage::{RowPredicate, RowQuery, SortColumn, SortKey};

#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    Eq(String, FieldValue),
    Ne(String, FieldValue),
    Gt(String, FieldValue),
    Ge(String, FieldValue),
    Lt(String, FieldValue),
    Le(String, FieldValue),
    Like {
        field: String,
        pattern: String,
        case_sensitive: bool,
    },
    In(String, Vec<FieldValue>),
    IsNull(String),
    IsNotNull(String),
    IdEq(EntityId),
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Box<Restriction>),
}

impl Restriction {
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn ge(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Ge(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::Le(field.into(), value.into())
    }

    /// SQL-style pattern with `%` and `_` wildcards.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like {
            field: field.into(),
            pattern: pattern.into(),
            case_sensitive: true,
        }
    }

    pub fn ilike(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Like {
            field: field.into(),
            pattern: pattern.into(),
            case_sensitive: false,
        }
    }

    pub fn in_list<V: Into<FieldValue>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull(field.into())
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::IsNotNull(field.into())
    }

    pub fn id_eq(id: EntityId) -> Self {
        Self::IdEq(id)
    }

    /// Rows whose belongs-to `field` points at `id`.
    pub fn belongs_to(field: impl Into<String>, id: EntityId) -> Self {
        Self::Eq(field.into(), FieldValue::Integer(id))
    }

    pub fn and(restrictions: impl IntoIterator<Item = Restriction>) -> Self {
        Self::And(restrictions.into_iter().collect())
    }

    pub fn or(restrictions: impl IntoIterator<Item = Restriction>) -> Self {
        Self::Or(restrictions.into_iter().collect())
    }

    pub fn not(restriction: Restriction) -> Self {
        Self::Not(Box::new(restriction))
    }

    fn to_predicate(&self, definition: &DataDefinition, registry: &SchemaRegistry) -> Result<RowPredicate> {
        let compare = |field: &str, value: &FieldValue| -> Result<(usize, Value)> {
            let (column, field) = column(definition, field)?;
            Ok((column, storage_value(field, value, registry)?))
        };

        Ok(match self {
            Self::Eq(field, value) if value.is_null() => RowPredicate::IsNull(column(definition, field)?.0),
            Self::Ne(field, value) if value.is_null() => RowPredicate::IsNotNull(column(definition, field)?.0),
            Self::Eq(field, value) => {
                let (column, value) = compare(field, value)?;
                RowPredicate::Eq(column, value)
            }
            Self::Ne(field, value) => {
                let (column, value) = compare(field, value)?;
                RowPredicate::Ne(column, value)
            }
            Self::Gt(field, value) => {
                let (column, value) = compare(field, value)?;
                RowPredicate::Gt(column, value)
            }
            Self::Ge(field, value) => {
                let (column, value) = compare(field, value)?;
                RowPredicate::Ge(column, value)
            }
            Self::Lt(field, value) => {
                let (column, value) = compare(field, value)?;
                RowPredicate::Lt(column, value)
            }
            Self::Le(field, value) => {
                let (column, value) = compare(field, value)?;
                RowPredicate::Le(column, value)
            }
            Self::Like {
                field,
                pattern,
                case_sensitive,
            } => RowPredicate::Like {
                column: column(definition, field)?.0,
                pattern: pattern.clone(),
                case_sensitive: *case_sensitive,
            },
            Self::In(field, values) => {
                let (column, field) = column(definition, field)?;
                let values = values
                    .iter()
                    .map(|value| storage_value(field, value, registry))
                    .collect::<Result<Vec<_>>>()?;
                RowPredicate::In(column, values)
            }
            Self::IsNull(field) => RowPredicate::IsNull(column(definition, field)?.0),
            Self::IsNotNull(field) => RowPredicate::IsNotNull(column(definition, field)?.0),
            Self::IdEq(id) => RowPredicate::IdEq(*id),
            Self::And(restrictions) => RowPredicate::And(
                restrictions
                    .iter()
                    .map(|r| r.to_predicate(definition, registry))
                    .collect::<Result<_>>()?,
            ),
            Self::Or(restrictions) => RowPredicate::Or(
                restrictions
                    .iter()
                    .map(|r| r.to_predicate(definition, registry))
                    .collect::<Result<_>>()?,
            ),
            Self::Not(restriction) => RowPredicate::Not(Box::new(restriction.to_predicate(definition, registry)?)),
        })
    }
}

fn column<'a>(definition: &'a DataDefinition, field: &str) -> Result<(usize, &'a FieldDefinition)> {
    let field_definition = definition.get_field(field)?;
    let column = definition.column_index(field).ok_or_else(|| {
        DataError::TypeMismatch(format!(
            "field '{}' of '{}' has no column to query",
            field,
            definition.name()
        ))
    })?;
    Ok((column, field_definition))
}

fn storage_value(field: &FieldDefinition, value: &FieldValue, registry: &SchemaRegistry) -> Result<Value> {
    match field.field_type().to_criteria(value.clone(), registry)? {
        Ok(stored) => Ok(stored),
        Err(error) => Err(DataError::TypeMismatch(format!(
            "criteria value {} for field '{}' rejected: {}",
            value.kind_name(),
            field.name(),
            error
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Field name, or `id`.
    pub field: String,
    pub ascending: bool,
}

/// Filter, order, page and projection for `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    restrictions: Vec<Restriction>,
    orders: Vec<Order>,
    first_result: usize,
    max_results: Option<usize>,
    projection: Option<Vec<String>>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrictions are conjunctive.
    pub fn add(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    pub fn order_asc(mut self, field: impl Into<String>) -> Self {
        self.orders.push(Order {
            field: field.into(),
            ascending: true,
        });
        self
    }

    pub fn order_desc(mut self, field: impl Into<String>) -> Self {
        self.orders.push(Order {
            field: field.into(),
            ascending: false,
        });
        self
    }

    pub fn first_result(mut self, offset: usize) -> Self {
        self.first_result = offset;
        self
    }

    pub fn max_results(mut self, limit: usize) -> Self {
        self.max_results = Some(limit);
        self
    }

    /// Only these fields are materialized, in this order.
    pub fn projection<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn projected_fields(&self) -> Option<&[String]> {
        self.projection.as_deref()
    }

    /// Storage form of the criteria, plus the field index of every column
    /// the resulting rows carry.
    pub fn to_row_query(&self, definition: &DataDefinition, registry: &SchemaRegistry) -> Result<(RowQuery, Vec<usize>)> {
        let mut query = RowQuery::default().offset(self.first_result);
        if let Some(limit) = self.max_results {
            query = query.limit(limit);
        }

        for restriction in &self.restrictions {
            query = query.filter(restriction.to_predicate(definition, registry)?);
        }

        if self.orders.is_empty() {
            if let Some(priority) = definition.priority_field() {
                let (column, _) = column(definition, priority.name())?;
                query = query.sort(SortKey::new(SortColumn::Column(column), false));
            }
        }
        for order in &self.orders {
            let sort_column = if order.field == "id" {
                SortColumn::Id
            } else {
                SortColumn::Column(column(definition, &order.field)?.0)
            };
            query = query.sort(SortKey::new(sort_column, !order.ascending));
        }
        // id keeps the order total
        query = query.sort(SortKey::new(SortColumn::Id, false));

        let fields = match &self.projection {
            Some(projection) => {
                let mut columns = Vec::with_capacity(projection.len());
                let mut fields = Vec::with_capacity(projection.len());
                for name in projection {
                    columns.push(column(definition, name)?.0);
                    fields.extend(definition.fields().iter().position(|f| f.name() == name.as_str()));
                }
                query = query.project(columns);
                fields
            }
            None => definition.column_fields().to_vec(),
        };

        Ok((query, fields))
    }
}

/// A page of entities plus the number of matches before pagination.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub entities: Vec<Entity>,
    pub total_entities: usize,
}

impl SearchResult {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn first(&self) -> Option<&Entity> {
        self.entities.first()
    }
}
