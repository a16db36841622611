//! Query descriptors and their translation into watch targets.
//!
//! A [`QueryDescriptor`] is the normalized description of a query: where it
//! reads from, its filters, explicit ordering, limit and cursors.
//! [`translate_query`] validates it and produces a [`QueryTarget`], which
//! carries the canonical id used to share one server-side target between
//! identical queries and the effective order that parametrizes the
//! comparator.

use crate::error::{ProtocolError, ProtocolResult};
use crate::path::{FieldPath, ResourcePath};
use docwatch_codec::Value;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Sort direction of an order term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

impl Direction {
    fn canonical(self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }
}

/// One `orderBy` term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    /// Field to order by.
    pub field: FieldPath,
    /// Direction.
    pub direction: Direction,
}

impl OrderBy {
    /// Creates an order term.
    pub fn new(field: impl Into<FieldPath>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Ascending order on `field`.
    pub fn asc(field: impl Into<FieldPath>) -> Self {
        Self::new(field, Direction::Ascending)
    }

    /// Descending order on `field`.
    pub fn desc(field: impl Into<FieldPath>) -> Self {
        Self::new(field, Direction::Descending)
    }
}

/// Comparison operators for field filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldOperator {
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `array-contains`
    ArrayContains,
    /// `in`
    In,
    /// `array-contains-any`
    ArrayContainsAny,
    /// `not-in`
    NotIn,
}

impl FieldOperator {
    /// Whether this operator constrains a range rather than a point.
    pub fn is_inequality(self) -> bool {
        matches!(
            self,
            FieldOperator::LessThan
                | FieldOperator::LessThanOrEqual
                | FieldOperator::GreaterThan
                | FieldOperator::GreaterThanOrEqual
                | FieldOperator::NotEqual
                | FieldOperator::NotIn
        )
    }

    fn canonical(self) -> &'static str {
        match self {
            FieldOperator::LessThan => "<",
            FieldOperator::LessThanOrEqual => "<=",
            FieldOperator::GreaterThan => ">",
            FieldOperator::GreaterThanOrEqual => ">=",
            FieldOperator::Equal => "==",
            FieldOperator::NotEqual => "!=",
            FieldOperator::ArrayContains => "array-contains",
            FieldOperator::In => "in",
            FieldOperator::ArrayContainsAny => "array-contains-any",
            FieldOperator::NotIn => "not-in",
        }
    }
}

/// Operators for filters that take no operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    /// Field is null.
    IsNull,
    /// Field is NaN.
    IsNan,
    /// Field is not null.
    IsNotNull,
    /// Field is not NaN.
    IsNotNan,
}

impl UnaryOperator {
    /// The negated forms are inequalities.
    pub fn is_inequality(self) -> bool {
        matches!(self, UnaryOperator::IsNotNull | UnaryOperator::IsNotNan)
    }

    fn canonical(self) -> &'static str {
        match self {
            UnaryOperator::IsNull => "is_null",
            UnaryOperator::IsNan => "is_nan",
            UnaryOperator::IsNotNull => "is_not_null",
            UnaryOperator::IsNotNan => "is_not_nan",
        }
    }
}

/// How composite filters combine their children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    /// All children must match.
    And,
    /// Any child must match.
    Or,
}

/// A query filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `field <op> value`.
    Field {
        /// Filtered field.
        field: FieldPath,
        /// Operator.
        op: FieldOperator,
        /// Operand.
        value: Value,
    },
    /// `field <op>` with no operand.
    Unary {
        /// Filtered field.
        field: FieldPath,
        /// Operator.
        op: UnaryOperator,
    },
    /// Conjunction or disjunction of filters.
    Composite {
        /// Combinator.
        op: CompositeOperator,
        /// Children, in declaration order.
        filters: Vec<Filter>,
    },
}

impl Filter {
    /// Field filter.
    pub fn field(field: impl Into<FieldPath>, op: FieldOperator, value: impl Into<Value>) -> Self {
        Filter::Field {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Unary filter.
    pub fn unary(field: impl Into<FieldPath>, op: UnaryOperator) -> Self {
        Filter::Unary {
            field: field.into(),
            op,
        }
    }

    /// Conjunction.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters: filters.into_iter().collect(),
        }
    }

    /// Disjunction.
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters: filters.into_iter().collect(),
        }
    }

    /// Leaf filters in declaration order, depth first.
    pub fn flatten(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Filter>) {
        match self {
            Filter::Composite { filters, .. } => {
                for f in filters {
                    f.collect_leaves(out);
                }
            }
            leaf => out.push(leaf),
        }
    }

    /// The field of an inequality leaf.
    pub fn inequality_field(&self) -> Option<&FieldPath> {
        match self {
            Filter::Field { field, op, .. } if op.is_inequality() => Some(field),
            Filter::Unary { field, op } if op.is_inequality() => Some(field),
            _ => None,
        }
    }

    fn validate(&self) -> ProtocolResult<()> {
        match self {
            Filter::Field { field, .. } | Filter::Unary { field, .. } => field.validate(),
            Filter::Composite { filters, .. } => {
                if filters.is_empty() {
                    return Err(ProtocolError::invalid_query(
                        "composite filters need at least one child",
                    ));
                }
                filters.iter().try_for_each(Filter::validate)
            }
        }
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Filter::Field { field, op, value } => {
                out.push_str(&field.canonical_string());
                out.push_str(op.canonical());
                write_canonical_value(value, out);
            }
            Filter::Unary { field, op } => {
                let _ = write!(out, "{}:{}", field, op.canonical());
            }
            Filter::Composite { op, filters } => {
                out.push_str(match op {
                    CompositeOperator::And => "and(",
                    CompositeOperator::Or => "or(",
                });
                for (i, f) in filters.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    f.write_canonical(out);
                }
                out.push(')');
            }
        }
    }
}

/// A query bound: a position in the effective order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Values for the leading order terms.
    pub values: Vec<Value>,
    /// Whether the bound sits just before the matching position (inclusive
    /// for a start cursor, exclusive for an end cursor).
    pub before: bool,
}

impl Cursor {
    /// `startAt` / `endBefore` position.
    pub fn before(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            values: values.into_iter().collect(),
            before: true,
        }
    }

    /// `startAfter` / `endAt` position.
    pub fn after(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            values: values.into_iter().collect(),
            before: false,
        }
    }

    fn write_canonical(&self, out: &mut String) {
        out.push_str(if self.before { "b:" } else { "a:" });
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_canonical_value(v, out);
        }
    }
}

/// Normalized description of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    parent: ResourcePath,
    collection_id: String,
    all_descendants: bool,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Cursor>,
    end_at: Option<Cursor>,
}

impl QueryDescriptor {
    /// Query over the collection `collection_id` under the database root.
    pub fn collection(collection_id: impl Into<String>) -> Self {
        Self {
            parent: ResourcePath::root(),
            collection_id: collection_id.into(),
            all_descendants: false,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    /// Query over every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            all_descendants: true,
            ..Self::collection(collection_id)
        }
    }

    /// Sets the parent document path.
    pub fn with_parent(mut self, parent: ResourcePath) -> Self {
        self.parent = parent;
        self
    }

    /// Adds a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a field filter.
    pub fn where_field(
        self,
        field: impl Into<FieldPath>,
        op: FieldOperator,
        value: impl Into<Value>,
    ) -> Self {
        self.filter(Filter::field(field, op, value))
    }

    /// Appends an explicit order term.
    pub fn order_by(mut self, field: impl Into<FieldPath>, direction: Direction) -> Self {
        self.order_by.push(OrderBy::new(field, direction));
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the start cursor.
    pub fn start_at(mut self, cursor: Cursor) -> Self {
        self.start_at = Some(cursor);
        self
    }

    /// Sets the end cursor.
    pub fn end_at(mut self, cursor: Cursor) -> Self {
        self.end_at = Some(cursor);
        self
    }

    /// Parent path.
    pub fn parent(&self) -> &ResourcePath {
        &self.parent
    }

    /// Collection id.
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Whether this is a collection group query.
    pub fn all_descendants(&self) -> bool {
        self.all_descendants
    }

    /// Filters, in declaration order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Explicit order terms.
    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Limit.
    pub fn limit_value(&self) -> Option<u32> {
        self.limit
    }

    /// Fields of inequality filters, in declaration order, deduplicated.
    pub fn inequality_fields(&self) -> Vec<FieldPath> {
        let mut fields: Vec<FieldPath> = Vec::new();
        for leaf in self.filters.iter().flat_map(Filter::flatten) {
            if let Some(field) = leaf.inequality_field() {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
        }
        fields
    }

    /// The order results are delivered in.
    ///
    /// Explicit terms come first. Without explicit terms every inequality
    /// field is ordered ascending, in declaration order. A `__name__` term
    /// always closes the list, taking the direction of the last term.
    pub fn effective_order_by(&self) -> Vec<OrderBy> {
        let mut terms = if self.order_by.is_empty() {
            self.inequality_fields()
                .into_iter()
                .map(OrderBy::asc)
                .collect()
        } else {
            self.order_by.clone()
        };

        if !terms.iter().any(|t| t.field.is_document_key()) {
            let direction = terms.last().map(|t| t.direction).unwrap_or_default();
            terms.push(OrderBy::new(FieldPath::document_key(), direction));
        }
        terms
    }

    /// Deterministic identity of this query, used to share targets.
    pub fn canonical_id(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.parent.canonical_string());
        out.push_str(if self.all_descendants { "|cg:" } else { "|c:" });
        out.push_str(&self.collection_id);

        out.push_str("|f:");
        for (i, f) in self.filters.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            f.write_canonical(&mut out);
        }

        out.push_str("|ob:");
        for (i, term) in self.effective_order_by().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{} {}", term.field, term.direction.canonical());
        }

        if let Some(limit) = self.limit {
            let _ = write!(out, "|l:{limit}");
        }
        if let Some(cursor) = &self.start_at {
            out.push_str("|lb:");
            cursor.write_canonical(&mut out);
        }
        if let Some(cursor) = &self.end_at {
            out.push_str("|ub:");
            cursor.write_canonical(&mut out);
        }
        out
    }

    fn validate(&self, order_by: &[OrderBy]) -> ProtocolResult<()> {
        if self.collection_id.is_empty() {
            return Err(ProtocolError::invalid_query("collection id must not be empty"));
        }
        if self.collection_id.contains('/') {
            return Err(ProtocolError::invalid_query(
                "collection id must be a single path segment",
            ));
        }
        if self.parent.len() % 2 != 0 {
            return Err(ProtocolError::invalid_query(
                "parent must be the root or a document path",
            ));
        }
        self.filters.iter().try_for_each(Filter::validate)?;
        for term in &self.order_by {
            term.field.validate()?;
        }
        for cursor in self.start_at.iter().chain(&self.end_at) {
            validate_cursor(cursor, order_by)?;
        }
        Ok(())
    }
}

fn validate_cursor(cursor: &Cursor, order_by: &[OrderBy]) -> ProtocolResult<()> {
    if cursor.values.len() > order_by.len() {
        return Err(ProtocolError::invalid_query(format!(
            "cursor has {} values but the query orders by {} fields",
            cursor.values.len(),
            order_by.len()
        )));
    }
    for (value, term) in cursor.values.iter().zip(order_by) {
        if term.field.is_document_key() && !matches!(value, Value::Reference(_)) {
            return Err(ProtocolError::invalid_query(format!(
                "cursor value for {} must be a document reference, found {}",
                term.field,
                value.type_name()
            )));
        }
    }
    Ok(())
}

/// A query ready to be watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTarget {
    /// Identity shared by identical queries.
    pub canonical_id: String,
    /// Effective order, always ending in a `__name__` term.
    pub order_by: Vec<OrderBy>,
    /// Lower bound.
    pub start_at: Option<Cursor>,
    /// Upper bound.
    pub end_at: Option<Cursor>,
    /// Result limit.
    pub limit: Option<u32>,
    /// The query as described by the caller.
    pub query: QueryDescriptor,
}

impl QueryTarget {
    /// Fields a document must have to belong to the result set: every
    /// ordered field except the document key.
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.order_by
            .iter()
            .map(|t| &t.field)
            .filter(|f| !f.is_document_key())
    }
}

/// Validates a query and computes its canonical id, effective order and
/// bounds.
pub fn translate_query(query: &QueryDescriptor) -> ProtocolResult<QueryTarget> {
    let order_by = query.effective_order_by();
    query.validate(&order_by)?;
    Ok(QueryTarget {
        canonical_id: query.canonical_id(),
        order_by,
        start_at: query.start_at.clone(),
        end_at: query.end_at.clone(),
        limit: query.limit,
        query: query.clone(),
    })
}

fn write_canonical_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Integer(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Double(d) => {
            let _ = write!(out, "{d:?}");
        }
        Value::Timestamp(t) => {
            let _ = write!(out, "time({},{})", t.seconds(), t.nanos());
        }
        Value::String(s) => {
            let _ = write!(out, "{s:?}");
        }
        Value::Bytes(b) => {
            out.push_str("bytes(");
            for byte in b {
                let _ = write!(out, "{byte:02x}");
            }
            out.push(')');
        }
        Value::Reference(path) => {
            let _ = write!(out, "ref({path})");
        }
        Value::GeoPoint {
            latitude,
            longitude,
        } => {
            let _ = write!(out, "geo({latitude:?},{longitude:?})");
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_value(item, out);
            }
            out.push(']');
        }
        Value::Vector(components) => {
            let _ = write!(out, "vector({components:?})");
        }
        Value::Map(fields) => {
            out.push('{');
            for (i, (k, v)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{k:?}:");
                write_canonical_value(v, out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(terms: &[OrderBy]) -> Vec<(String, Direction)> {
        terms
            .iter()
            .map(|t| (t.field.canonical_string(), t.direction))
            .collect()
    }

    #[test]
    fn no_order_no_filters_orders_by_key() {
        let q = QueryDescriptor::collection("rooms");
        assert_eq!(
            fields(&q.effective_order_by()),
            vec![("__name__".to_string(), Direction::Ascending)]
        );
    }

    #[test]
    fn inequality_fields_synthesized_in_declaration_order() {
        let q = QueryDescriptor::collection("cities")
            .where_field("population", FieldOperator::GreaterThan, 1000)
            .where_field("area", FieldOperator::LessThan, 50)
            .where_field("country", FieldOperator::Equal, "NZ")
            .where_field("population", FieldOperator::LessThan, 9000);

        assert_eq!(
            fields(&q.effective_order_by()),
            vec![
                ("population".to_string(), Direction::Ascending),
                ("area".to_string(), Direction::Ascending),
                ("__name__".to_string(), Direction::Ascending),
            ]
        );
    }

    #[test]
    fn inequalities_inside_composites_are_found() {
        let q = QueryDescriptor::collection("cities").filter(Filter::or([
            Filter::field("b", FieldOperator::NotEqual, 1),
            Filter::and([
                Filter::unary("a", UnaryOperator::IsNotNull),
                Filter::field("c", FieldOperator::Equal, 2),
            ]),
        ]));
        assert_eq!(
            q.inequality_fields(),
            vec![FieldPath::from("b"), FieldPath::from("a")]
        );
    }

    #[test]
    fn explicit_order_wins_and_key_inherits_last_direction() {
        let q = QueryDescriptor::collection("cities")
            .where_field("area", FieldOperator::LessThan, 50)
            .order_by("population", Direction::Descending);

        assert_eq!(
            fields(&q.effective_order_by()),
            vec![
                ("population".to_string(), Direction::Descending),
                ("__name__".to_string(), Direction::Descending),
            ]
        );
    }

    #[test]
    fn explicit_key_order_is_not_duplicated() {
        let q = QueryDescriptor::collection("cities").order_by("__name__", Direction::Descending);
        assert_eq!(q.effective_order_by().len(), 1);
    }

    #[test]
    fn canonical_id_identifies_equal_queries() {
        let a = QueryDescriptor::collection("rooms")
            .where_field("open", FieldOperator::Equal, true)
            .limit(10);
        let b = QueryDescriptor::collection("rooms")
            .where_field("open", FieldOperator::Equal, true)
            .limit(10);
        let c = QueryDescriptor::collection("rooms")
            .where_field("open", FieldOperator::Equal, false)
            .limit(10);
        let group = QueryDescriptor::collection_group("rooms")
            .where_field("open", FieldOperator::Equal, true)
            .limit(10);

        assert_eq!(a.canonical_id(), b.canonical_id());
        assert_ne!(a.canonical_id(), c.canonical_id());
        assert_ne!(a.canonical_id(), group.canonical_id());
    }

    #[test]
    fn implicit_and_explicit_key_order_share_identity() {
        let implicit = QueryDescriptor::collection("rooms");
        let explicit = QueryDescriptor::collection("rooms").order_by("__name__", Direction::Ascending);
        assert_eq!(implicit.canonical_id(), explicit.canonical_id());
    }

    #[test]
    fn translate_produces_target() {
        let q = QueryDescriptor::collection("messages")
            .with_parent(ResourcePath::parse("rooms/eros").unwrap())
            .order_by("sent", Direction::Ascending)
            .start_at(Cursor::after([Value::from(5)]))
            .limit(20);
        let target = translate_query(&q).unwrap();

        assert_eq!(target.canonical_id, q.canonical_id());
        assert_eq!(target.order_by.len(), 2);
        assert_eq!(target.limit, Some(20));
        assert_eq!(
            target.required_fields().cloned().collect::<Vec<_>>(),
            vec![FieldPath::from("sent")]
        );
    }

    #[test]
    fn translate_rejects_invalid_shapes() {
        let empty = QueryDescriptor::collection("");
        assert!(matches!(
            translate_query(&empty),
            Err(ProtocolError::InvalidQuery { .. })
        ));

        let odd_parent =
            QueryDescriptor::collection("messages").with_parent(ResourcePath::parse("rooms").unwrap());
        assert!(translate_query(&odd_parent).is_err());

        let key_cursor = QueryDescriptor::collection("rooms").start_at(Cursor::before([Value::from(1)]));
        assert!(matches!(
            translate_query(&key_cursor),
            Err(ProtocolError::InvalidQuery { .. })
        ));

        let reference_cursor = QueryDescriptor::collection("rooms")
            .start_at(Cursor::before([Value::reference("rooms/a")]));
        assert!(translate_query(&reference_cursor).is_ok());

        let too_long = QueryDescriptor::collection("rooms")
            .order_by("a", Direction::Ascending)
            .end_at(Cursor::after([
                Value::from(1),
                Value::reference("rooms/a"),
                Value::from(3),
            ]));
        assert!(translate_query(&too_long).is_err());

        let bad_field = QueryDescriptor::collection("rooms").where_field("a..b", FieldOperator::Equal, 1);
        assert!(matches!(
            translate_query(&bad_field),
            Err(ProtocolError::InvalidPath { .. })
        ));
    }
}
