/// Query Builder Module
///
/// Structured construction of read queries and of the INSERT, UPDATE and
/// DELETE statements the execution engine issues. Nothing here touches a
/// connection: every builder serializes to a [`Statement`], a text template
/// with `?N` placeholders plus the values bound to them in order.
///
/// Literal values never appear in statement text. Identifiers are quoted
/// with backticks unless the caller explicitly opts out, which is a trust
/// boundary for aggregate and function expressions built from validated
/// input only.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rusqlite::types::Value;
use std::fmt;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\?(\d+)").expect("placeholder pattern is valid"));

/// Quotes an identifier, doubling embedded backticks.
///
/// Dots separate qualifiers, so `channel.channel_name` becomes
/// `` `channel`.`channel_name` ``.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Renders a value as an SQL literal for log output.
pub fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02X}", byte)).collect();
            format!("X'{}'", hex)
        }
    }
}

/// A serialized statement: template text and its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement text with `?1..?N` placeholders
    pub text: String,
    /// Values bound to the placeholders, in placeholder order
    pub params: Vec<Value>,
}

impl Statement {
    /// Creates a statement without bound values
    pub fn new(text: impl Into<String>) -> Self {
        Statement {
            text: text.into(),
            params: Vec::new(),
        }
    }

    /// Creates a statement with bound values
    pub fn with_params(text: impl Into<String>, params: Vec<Value>) -> Self {
        Statement {
            text: text.into(),
            params,
        }
    }

    /// Returns the statement with every placeholder replaced by its escaped
    /// literal. Only meant for logs; execution always binds.
    pub fn render(&self) -> String {
        PLACEHOLDER
            .replace_all(&self.text, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|index| self.params.get(index))
                    .map(render_literal)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Pushes a value and returns its placeholder.
fn bind(params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    format!("?{}", params.len())
}

/// One side of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A value, always bound as a parameter
    Literal(Value),
    /// An identifier, quoted on output
    Column(String),
    /// An expression emitted verbatim
    Raw(String),
}

impl Operand {
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    pub fn column(name: impl Into<String>) -> Self {
        Operand::Column(name.into())
    }

    pub fn raw(expr: impl Into<String>) -> Self {
        Operand::Raw(expr.into())
    }

    fn write(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Operand::Literal(value) => sql.push_str(&bind(params, value.clone())),
            Operand::Column(name) => sql.push_str(&quote_identifier(name)),
            Operand::Raw(expr) => sql.push_str(expr),
        }
    }
}

/// Comparison operators a condition may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
    Is,
    IsNot,
}

impl Comparator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::NotEq => "!=",
            Comparator::Lt => "<",
            Comparator::LtEq => "<=",
            Comparator::Gt => ">",
            Comparator::GtEq => ">=",
            Comparator::Like => "LIKE",
            Comparator::NotLike => "NOT LIKE",
            Comparator::Is => "IS",
            Comparator::IsNot => "IS NOT",
        }
    }
}

/// A single `left <op> right` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub left: Operand,
    pub comparator: Comparator,
    pub right: Operand,
}

impl Condition {
    pub fn new(left: Operand, comparator: Comparator, right: Operand) -> Self {
        Condition {
            left,
            comparator,
            right,
        }
    }

    /// `column = value`, the common lookup shape
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::new(Operand::column(column), Comparator::Eq, Operand::literal(value))
    }

    /// `left = right` between two columns, typically a join condition
    pub fn columns_eq(left: impl Into<String>, right: impl Into<String>) -> Self {
        Condition::new(Operand::column(left), Comparator::Eq, Operand::column(right))
    }

    fn write(&self, sql: &mut String, params: &mut Vec<Value>) {
        self.left.write(sql, params);
        sql.push(' ');
        sql.push_str(self.comparator.as_sql());
        sql.push(' ');
        self.right.write(sql, params);
    }
}

/// Writes `keyword c1 AND c2 ...`, or nothing for an empty list.
fn write_conditions(
    sql: &mut String,
    keyword: &str,
    conditions: &[Condition],
    params: &mut Vec<Value>,
) {
    for (i, condition) in conditions.iter().enumerate() {
        sql.push_str(if i == 0 { keyword } else { " AND " });
        condition.write(sql, params);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
            JoinKind::RightOuter => "RIGHT OUTER JOIN",
            JoinKind::FullOuter => "FULL OUTER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub on: Condition,
}

/// An ORDER BY entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub column: String,
    pub ascending: bool,
    pub escape: bool,
}

impl OrderSpec {
    pub fn new(column: impl Into<String>, ascending: bool) -> Self {
        OrderSpec {
            column: column.into(),
            ascending,
            escape: true,
        }
    }

    /// Orders by an expression emitted verbatim.
    pub fn unescaped(expr: impl Into<String>, ascending: bool) -> Self {
        OrderSpec {
            column: expr.into(),
            ascending,
            escape: false,
        }
    }

    fn to_sql(&self) -> String {
        let column = if self.escape {
            quote_identifier(&self.column)
        } else {
            self.column.clone()
        };
        format!("{} {}", column, if self.ascending { "ASC" } else { "DESC" })
    }
}

/// Placement of HAVING relative to ORDER BY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClauseOrder {
    /// GROUP BY, HAVING, ORDER BY
    #[default]
    Standard,
    /// GROUP BY, ORDER BY, HAVING: the text older bot releases generated.
    /// Kept for comparing or logging statements against that text; SQLite
    /// rejects it when both clauses are present.
    Legacy,
}

/// A read query under construction.
///
/// Conditions are always AND-combined, in the order they were added. A
/// limit of 0 means "no LIMIT clause", not "zero rows"; an offset of 0
/// omits OFFSET.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    fields: Vec<String>,
    escape_fields: bool,
    from: Option<String>,
    joins: Vec<Join>,
    wheres: Vec<Condition>,
    groups: Vec<String>,
    havings: Vec<Condition>,
    orders: Vec<OrderSpec>,
    limit: usize,
    offset: usize,
    clause_order: ClauseOrder,
}

impl SelectQuery {
    /// Creates a query over the given output fields
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SelectQuery {
            fields: fields.into_iter().map(Into::into).collect(),
            escape_fields: true,
            from: None,
            joins: Vec::new(),
            wheres: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            orders: Vec::new(),
            limit: 0,
            offset: 0,
            clause_order: ClauseOrder::Standard,
        }
    }

    /// Disables identifier quoting of the output fields when `false`.
    ///
    /// Needed for `COUNT(*)` and other expressions. The fields are then
    /// emitted verbatim, so they must never carry untrusted input.
    pub fn escape_fields(mut self, escape: bool) -> Self {
        self.escape_fields = escape;
        self
    }

    pub fn from(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        self.from = if table.is_empty() { None } else { Some(table) };
        self
    }

    pub fn join(mut self, table: impl Into<String>, kind: JoinKind, on: Condition) -> Self {
        self.joins.push(Join {
            kind,
            table: table.into(),
            on,
        });
        self
    }

    /// Appends conditions, AND-combined with any already present.
    pub fn and_where<I>(mut self, conditions: I) -> Self
    where
        I: IntoIterator<Item = Condition>,
    {
        self.wheres.extend(conditions);
        self
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.groups.push(column.into());
        self
    }

    pub fn having(mut self, condition: Condition) -> Self {
        self.havings.push(condition);
        self
    }

    pub fn order_by(mut self, order: OrderSpec) -> Self {
        self.orders.push(order);
        self
    }

    pub fn limit(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn legacy_clause_order(mut self) -> Self {
        self.clause_order = ClauseOrder::Legacy;
        self
    }

    /// Serializes the query. Pure and deterministic.
    pub fn serialize(&self) -> Statement {
        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");

        if self.fields.is_empty() {
            sql.push('*');
        } else {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|f| {
                    if self.escape_fields {
                        quote_identifier(f)
                    } else {
                        f.clone()
                    }
                })
                .collect();
            sql.push_str(&fields.join(", "));
        }

        if let Some(from) = &self.from {
            sql.push_str(" FROM ");
            sql.push_str(&quote_identifier(from));
        }

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join.kind.as_sql());
            sql.push(' ');
            sql.push_str(&quote_identifier(&join.table));
            sql.push_str(" ON ");
            join.on.write(&mut sql, &mut params);
        }

        write_conditions(&mut sql, " WHERE ", &self.wheres, &mut params);

        if !self.groups.is_empty() {
            let groups: Vec<String> = self.groups.iter().map(|g| quote_identifier(g)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }

        match self.clause_order {
            ClauseOrder::Standard => {
                write_conditions(&mut sql, " HAVING ", &self.havings, &mut params);
                self.write_orders(&mut sql);
            }
            ClauseOrder::Legacy => {
                self.write_orders(&mut sql);
                write_conditions(&mut sql, " HAVING ", &self.havings, &mut params);
            }
        }

        if self.limit != 0 {
            sql.push_str(&format!(" LIMIT {}", self.limit));
        } else if self.offset != 0 && self.clause_order == ClauseOrder::Standard {
            // SQLite only accepts OFFSET after a LIMIT
            sql.push_str(" LIMIT -1");
        }
        if self.offset != 0 {
            sql.push_str(&format!(" OFFSET {}", self.offset));
        }

        Statement::with_params(sql, params)
    }

    fn write_orders(&self, sql: &mut String) {
        if !self.orders.is_empty() {
            let orders: Vec<String> = self.orders.iter().map(OrderSpec::to_sql).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize().text)
    }
}

/// `INSERT INTO table VALUES (...)`, positional over all columns.
pub fn insert_statement(table: &str, values: &[Value]) -> Statement {
    let mut params = Vec::new();
    let mut sql = format!("INSERT INTO {}", quote_identifier(table));
    if values.is_empty() {
        sql.push_str(" DEFAULT VALUES");
    } else {
        let placeholders: Vec<String> =
            values.iter().map(|v| bind(&mut params, v.clone())).collect();
        sql.push_str(&format!(" VALUES ({})", placeholders.join(", ")));
    }
    Statement::with_params(sql, params)
}

/// `UPDATE table SET ... WHERE ...`, touching at most `limit` rows when
/// `limit` is non-zero.
pub fn update_statement(
    table: &str,
    items: &[(&str, Value)],
    limit: usize,
    conditions: &[Condition],
) -> Statement {
    let mut params = Vec::new();
    let assignments: Vec<String> = items
        .iter()
        .map(|(column, value)| {
            format!("{} = {}", quote_identifier(column), bind(&mut params, value.clone()))
        })
        .collect();
    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_identifier(table),
        assignments.join(", ")
    );
    write_row_filter(&mut sql, table, limit, conditions, &mut params);
    Statement::with_params(sql, params)
}

/// `DELETE FROM table WHERE ...`, removing at most `limit` rows when
/// `limit` is non-zero.
pub fn delete_statement(table: &str, limit: usize, conditions: &[Condition]) -> Statement {
    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", quote_identifier(table));
    write_row_filter(&mut sql, table, limit, conditions, &mut params);
    Statement::with_params(sql, params)
}

/// Row filter for UPDATE and DELETE. SQLite builds without
/// `SQLITE_ENABLE_UPDATE_DELETE_LIMIT` reject a trailing LIMIT, so a bounded
/// statement selects its target rowids instead.
fn write_row_filter(
    sql: &mut String,
    table: &str,
    limit: usize,
    conditions: &[Condition],
    params: &mut Vec<Value>,
) {
    if limit == 0 {
        write_conditions(sql, " WHERE ", conditions, params);
        return;
    }
    sql.push_str(" WHERE rowid IN (SELECT rowid FROM ");
    sql.push_str(&quote_identifier(table));
    write_conditions(sql, " WHERE ", conditions, params);
    sql.push_str(&format!(" LIMIT {})", limit));
}
