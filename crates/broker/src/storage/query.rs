//! Backend-agnostic query construction
//!
//! [`QueryBuilder`] holds a small statement AST (table, columns, values,
//! joins, WHERE/HAVING conditions, grouping, ordering, limit) and renders it
//! for a [`Dialect`] into SQL text plus positional parameters.

use anyhow::{Result, bail};
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{Connection, Row, params_from_iter};

use super::dialect::Dialect;

/// A bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::from(*i),
            SqlValue::Real(f) => ToSqlOutput::from(*f),
            SqlValue::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlValue::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOperator {
    Equals,
    NotEquals,
    Is,
    IsNot,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    In,
    NotIn,
    Like,
}

impl CompareOperator {
    fn sql(&self) -> &'static str {
        match self {
            CompareOperator::Equals => "=",
            CompareOperator::NotEquals => "<>",
            CompareOperator::Is => "IS",
            CompareOperator::IsNot => "IS NOT",
            CompareOperator::Less => "<",
            CompareOperator::LessOrEqual => "<=",
            CompareOperator::Greater => ">",
            CompareOperator::GreaterOrEqual => ">=",
            CompareOperator::In => "IN",
            CompareOperator::NotIn => "NOT IN",
            CompareOperator::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(SqlValue),
    Values(Vec<SqlValue>),
    Column(String),
    SubQuery(Box<QueryBuilder>),
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Compare {
        column: String,
        op: CompareOperator,
        operand: Operand,
    },
    Nested(Condition),
}

/// A WHERE/HAVING/ON expression: terms joined by one logic operator
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    logic: LogicOperator,
    terms: Vec<Term>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::and()
    }
}

impl Condition {
    pub fn and() -> Self {
        Self {
            logic: LogicOperator::And,
            terms: Vec::new(),
        }
    }

    pub fn or() -> Self {
        Self {
            logic: LogicOperator::Or,
            terms: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// `column <op> value`
    pub fn value(mut self, column: &str, op: CompareOperator, value: impl Into<SqlValue>) -> Self {
        self.terms.push(Term::Compare {
            column: column.to_string(),
            op,
            operand: Operand::Value(value.into()),
        });
        self
    }

    /// `column IN (values...)` or `NOT IN`
    pub fn values<V: Into<SqlValue>>(
        mut self,
        column: &str,
        op: CompareOperator,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.terms.push(Term::Compare {
            column: column.to_string(),
            op,
            operand: Operand::Values(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// `column <op> other_column`
    pub fn column(mut self, column: &str, op: CompareOperator, other: &str) -> Self {
        self.terms.push(Term::Compare {
            column: column.to_string(),
            op,
            operand: Operand::Column(other.to_string()),
        });
        self
    }

    /// `column <op> (SELECT ...)`
    pub fn sub_query(mut self, column: &str, op: CompareOperator, query: QueryBuilder) -> Self {
        self.terms.push(Term::Compare {
            column: column.to_string(),
            op,
            operand: Operand::SubQuery(Box::new(query)),
        });
        self
    }

    /// Nest another condition as a parenthesized term
    pub fn nested(mut self, condition: Condition) -> Self {
        if !condition.is_empty() {
            self.terms.push(Term::Nested(condition));
        }
        self
    }

    fn render(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        let glue = match self.logic {
            LogicOperator::And => " AND ",
            LogicOperator::Or => " OR ",
        };
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                out.push_str(glue);
            }
            match term {
                Term::Nested(inner) => {
                    out.push('(');
                    inner.render(dialect, out, params)?;
                    out.push(')');
                }
                Term::Compare {
                    column,
                    op,
                    operand,
                } => render_compare(dialect, column, *op, operand, out, params)?,
            }
        }
        Ok(())
    }
}

fn render_compare(
    dialect: Dialect,
    column: &str,
    op: CompareOperator,
    operand: &Operand,
    out: &mut String,
    params: &mut Vec<SqlValue>,
) -> Result<()> {
    match operand {
        Operand::Value(SqlValue::Null) => {
            let op = match op {
                CompareOperator::Equals | CompareOperator::Is => "IS",
                CompareOperator::NotEquals | CompareOperator::IsNot => "IS NOT",
                other => bail!("Cannot compare {} against NULL with {:?}", column, other),
            };
            out.push_str(&format!("{} {} NULL", column, op));
        }
        Operand::Value(value) => {
            params.push(value.clone());
            out.push_str(&format!(
                "{} {} {}",
                column,
                op.sql(),
                dialect.placeholder(params.len())
            ));
        }
        Operand::Values(values) => {
            if !matches!(op, CompareOperator::In | CompareOperator::NotIn) {
                bail!("Value lists need IN or NOT IN, got {:?}", op);
            }
            if values.is_empty() {
                // IN () is not valid SQL
                out.push_str(if op == CompareOperator::In { "1 = 0" } else { "1 = 1" });
                return Ok(());
            }
            let mut placeholders = Vec::with_capacity(values.len());
            for value in values {
                params.push(value.clone());
                placeholders.push(dialect.placeholder(params.len()));
            }
            out.push_str(&format!("{} {} ({})", column, op.sql(), placeholders.join(", ")));
        }
        Operand::Column(other) => {
            out.push_str(&format!("{} {} {}", column, op.sql(), other));
        }
        Operand::SubQuery(query) => {
            out.push_str(&format!("{} {} (", column, op.sql()));
            query.render(dialect, out, params)?;
            out.push(')');
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct Join {
    kind: JoinType,
    table: String,
    on: Condition,
}

/// Rendered SQL with its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn execute(&self, conn: &Connection) -> Result<usize> {
        Ok(conn.execute(&self.sql, params_from_iter(self.params.iter()))?)
    }

    pub fn query<T>(
        &self,
        conn: &Connection,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare_cached(&self.sql)?;
        let rows = stmt
            .query_map(params_from_iter(self.params.iter()), map)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Statement AST
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBuilder {
    kind: QueryType,
    table: String,
    columns: Vec<String>,
    values: Vec<(String, SqlValue)>,
    joins: Vec<Join>,
    conditions: Condition,
    group_by: Vec<String>,
    having: Condition,
    order_by: Vec<(String, SortOrder)>,
    limit: Option<i64>,
    distinct: bool,
    for_update: bool,
    /// Primary key column used when a statement has to be rewritten
    id_column: String,
}

impl QueryBuilder {
    fn new(kind: QueryType, table: &str) -> Self {
        Self {
            kind,
            table: table.to_string(),
            columns: Vec::new(),
            values: Vec::new(),
            joins: Vec::new(),
            conditions: Condition::and(),
            group_by: Vec::new(),
            having: Condition::and(),
            order_by: Vec::new(),
            limit: None,
            distinct: false,
            for_update: false,
            id_column: "id".to_string(),
        }
    }

    pub fn select(table: &str) -> Self {
        Self::new(QueryType::Select, table)
    }

    pub fn insert(table: &str) -> Self {
        Self::new(QueryType::Insert, table)
    }

    pub fn update(table: &str) -> Self {
        Self::new(QueryType::Update, table)
    }

    pub fn delete(table: &str) -> Self {
        Self::new(QueryType::Delete, table)
    }

    pub fn kind(&self) -> QueryType {
        self.kind
    }

    pub fn column(mut self, column: &str) -> Self {
        self.columns.push(column.to_string());
        self
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    /// Column value for INSERT/UPDATE
    pub fn value(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.values.push((column.to_string(), value.into()));
        self
    }

    pub fn join(mut self, kind: JoinType, table: &str, on: Condition) -> Self {
        self.joins.push(Join {
            kind,
            table: table.to_string(),
            on,
        });
        self
    }

    /// Replace the top-level WHERE condition
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions = condition;
        self
    }

    /// AND a comparison into the WHERE clause
    pub fn where_value(
        mut self,
        column: &str,
        op: CompareOperator,
        value: impl Into<SqlValue>,
    ) -> Self {
        self.conditions = self.conditions.value(column, op, value);
        self
    }

    pub fn where_in<V: Into<SqlValue>>(
        mut self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions = self.conditions.values(column, CompareOperator::In, values);
        self
    }

    pub fn where_column(mut self, column: &str, op: CompareOperator, other: &str) -> Self {
        self.conditions = self.conditions.column(column, op, other);
        self
    }

    pub fn where_condition(mut self, condition: Condition) -> Self {
        self.conditions = self.conditions.nested(condition);
        self
    }

    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by.push(column.to_string());
        self
    }

    pub fn having(mut self, condition: Condition) -> Self {
        self.having = condition;
        self
    }

    pub fn order_by(mut self, column: &str, order: SortOrder) -> Self {
        self.order_by.push((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Lock selected rows where the backend supports it
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn id_column(mut self, column: &str) -> Self {
        self.id_column = column.to_string();
        self
    }

    /// Render for a dialect
    pub fn build(&self, dialect: Dialect) -> Result<Statement> {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(dialect, &mut sql, &mut params)?;
        Ok(Statement { sql, params })
    }

    /// Render and run against SQLite, returning affected rows
    pub fn exec(&self, conn: &Connection) -> Result<usize> {
        self.build(Dialect::Sqlite)?.execute(conn)
    }

    /// Render and run an INSERT against SQLite, returning the new row id
    pub fn insert_id(&self, conn: &Connection) -> Result<i64> {
        if self.kind != QueryType::Insert {
            bail!("insert_id called on a {:?} statement", self.kind);
        }
        self.build(Dialect::Sqlite)?.execute(conn)?;
        Ok(conn.last_insert_rowid())
    }

    /// Render and run a SELECT against SQLite
    pub fn query<T>(
        &self,
        conn: &Connection,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        self.build(Dialect::Sqlite)?.query(conn, map)
    }

    fn render(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        match self.kind {
            QueryType::Select => self.render_select(dialect, out, params),
            QueryType::Insert => self.render_insert(dialect, out, params),
            QueryType::Update => self.render_update(dialect, out, params),
            QueryType::Delete => self.render_delete(dialect, out, params),
        }
    }

    fn render_joins(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        for join in &self.joins {
            out.push_str(match join.kind {
                JoinType::Inner => " INNER JOIN ",
                JoinType::Left => " LEFT JOIN ",
            });
            out.push_str(&join.table);
            out.push_str(" ON ");
            join.on.render(dialect, out, params)?;
        }
        Ok(())
    }

    fn render_where(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        if !self.conditions.is_empty() {
            out.push_str(" WHERE ");
            self.conditions.render(dialect, out, params)?;
        }
        Ok(())
    }

    fn render_select(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        if self.columns.is_empty() {
            bail!("SELECT on {} without columns", self.table);
        }
        out.push_str("SELECT ");
        if self.distinct {
            out.push_str("DISTINCT ");
        }
        out.push_str(&self.columns.join(", "));
        out.push_str(" FROM ");
        out.push_str(&self.table);
        self.render_joins(dialect, out, params)?;
        self.render_where(dialect, out, params)?;
        if !self.group_by.is_empty() {
            out.push_str(" GROUP BY ");
            out.push_str(&self.group_by.join(", "));
        }
        if !self.having.is_empty() {
            out.push_str(" HAVING ");
            self.having.render(dialect, out, params)?;
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|(col, dir)| match dir {
                    SortOrder::Ascending => format!("{} ASC", col),
                    SortOrder::Descending => format!("{} DESC", col),
                })
                .collect();
            out.push_str(" ORDER BY ");
            out.push_str(&order.join(", "));
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!(" LIMIT {}", limit));
        }
        if self.for_update && dialect.supports_for_update() {
            out.push_str(" FOR UPDATE");
        }
        Ok(())
    }

    fn render_insert(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        if self.values.is_empty() {
            out.push_str(&format!("INSERT INTO {} DEFAULT VALUES", self.table));
        } else {
            let columns: Vec<&str> = self.values.iter().map(|(c, _)| c.as_str()).collect();
            let mut placeholders = Vec::with_capacity(self.values.len());
            for (_, value) in &self.values {
                params.push(value.clone());
                placeholders.push(dialect.placeholder(params.len()));
            }
            out.push_str(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table,
                columns.join(", "),
                placeholders.join(", ")
            ));
        }
        if dialect == Dialect::PostgreSql {
            out.push_str(&format!(" RETURNING {}", self.id_column));
        }
        Ok(())
    }

    fn render_assignments(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        if self.values.is_empty() {
            bail!("UPDATE on {} without values", self.table);
        }
        let mut sets = Vec::with_capacity(self.values.len());
        for (column, value) in &self.values {
            params.push(value.clone());
            sets.push(format!("{} = {}", column, dialect.placeholder(params.len())));
        }
        out.push_str(" SET ");
        out.push_str(&sets.join(", "));
        Ok(())
    }

    /// Row selection for statements that cannot join directly
    fn id_sub_select(&self) -> QueryBuilder {
        let mut sub = QueryBuilder::select(&self.table)
            .column(&format!("{}.{}", self.table, self.id_column))
            .filter(self.conditions.clone());
        sub.joins = self.joins.clone();
        sub
    }

    fn render_update(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        if self.joins.is_empty() {
            out.push_str(&format!("UPDATE {}", self.table));
            self.render_assignments(dialect, out, params)?;
            return self.render_where(dialect, out, params);
        }

        match dialect {
            Dialect::MySql => {
                out.push_str(&format!("UPDATE {}", self.table));
                self.render_joins(dialect, out, params)?;
                self.render_assignments(dialect, out, params)?;
                self.render_where(dialect, out, params)
            }
            Dialect::PostgreSql => {
                out.push_str(&format!("UPDATE {}", self.table));
                self.render_assignments(dialect, out, params)?;
                let tables: Vec<&str> = self.joins.iter().map(|j| j.table.as_str()).collect();
                out.push_str(" FROM ");
                out.push_str(&tables.join(", "));
                let mut condition = Condition::and();
                for join in &self.joins {
                    condition = condition.nested(join.on.clone());
                }
                condition = condition.nested(self.conditions.clone());
                out.push_str(" WHERE ");
                condition.render(dialect, out, params)
            }
            Dialect::Sqlite => {
                // SQLite has no UPDATE ... JOIN; select the target ids instead
                out.push_str(&format!("UPDATE {}", self.table));
                self.render_assignments(dialect, out, params)?;
                out.push_str(&format!(" WHERE {} IN (", self.id_column));
                self.id_sub_select().render(dialect, out, params)?;
                out.push(')');
                Ok(())
            }
        }
    }

    fn render_delete(&self, dialect: Dialect, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        out.push_str(&format!("DELETE FROM {}", self.table));
        if self.joins.is_empty() {
            return self.render_where(dialect, out, params);
        }
        out.push_str(&format!(" WHERE {} IN (", self.id_column));
        self.id_sub_select().render(dialect, out, params)?;
        out.push(')');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CompareOperator::*;

    #[test]
    fn test_select_with_nested_conditions() {
        let stmt = QueryBuilder::select("items")
            .columns(&["items.id", "items.rev"])
            .join(
                JoinType::Inner,
                "collections",
                Condition::and().column("collections.id", Equals, "items.collection_id"),
            )
            .where_value("collections.resource_id", Equals, 3i64)
            .where_condition(
                Condition::or()
                    .value("items.remote_id", Equals, "a")
                    .value("items.remote_id", Is, SqlValue::Null),
            )
            .order_by("items.id", SortOrder::Ascending)
            .limit(10)
            .build(Dialect::Sqlite)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT items.id, items.rev FROM items INNER JOIN collections ON collections.id = items.collection_id \
             WHERE collections.resource_id = ?1 AND (items.remote_id = ?2 OR items.remote_id IS NULL) \
             ORDER BY items.id ASC LIMIT 10"
        );
        assert_eq!(stmt.params, vec![SqlValue::Integer(3), SqlValue::Text("a".into())]);
    }

    #[test]
    fn test_postgres_placeholders_and_returning() {
        let stmt = QueryBuilder::insert("tags")
            .value("gid", "important")
            .value("type_id", 1i64)
            .build(Dialect::PostgreSql)
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO tags (gid, type_id) VALUES ($1, $2) RETURNING id"
        );
    }

    #[test]
    fn test_empty_in_list() {
        let stmt = QueryBuilder::delete("parts")
            .where_in("item_id", Vec::<i64>::new())
            .build(Dialect::Sqlite)
            .unwrap();
        assert_eq!(stmt.sql, "DELETE FROM parts WHERE 1 = 0");
    }

    #[test]
    fn test_update_join_per_dialect() {
        let query = QueryBuilder::update("items")
            .value("dirty", true)
            .join(
                JoinType::Inner,
                "collections",
                Condition::and().column("collections.id", Equals, "items.collection_id"),
            )
            .where_value("collections.resource_id", Equals, 2i64);

        assert_eq!(
            query.build(Dialect::Sqlite).unwrap().sql,
            "UPDATE items SET dirty = ?1 WHERE id IN (SELECT items.id FROM items INNER JOIN collections \
             ON collections.id = items.collection_id WHERE collections.resource_id = ?2)"
        );
        assert_eq!(
            query.build(Dialect::MySql).unwrap().sql,
            "UPDATE items INNER JOIN collections ON collections.id = items.collection_id SET dirty = ? \
             WHERE collections.resource_id = ?"
        );
        assert_eq!(
            query.build(Dialect::PostgreSql).unwrap().sql,
            "UPDATE items SET dirty = $1 FROM collections WHERE (collections.id = items.collection_id) \
             AND (collections.resource_id = $2)"
        );
    }

    #[test]
    fn test_group_having_and_sub_query() {
        let busiest = QueryBuilder::select("items")
            .columns(&["collection_id", "COUNT(*)"])
            .group_by("collection_id")
            .having(Condition::and().value("COUNT(*)", Greater, 5i64));
        let stmt = QueryBuilder::select("collections")
            .column("name")
            .filter(Condition::and().sub_query("id", In, busiest.clone().columns(&[])))
            .build(Dialect::Sqlite);
        assert!(stmt.is_ok());

        let sql = busiest.build(Dialect::Sqlite).unwrap().sql;
        assert_eq!(
            sql,
            "SELECT collection_id, COUNT(*) FROM items GROUP BY collection_id HAVING COUNT(*) > ?1"
        );
    }

    #[test]
    fn test_for_update_only_where_supported() {
        let query = QueryBuilder::select("items").column("rev").where_value("id", Equals, 1i64).for_update();
        assert!(!query.build(Dialect::Sqlite).unwrap().sql.contains("FOR UPDATE"));
        assert!(query.build(Dialect::MySql).unwrap().sql.ends_with("FOR UPDATE"));
    }

    #[test]
    fn test_null_comparison_rejects_ordering_operator() {
        let result = QueryBuilder::select("items")
            .column("id")
            .where_value("size", Greater, SqlValue::Null)
            .build(Dialect::Sqlite);
        assert!(result.is_err());
    }

    #[test]
    fn test_runs_against_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        let id = QueryBuilder::insert("t").value("name", "a").insert_id(&conn).unwrap();
        QueryBuilder::insert("t").value("name", "b").exec(&conn).unwrap();
        let names = QueryBuilder::select("t")
            .column("name")
            .where_value("id", GreaterOrEqual, id)
            .order_by("name", SortOrder::Descending)
            .query(&conn, |row| row.get::<_, String>(0))
            .unwrap();
        assert_eq!(names, vec!["b", "a"]);
    }
}
