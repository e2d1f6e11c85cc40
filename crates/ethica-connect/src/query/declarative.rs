//! Restricted declarative queries.
//!
//! ```text
//! SELECT <* | col, ... | AGG(col|*) [AS name], ...> FROM <table>
//!   [WHERE <col op literal | col BETWEEN a AND b> [AND ...]]
//!   [GROUP BY col] [LIMIT n] [OFFSET n]
//! ```
//!
//! Predicates translate into the same [`Filter`] a structured call builds,
//! so both land on one cache entry. Anything outside this grammar is
//! rejected as an unsupported query shape before any fetch happens.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::filter::{paginate, CompareOp, Filter, Predicate};
use crate::analytics::AggFunc;
use crate::error::ConnectorError;
use crate::record::CanonicalRecord;
use crate::schema::TableSchema;

/// Keywords that name shapes this dialect refuses to evaluate.
const REJECTED_KEYWORDS: &[&str] = &[
    "OR", "JOIN", "ORDER", "HAVING", "UNION", "DISTINCT", "NOT", "IN", "LIKE", "EXISTS",
    "INSERT", "UPDATE", "DELETE", "INTERSECT", "EXCEPT", "WITH",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectItem {
    Column {
        name: String,
    },
    Aggregate {
        func: AggFunc,
        /// `None` for `COUNT(*)`.
        #[serde(default)]
        column: Option<String>,
        #[serde(default)]
        alias: Option<String>,
    },
}

impl SelectItem {
    fn output_name(&self) -> String {
        match self {
            SelectItem::Column { name } => name.clone(),
            SelectItem::Aggregate { func, column, alias } => alias.clone().unwrap_or_else(|| {
                format!("{}({})", func.as_str(), column.as_deref().unwrap_or("*"))
            }),
        }
    }
}

/// Parsed query. Also accepted directly as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAst {
    pub table: String,
    /// Empty means `*`.
    #[serde(default)]
    pub projection: Vec<SelectItem>,
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone)]
enum Shape {
    Rows(Vec<String>),
    Aggregate {
        group_by: Option<String>,
        items: Vec<SelectItem>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
}

/// A validated query: the filter to run and how to shape its records.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub filter: Filter,
    shape: Shape,
}

impl QueryAst {
    pub fn parse(sql: &str) -> Result<Self, ConnectorError> {
        let tokens = tokenize(sql)?;
        for token in &tokens {
            if let Token::Word(w) = token {
                if is_rejected(w) {
                    return Err(ConnectorError::unsupported(format!(
                        "{} is not supported",
                        w.to_ascii_uppercase()
                    )));
                }
            }
        }
        Parser { tokens, pos: 0 }.query()
    }

    pub fn is_aggregate(&self) -> bool {
        self.group_by.is_some()
            || self
                .projection
                .iter()
                .any(|item| matches!(item, SelectItem::Aggregate { .. }))
    }

    /// Validate against `schema` and build the normalized filter.
    pub fn plan(&self, schema: &TableSchema) -> Result<QueryPlan, ConnectorError> {
        if !self.table.eq_ignore_ascii_case(schema.table) {
            return Err(ConnectorError::unsupported(format!(
                "unknown table '{}' (this connector serves '{}')",
                self.table, schema.table
            )));
        }
        let canonical = |name: &str| -> Result<String, ConnectorError> {
            schema
                .column(name)
                .map(|c| c.name.to_string())
                .ok_or_else(|| ConnectorError::unsupported(format!("unknown column '{name}'")))
        };
        let filter = Filter {
            predicates: self.predicates.clone(),
            limit: None,
            offset: None,
        };

        if !self.is_aggregate() {
            let columns = if self.projection.is_empty() {
                schema.column_names().into_iter().map(String::from).collect()
            } else {
                self.projection
                    .iter()
                    .map(|item| match item {
                        SelectItem::Column { name } => canonical(name),
                        SelectItem::Aggregate { .. } => {
                            Err(ConnectorError::unsupported("mixed projection"))
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?
            };
            let filter = Filter {
                limit: self.limit,
                offset: self.offset,
                ..filter
            };
            return Ok(QueryPlan {
                filter: filter.normalize(schema)?,
                shape: Shape::Rows(columns),
            });
        }

        let group_by = self.group_by.as_deref().map(canonical).transpose()?;
        if self.projection.is_empty() {
            return Err(ConnectorError::unsupported("SELECT * cannot be grouped"));
        }
        let mut items = Vec::with_capacity(self.projection.len());
        for item in &self.projection {
            items.push(match item {
                SelectItem::Column { name } => {
                    let name = canonical(name)?;
                    if group_by.as_deref() != Some(name.as_str()) {
                        return Err(ConnectorError::unsupported(format!(
                            "column '{name}' must be aggregated or grouped"
                        )));
                    }
                    SelectItem::Column { name }
                }
                SelectItem::Aggregate { func, column, alias } => {
                    let column = column.as_deref().map(canonical).transpose()?;
                    if column.is_none() && *func != AggFunc::Count {
                        return Err(ConnectorError::unsupported(format!(
                            "{}(*) is not supported",
                            func.as_str()
                        )));
                    }
                    if let Some(name) = &column {
                        let numeric = schema.column(name).is_some_and(|c| c.ty.is_numeric());
                        if matches!(func, AggFunc::Sum | AggFunc::Avg) && !numeric {
                            return Err(ConnectorError::unsupported(format!(
                                "{}({name}) needs a numeric column",
                                func.as_str()
                            )));
                        }
                    }
                    SelectItem::Aggregate {
                        func: *func,
                        column,
                        alias: alias.clone(),
                    }
                }
            });
        }
        Ok(QueryPlan {
            filter: filter.normalize(schema)?,
            shape: Shape::Aggregate {
                group_by,
                items,
                limit: self.limit,
                offset: self.offset,
            },
        })
    }
}

impl QueryPlan {
    pub fn columns(&self) -> Vec<String> {
        match &self.shape {
            Shape::Rows(columns) => columns.clone(),
            Shape::Aggregate { items, .. } => items.iter().map(SelectItem::output_name).collect(),
        }
    }

    /// Shape the records returned for `self.filter` into output rows.
    pub fn rows<R: CanonicalRecord>(
        &self,
        records: &[R],
        now: DateTime<Utc>,
    ) -> Vec<Map<String, Value>> {
        match &self.shape {
            Shape::Rows(columns) => records
                .iter()
                .map(|record| {
                    columns
                        .iter()
                        .map(|c| (c.clone(), record.field(c, now)))
                        .collect()
                })
                .collect(),
            Shape::Aggregate {
                group_by,
                items,
                limit,
                offset,
            } => {
                let mut groups: BTreeMap<String, (Value, Vec<&R>)> = BTreeMap::new();
                match group_by {
                    Some(column) => {
                        for record in records {
                            let value = record.field(column, now);
                            let key = value.to_string();
                            groups.entry(key).or_insert_with(|| (value, Vec::new())).1.push(record);
                        }
                    }
                    None => {
                        groups.insert(String::new(), (Value::Null, records.iter().collect()));
                    }
                }
                let rows = groups.into_values().map(|(group_value, members)| {
                    items
                        .iter()
                        .map(|item| {
                            let value = match item {
                                SelectItem::Column { .. } => group_value.clone(),
                                SelectItem::Aggregate { column: None, .. } => {
                                    Value::from(members.len() as u64)
                                }
                                SelectItem::Aggregate { func, column: Some(c), .. } => {
                                    let values: Vec<Value> =
                                        members.iter().map(|r| r.field(c, now)).collect();
                                    func.apply(&values)
                                }
                            };
                            (item.output_name(), value)
                        })
                        .collect::<Map<String, Value>>()
                });
                paginate(rows, *offset, *limit).collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(f64),
    Str(String),
    Sym(&'static str),
}

fn tokenize(sql: &str) -> Result<Vec<Token>, ConnectorError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
            continue;
        }
        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ConnectorError::unsupported(format!("bad number '{text}'")))?;
            tokens.push(Token::Number(n));
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut out = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ConnectorError::unsupported("unterminated string literal")),
                    Some(&ch) if ch == quote => {
                        if chars.get(i + 1) == Some(&quote) {
                            out.push(quote);
                            i += 2;
                        } else {
                            i += 1;
                            break;
                        }
                    }
                    Some(&ch) => {
                        out.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(out));
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let sym = match two.as_str() {
            "<=" => Some("<="),
            ">=" => Some(">="),
            "!=" | "<>" => Some("!="),
            _ => None,
        };
        if let Some(sym) = sym {
            tokens.push(Token::Sym(sym));
            i += 2;
            continue;
        }
        let sym = match c {
            '*' => "*",
            ',' => ",",
            '(' => "(",
            ')' => ")",
            '=' => "=",
            '<' => "<",
            '>' => ">",
            ';' => ";",
            other => {
                return Err(ConnectorError::unsupported(format!(
                    "unexpected character '{other}'"
                )))
            }
        };
        tokens.push(Token::Sym(sym));
        i += 1;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        let hit = self.peek_keyword(kw);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        let hit = matches!(self.peek(), Some(Token::Sym(s)) if *s == sym);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ConnectorError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {kw}")))
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), ConnectorError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{sym}'")))
        }
    }

    fn unexpected(&self, what: &str) -> ConnectorError {
        match self.peek() {
            Some(Token::Word(w)) if is_rejected(w) => ConnectorError::unsupported(format!(
                "{} is not supported",
                w.to_ascii_uppercase()
            )),
            Some(token) => ConnectorError::unsupported(format!("{what}, found {token:?}")),
            None => ConnectorError::unsupported(format!("{what}, found end of query")),
        }
    }

    fn identifier(&mut self) -> Result<String, ConnectorError> {
        match self.peek() {
            Some(Token::Word(w)) if !is_rejected(w) && !is_reserved(w) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.unexpected("expected identifier")),
        }
    }

    fn count(&mut self) -> Result<usize, ConnectorError> {
        match self.next() {
            Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
            _ => Err(ConnectorError::unsupported(
                "LIMIT/OFFSET take a non-negative integer",
            )),
        }
    }

    fn query(mut self) -> Result<QueryAst, ConnectorError> {
        self.expect_keyword("SELECT")?;
        let projection = self.projection()?;
        self.expect_keyword("FROM")?;
        if self.eat_sym("(") {
            return Err(ConnectorError::unsupported("sub-selects are not supported"));
        }
        let table = self.identifier()?;
        if self.eat_sym(",") {
            return Err(ConnectorError::unsupported("multiple tables are not supported"));
        }
        let mut predicates = Vec::new();
        if self.eat_keyword("WHERE") {
            loop {
                self.condition(&mut predicates)?;
                if !self.eat_keyword("AND") {
                    break;
                }
            }
        }
        let group_by = if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            let column = self.identifier()?;
            if self.eat_sym(",") {
                return Err(ConnectorError::unsupported("grouping by several columns"));
            }
            Some(column)
        } else {
            None
        };
        let mut limit = None;
        let mut offset = None;
        if self.eat_keyword("LIMIT") {
            limit = Some(self.count()?);
        }
        if self.eat_keyword("OFFSET") {
            offset = Some(self.count()?);
        }
        self.eat_sym(";");
        if self.peek().is_some() {
            return Err(self.unexpected("expected end of query"));
        }
        Ok(QueryAst {
            table,
            projection,
            predicates,
            group_by,
            limit,
            offset,
        })
    }

    fn projection(&mut self) -> Result<Vec<SelectItem>, ConnectorError> {
        if self.eat_sym("*") {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        loop {
            items.push(self.select_item()?);
            if !self.eat_sym(",") {
                break;
            }
        }
        Ok(items)
    }

    fn select_item(&mut self) -> Result<SelectItem, ConnectorError> {
        let name = self.identifier()?;
        if !self.eat_sym("(") {
            return Ok(SelectItem::Column { name });
        }
        let func: AggFunc = name.parse()?;
        if self.peek_keyword("SELECT") {
            return Err(ConnectorError::unsupported("sub-selects are not supported"));
        }
        let column = if self.eat_sym("*") {
            None
        } else {
            Some(self.identifier()?)
        };
        self.expect_sym(")")?;
        let alias = if self.eat_keyword("AS") {
            Some(self.identifier()?)
        } else {
            None
        };
        Ok(SelectItem::Aggregate { func, column, alias })
    }

    fn literal(&mut self) -> Result<Value, ConnectorError> {
        match self.next() {
            Some(Token::Number(n)) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
                Ok(Value::from(n as i64))
            }
            Some(Token::Number(n)) => Ok(Value::from(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            Some(Token::Sym("(")) => Err(ConnectorError::unsupported(
                "sub-selects are not supported",
            )),
            Some(Token::Word(w)) if is_rejected(&w) => Err(ConnectorError::unsupported(format!(
                "{} is not supported",
                w.to_ascii_uppercase()
            ))),
            _ => Err(ConnectorError::unsupported(
                "predicates compare a column with a literal",
            )),
        }
    }

    fn condition(&mut self, out: &mut Vec<Predicate>) -> Result<(), ConnectorError> {
        if self.eat_sym("(") {
            return Err(ConnectorError::unsupported("grouped conditions are not supported"));
        }
        let column = self.identifier()?;
        if self.eat_keyword("BETWEEN") {
            let low = self.literal()?;
            self.expect_keyword("AND")?;
            let high = self.literal()?;
            out.push(Predicate {
                column: column.clone(),
                op: CompareOp::Gte,
                value: low,
            });
            out.push(Predicate {
                column,
                op: CompareOp::Lte,
                value: high,
            });
            return Ok(());
        }
        let op = match self.next() {
            Some(Token::Sym("=")) => CompareOp::Eq,
            Some(Token::Sym("!=")) => CompareOp::Ne,
            Some(Token::Sym("<")) => CompareOp::Lt,
            Some(Token::Sym("<=")) => CompareOp::Lte,
            Some(Token::Sym(">")) => CompareOp::Gt,
            Some(Token::Sym(">=")) => CompareOp::Gte,
            Some(Token::Word(w)) => {
                return Err(ConnectorError::unsupported(format!(
                    "operator {} is not supported",
                    w.to_ascii_uppercase()
                )))
            }
            _ => return Err(ConnectorError::unsupported("expected comparison operator")),
        };
        let value = self.literal()?;
        out.push(Predicate { column, op, value });
        Ok(())
    }
}

fn is_rejected(word: &str) -> bool {
    REJECTED_KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

fn is_reserved(word: &str) -> bool {
    ["SELECT", "FROM", "WHERE", "AND", "GROUP", "BY", "LIMIT", "OFFSET", "AS", "BETWEEN"]
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(word))
}
