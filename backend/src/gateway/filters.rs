use std::{collections::BTreeMap, sync::LazyLock};
use chrono::{Local, NaiveDate};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{dates::{convert_to_exact_date, is_offset_notation}, error::GatewayError};

/// Named query parameters. A BTreeMap keeps them key-sorted, which the cache
/// key relies on.
pub type QueryParams = BTreeMap<String, Value>;

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("identifier regex is valid")
});

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*):([A-Za-z0-9_()]+)\}").expect("placeholder regex is valid")
});

/// One column/operator/value predicate as sent by the dashboard filter widgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
  #[serde(rename = "type")]
  pub column: String,
  pub operator: String,
  #[serde(default)]
  pub value: Vec<String>,
}

impl FilterCondition {
  #[cfg(test)]
  pub fn new(column: &str, operator: &str, value: &[&str]) -> Self {
    Self {
      column: column.to_string(),
      operator: operator.to_string(),
      value: value.iter().map(|v| v.to_string()).collect(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
  Gte,
  Gt,
  Lte,
  Lt,
  Exclude,
  Include,
}

impl FilterOperator {
  /// Unknown operators are treated as inclusion, matching the widgets' default.
  pub fn parse(op: &str) -> Self {
    match op.trim().to_lowercase().as_str() {
      ">=" => Self::Gte,
      ">" => Self::Gt,
      "<=" => Self::Lte,
      "<" => Self::Lt,
      "is not" | "is none of" | "not in" | "exclude" => Self::Exclude,
      _ => Self::Include,
    }
  }

  fn comparison_symbol(&self) -> Option<&'static str> {
    match self {
      Self::Gte => Some(">="),
      Self::Gt => Some(">"),
      Self::Lte => Some("<="),
      Self::Lt => Some("<"),
      Self::Exclude | Self::Include => None,
    }
  }
}

/// The as-of-date column of a table and the day used for the implicit
/// "latest date" predicate.
#[derive(Debug, Clone)]
pub struct AsOfDate {
  pub column: String,
  pub today: NaiveDate,
}

impl AsOfDate {
  pub fn new(column: &str, today: NaiveDate) -> Self {
    Self { column: column.to_string(), today }
  }

  pub fn today(column: &str) -> Self {
    Self::new(column, Local::now().date_naive())
  }

  fn today_iso(&self) -> String {
    self.today.format("%Y-%m-%d").to_string()
  }
}

/// SQL text with ClickHouse placeholders (`{name:Type}`) and their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundSql {
  pub sql: String,
  pub params: QueryParams,
}

impl BoundSql {
  /// Binds a value under the next free positional name and returns its placeholder.
  pub fn bind(&mut self, value: impl Into<Value>, ty: &str) -> String {
    let name = format!("p{}", self.params.len());
    self.bind_named(&name, value, ty)
  }

  pub fn bind_named(&mut self, name: &str, value: impl Into<Value>, ty: &str) -> String {
    self.params.insert(name.to_string(), value.into());
    format!("{{{}:{}}}", name, ty)
  }

  /// Renders the SQL with every bound value substituted as an escaped literal.
  /// Only meant for assertions, never for execution.
  #[cfg(test)]
  pub fn inline(&self) -> String {
    inline_params(&self.sql, &self.params)
  }
}

pub fn inline_params(sql: &str, params: &QueryParams) -> String {
  PLACEHOLDER_RE
    .replace_all(sql, |caps: &Captures| match params.get(&caps[1]) {
      Some(Value::String(s)) => quote_literal(s),
      Some(Value::Number(n)) => n.to_string(),
      Some(Value::Bool(b)) => b.to_string(),
      Some(other) => quote_literal(&other.to_string()),
      None => caps[0].to_string(),
    })
    .into_owned()
}

fn quote_literal(value: &str) -> String {
  format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn validate_identifier(name: &str) -> Result<&str, GatewayError> {
  if IDENT_RE.is_match(name) {
    Ok(name)
  } else {
    Err(GatewayError::InvalidIdentifier(name.to_string()))
  }
}

/// Accepts `col [ASC|DESC], ...` and returns it normalised.
pub fn validate_order_by(order_by: &str) -> Result<String, GatewayError> {
  let mut terms = vec![];
  for term in order_by.split(',') {
    let parts: Vec<&str> = term.split_whitespace().collect();
    let rendered = match parts.as_slice() {
      [column] => validate_identifier(column)?.to_string(),
      [column, dir] if dir.eq_ignore_ascii_case("asc") || dir.eq_ignore_ascii_case("desc") => {
        format!("{} {}", validate_identifier(column)?, dir.to_uppercase())
      },
      _ => return Err(GatewayError::InvalidFilter(format!("order by term '{}'", term.trim()))),
    };
    terms.push(rendered);
  }
  Ok(terms.join(", "))
}

/// Builds the `WHERE ... [ORDER BY ...]` fragment for a list of filters.
///
/// Filters without values are skipped. When `as_of` is given, none of the
/// remaining filters targets its column and `remove_as_of_date` is false, an
/// equality predicate on today's date is appended. Values are bound as
/// parameters, never spliced into the text.
pub fn build_where_condition(
  filters: &[FilterCondition],
  remove_as_of_date: bool,
  order_by: Option<&str>,
  as_of: Option<&AsOfDate>,
) -> Result<BoundSql, GatewayError> {
  let active: Vec<&FilterCondition> = filters.iter().filter(|f| !f.value.is_empty()).collect();

  let mut bound = BoundSql::default();
  let mut clauses = Vec::with_capacity(active.len() + 1);

  for filter in &active {
    let column = validate_identifier(&filter.column)?;
    let is_date_column = as_of.is_some_and(|d| d.column.eq_ignore_ascii_case(column));

    let mut values = Vec::with_capacity(filter.value.len());
    for value in &filter.value {
      match as_of {
        Some(date) if is_date_column && is_offset_notation(value) => {
          values.push(convert_to_exact_date(value, date.today)?)
        },
        _ => values.push(value.clone()),
      }
    }

    let operator = FilterOperator::parse(&filter.operator);
    let clause = match operator.comparison_symbol() {
      Some(symbol) => {
        let placeholder = bound.bind(values[0].clone(), "String");
        format!("{} {} {}", column, symbol, placeholder)
      },
      None => {
        let placeholders: Vec<String> = values.into_iter().map(|v| bound.bind(v, "String")).collect();
        let keyword = if operator == FilterOperator::Exclude { "NOT IN" } else { "IN" };
        format!("{} {} ({})", column, keyword, placeholders.join(", "))
      }
    };
    clauses.push(clause);
  }

  if let Some(date) = as_of {
    let has_date_filter = active.iter().any(|f| f.column.eq_ignore_ascii_case(&date.column));
    if !has_date_filter && !remove_as_of_date {
      let column = validate_identifier(&date.column)?;
      let placeholder = bound.bind(date.today_iso(), "String");
      clauses.push(format!("{} = {}", column, placeholder));
    }
  }

  let mut sql = String::new();
  if !clauses.is_empty() {
    sql.push_str("WHERE ");
    sql.push_str(&clauses.join(" AND "));
  }
  if let Some(order) = order_by.map(str::trim).filter(|o| !o.is_empty()) {
    if !sql.is_empty() {
      sql.push(' ');
    }
    sql.push_str("ORDER BY ");
    sql.push_str(&validate_order_by(order)?);
  }

  bound.sql = sql;
  Ok(bound)
}
