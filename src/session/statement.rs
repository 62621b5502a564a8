use rusqlite::types::Value;
use serde_json::{Map, Number, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Pragma,
    Explain,
    Transaction,
    Unknown,
}

impl StatementKind {
    /// Classify SQL by its leading keyword, after any leading comments. A
    /// `WITH` statement is classified by the main statement after its CTEs.
    pub fn classify(sql: &str) -> Self {
        let sql = skip_leading_comments(sql);
        let keyword = leading_word(sql).to_ascii_uppercase();

        if keyword == "WITH" {
            return main_keyword_after_ctes(&sql[keyword.len()..])
                .map_or(StatementKind::Select, |main| StatementKind::from_keyword(&main));
        }
        StatementKind::from_keyword(&keyword)
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" | "VALUES" => StatementKind::Select,
            "INSERT" | "REPLACE" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "CREATE" | "DROP" | "ALTER" => StatementKind::Ddl,
            "PRAGMA" => StatementKind::Pragma,
            "EXPLAIN" => StatementKind::Explain,
            "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                StatementKind::Transaction
            }
            _ => StatementKind::Unknown,
        }
    }

    /// Statements that modify data or schema and must not reach a replica.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete | StatementKind::Ddl
        )
    }

    pub fn returns_rows(&self) -> bool {
        matches!(self, StatementKind::Select | StatementKind::Pragma | StatementKind::Explain)
    }
}

/// SQL text, positional parameters and an optional target table.
///
/// The table plays the part of the mapped entity when custom per-table binds
/// are configured on the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
    table: Option<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            table: None,
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn kind(&self) -> StatementKind {
        StatementKind::classify(&self.sql)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

fn skip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i + 1..]).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]).trim_start();
        } else {
            return rest;
        }
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn leading_word(sql: &str) -> &str {
    let end = sql.bytes().position(|b| !is_word_byte(b)).unwrap_or(sql.len());
    &sql[..end]
}

/// First statement keyword outside parentheses, skipping quoted names,
/// literals and comments.
fn main_keyword_after_ctes(sql: &str) -> Option<String> {
    let bytes = sql.as_bytes();
    let skip_to = |from: usize, close: &str| sql[from..].find(close).map_or(bytes.len(), |i| from + i + close.len());
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'\'' => i = skip_to(i + 1, "'") - 1,
            b'"' => i = skip_to(i + 1, "\"") - 1,
            b'`' => i = skip_to(i + 1, "`") - 1,
            b'[' => i = skip_to(i + 1, "]") - 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_to(i + 2, "\n") - 1,
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_to(i + 2, "*/") - 1,
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                if depth == 0 {
                    let word = sql[start..i].to_ascii_uppercase();
                    if matches!(word.as_str(), "SELECT" | "VALUES" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE") {
                        return Some(word);
                    }
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|row| row.get(idx)).collect())
    }

    /// Render rows as an array of JSON objects keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object: Map<String, JsonValue> = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.clone(), value_to_json(value)))
                    .collect();
                JsonValue::Object(object)
            })
            .collect();
        JsonValue::Array(rows)
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => JsonValue::Number((*i).into()),
        Value::Real(f) => Number::from_f64(*f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Blob(b) => JsonValue::String(hex::encode(b)),
    }
}
