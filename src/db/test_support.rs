//! In-memory driver fakes shared by the database tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;

use super::driver::{ConnectionFactory, DbConnection, DbEndpoint};
use super::object::{DbObject, WriteStamp};

/// A column value the mock store understands.
#[derive(Debug, Clone)]
pub(crate) enum MockValue {
    Signed(i64),
    Unsigned(u64),
    Double(f64),
    Text(String),
}

pub(crate) type MockRow = HashMap<String, MockValue>;

struct FailRule {
    needle: String,
    code: u32,
    remaining: usize,
}

#[derive(Default)]
struct MockState {
    executed: Mutex<Vec<(String, String)>>,
    table_rows: Mutex<HashMap<String, Vec<MockRow>>>,
    query_rows: Mutex<HashMap<String, Vec<MockRow>>>,
    fail_rule: Mutex<Option<FailRule>>,
    connects_to_fail: AtomicUsize,
    connects: AtomicUsize,
}

/// Connection factory backed by an in-memory table store.
///
/// Statements are logged with the executing thread's name; `REPLACE` and
/// `INSERT` statements are parsed back into rows so a later `SELECT` can
/// return them, which is what the save/load round-trip tests exercise.
pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState::default()),
        })
    }

    /// Injects `remaining` failures for statements containing `needle`.
    pub(crate) fn fail_matching(&self, needle: &str, code: u32, remaining: usize) {
        *self.state.fail_rule.lock().unwrap() = Some(FailRule {
            needle: needle.to_string(),
            code,
            remaining,
        });
    }

    /// Makes the next `count` connection attempts fail.
    pub(crate) fn fail_connects(&self, count: usize) {
        self.state.connects_to_fail.store(count, Ordering::SeqCst);
    }

    /// Pre-loads the result rows of an exact query.
    pub(crate) fn set_query_rows(&self, query: &str, rows: Vec<MockRow>) {
        self.state
            .query_rows
            .lock()
            .unwrap()
            .insert(query.to_string(), rows);
    }

    /// Executed statements, in order.
    pub(crate) fn sql_log(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Executed statements with the name of the thread that ran each.
    pub(crate) fn executed_by(&self) -> Vec<(String, String)> {
        self.state.executed.lock().unwrap().clone()
    }

    /// Number of connection attempts, successful or not.
    pub(crate) fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for MockDriver {
    fn connect(&self, _endpoint: &DbEndpoint) -> Result<Box<dyn DbConnection>, Error> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let to_fail = self.state.connects_to_fail.load(Ordering::SeqCst);
        if to_fail > 0 {
            self.state
                .connects_to_fail
                .store(to_fail - 1, Ordering::SeqCst);
            return Err(Error::Driver {
                code: 2003,
                message: "can't connect to server".into(),
            });
        }
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            rows: Vec::new(),
            cursor: None,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    rows: Vec<MockRow>,
    cursor: Option<usize>,
}

impl MockConnection {
    fn current_row(&self) -> Option<&MockRow> {
        self.cursor.and_then(|index| self.rows.get(index))
    }
}

impl DbConnection for MockConnection {
    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        // Log every attempt, including the ones about to fail, so tests
        // can count retries.
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.state
            .executed
            .lock()
            .unwrap()
            .push((thread, sql.to_string()));

        {
            let mut rule = self.state.fail_rule.lock().unwrap();
            if let Some(rule) = rule.as_mut() {
                if rule.remaining > 0 && sql.contains(&rule.needle) {
                    rule.remaining = rule.remaining.saturating_sub(1);
                    return Err(Error::Driver {
                        code: rule.code,
                        message: "injected failure".into(),
                    });
                }
            }
        }

        self.rows.clear();
        self.cursor = None;

        if let Some(rows) = self.state.query_rows.lock().unwrap().get(sql) {
            self.rows = rows.clone();
            return Ok(());
        }
        if sql.starts_with("SELECT") {
            if let Some(table) = table_of_select(sql) {
                self.rows = self
                    .state
                    .table_rows
                    .lock()
                    .unwrap()
                    .get(table)
                    .cloned()
                    .unwrap_or_default();
            }
        } else if sql.starts_with("REPLACE") || sql.starts_with("INSERT") {
            if let Some((table, row)) = parse_write(sql) {
                let mut tables = self.state.table_rows.lock().unwrap();
                if sql.starts_with("REPLACE") {
                    tables.insert(table, vec![row]);
                } else {
                    tables.entry(table).or_default().push(row);
                }
            }
        }
        Ok(())
    }

    fn fetch_row(&mut self) -> Result<bool, Error> {
        let next = self.cursor.map_or(0, |index| index + 1);
        self.cursor = Some(next);
        Ok(next < self.rows.len())
    }

    fn get_signed(&self, column: &str) -> Option<i64> {
        match self.current_row()?.get(column)? {
            MockValue::Signed(value) => Some(*value),
            MockValue::Unsigned(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    fn get_unsigned(&self, column: &str) -> Option<u64> {
        match self.current_row()?.get(column)? {
            MockValue::Unsigned(value) => Some(*value),
            MockValue::Signed(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    fn get_double(&self, column: &str) -> Option<f64> {
        match self.current_row()?.get(column)? {
            MockValue::Double(value) => Some(*value),
            MockValue::Unsigned(value) => Some(*value as f64),
            MockValue::Signed(value) => Some(*value as f64),
            _ => None,
        }
    }

    fn get_string(&self, column: &str) -> Option<String> {
        match self.current_row()?.get(column)? {
            MockValue::Text(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn discard_result(&mut self) {
        self.rows.clear();
        self.cursor = None;
    }
}

/// Extracts the table name of a ``SELECT ... FROM `t` ...`` statement.
fn table_of_select(sql: &str) -> Option<&str> {
    let rest = sql.split("FROM `").nth(1)?;
    rest.split('`').next()
}

/// Parses ``REPLACE|INSERT INTO `t` SET `a` = v, ...`` back into a row.
fn parse_write(sql: &str) -> Option<(String, MockRow)> {
    let rest = sql.split("INTO `").nth(1)?;
    let (table, rest) = rest.split_once("` SET ")?;
    let mut row = MockRow::new();
    for assignment in rest.split(", ") {
        let (column, value) = assignment.split_once(" = ")?;
        let column = column.trim_matches('`').to_string();
        row.insert(column, parse_value(value));
    }
    Some((table.to_string(), row))
}

fn parse_value(text: &str) -> MockValue {
    if let Some(inner) = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return MockValue::Text(inner.replace("''", "'"));
    }
    if text.contains('.') || text.contains('e') {
        if let Ok(value) = text.parse() {
            return MockValue::Double(value);
        }
    }
    if let Some(stripped) = text.strip_prefix('-') {
        if let Ok(value) = stripped.parse::<i64>() {
            return MockValue::Signed(-value);
        }
    }
    match text.parse() {
        Ok(value) => MockValue::Unsigned(value),
        Err(_) => MockValue::Text(text.to_string()),
    }
}

struct Fields {
    id: i64,
    name: String,
    score: f64,
    count: u64,
}

/// A persistable record with one column per supported type.
pub(crate) struct TestRecord {
    table: String,
    fields: Mutex<Fields>,
    stamp: WriteStamp,
}

impl TestRecord {
    pub(crate) fn new(id: i64, name: &str) -> Self {
        Self::with_table("test_records", id, name)
    }

    pub(crate) fn with_table(table: &str, id: i64, name: &str) -> Self {
        Self {
            table: table.to_string(),
            fields: Mutex::new(Fields {
                id,
                name: name.to_string(),
                score: 0.0,
                count: 0,
            }),
            stamp: WriteStamp::new(),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        self.fields.lock().unwrap().name = name.to_string();
    }

    pub(crate) fn set_score(&self, score: f64) {
        self.fields.lock().unwrap().score = score;
    }

    pub(crate) fn set_count(&self, count: u64) {
        self.fields.lock().unwrap().count = count;
    }

    pub(crate) fn id(&self) -> i64 {
        self.fields.lock().unwrap().id
    }

    pub(crate) fn name(&self) -> String {
        self.fields.lock().unwrap().name.clone()
    }

    pub(crate) fn score(&self) -> f64 {
        self.fields.lock().unwrap().score
    }

    pub(crate) fn count(&self) -> u64 {
        self.fields.lock().unwrap().count
    }
}

impl DbObject for TestRecord {
    fn table(&self) -> &str {
        &self.table
    }

    fn generate_sql(&self, query: &mut String) {
        use std::fmt::Write;
        let fields = self.fields.lock().unwrap();
        let _ = write!(
            query,
            "`id` = {}, `name` = '{}', `score` = {}, `count` = {}, ",
            fields.id,
            fields.name.replace('\'', "''"),
            fields.score,
            fields.count
        );
    }

    fn fetch(&self, conn: &mut dyn DbConnection) -> Result<(), Error> {
        let missing = |column: &str| Error::System {
            code: None,
            message: format!("missing column `{column}`"),
        };
        let mut fields = self.fields.lock().unwrap();
        fields.id = conn.get_signed("id").ok_or_else(|| missing("id"))?;
        fields.name = conn.get_string("name").ok_or_else(|| missing("name"))?;
        fields.score = conn.get_double("score").ok_or_else(|| missing("score"))?;
        fields.count = conn.get_unsigned("count").ok_or_else(|| missing("count"))?;
        Ok(())
    }

    fn write_stamp(&self) -> &WriteStamp {
        &self.stamp
    }
}
