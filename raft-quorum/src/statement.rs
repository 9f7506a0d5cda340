//! The SQL subset understood by [`crate::store::MemoryDatabase`].
//!
//! Supported forms (keywords are case-insensitive, a trailing `;` is
//! ignored):
//!
//! - `CREATE TABLE [IF NOT EXISTS] <t> (<col> [type...], ...)`
//! - `INSERT INTO <t> (<col>, ...) VALUES (<value>, ...)`
//! - `SELECT * | <col>, ... FROM <t> [WHERE <col> = <value>]`
//! - `DELETE FROM <t> [WHERE <col> = <value>]`
//!
//! A value is a number, a `'single quoted'` string, `NULL`, `TRUE`,
//! `FALSE`, or a `?` placeholder bound positionally from the command's
//! values.

use serde_json::Value;

use crate::error::StatementError;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        table: String,
        columns: Vec<String>,
        if_not_exists: bool,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Operand>,
    },
    Select {
        table: String,
        projection: Projection,
        filter: Option<Filter>,
    },
    Delete {
        table: String,
        filter: Option<Filter>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Operand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Zero-based position into the bound values.
    Placeholder(usize),
    Literal(Value),
}

impl Operand {
    pub fn resolve(&self, bound: &[Value]) -> Value {
        match self {
            Operand::Placeholder(index) => bound.get(*index).cloned().unwrap_or(Value::Null),
            Operand::Literal(value) => value.clone(),
        }
    }
}

impl Statement {
    /// Parses `sql` and checks that `bound` supplies every placeholder.
    pub fn prepare(sql: &str, bound: &[Value]) -> Result<Self, StatementError> {
        let mut parser = Parser::new(tokenize(sql)?);
        let statement = parser.statement()?;
        if parser.placeholders != bound.len() {
            return Err(StatementError::BindMismatch {
                placeholders: parser.placeholders,
                bound: bound.len(),
            });
        }
        Ok(statement)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Statement::Select { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(String),
    Text(String),
    Placeholder,
    LParen,
    RParen,
    Comma,
    Star,
    Equals,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(word) => word.clone(),
            Token::Number(number) => number.clone(),
            Token::Text(text) => format!("'{text}'"),
            Token::Placeholder => "?".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
            Token::Star => "*".to_string(),
            Token::Equals => "=".to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>, StatementError> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() || c == ';' => {
                chars.next();
            }
            '(' | ')' | ',' | '*' | '=' | '?' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    '*' => Token::Star,
                    '=' => Token::Equals,
                    _ => Token::Placeholder,
                });
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        // '' inside a literal is an escaped quote
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            text.push('\'');
                        }
                        Some('\'') => break,
                        Some(ch) => text.push(ch),
                        None => return Err(StatementError::UnterminatedString),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut number = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E') {
                        number.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(number));
            }
            '`' | '"' => {
                let quote = c;
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => word.push(ch),
                        None => return Err(StatementError::UnterminatedString),
                    }
                }
                tokens.push(Token::Word(word));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(StatementError::UnexpectedToken {
                    found: other.to_string(),
                    expected: "a statement token",
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    placeholders: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            placeholders: 0,
        }
    }

    fn statement(&mut self) -> Result<Statement, StatementError> {
        let Some(first) = self.peek() else {
            return Err(StatementError::Empty);
        };

        let statement = if first.is_keyword("CREATE") {
            self.create_table()?
        } else if first.is_keyword("INSERT") {
            self.insert()?
        } else if first.is_keyword("SELECT") {
            self.select()?
        } else if first.is_keyword("DELETE") {
            self.delete()?
        } else {
            return Err(StatementError::Unsupported(first.describe()));
        };

        if let Some(extra) = self.peek() {
            return Err(StatementError::UnexpectedToken {
                found: extra.describe(),
                expected: "end of statement",
            });
        }
        Ok(statement)
    }

    fn create_table(&mut self) -> Result<Statement, StatementError> {
        self.keyword("CREATE")?;
        self.keyword("TABLE")?;
        let if_not_exists = if self.peek().is_some_and(|t| t.is_keyword("IF")) {
            self.keyword("IF")?;
            self.keyword("NOT")?;
            self.keyword("EXISTS")?;
            true
        } else {
            false
        };
        let table = self.identifier("table name")?;
        self.expect(Token::LParen, "(")?;

        // Only the first word of each column definition matters; types and
        // constraints, including parenthesised ones, are skipped.
        let mut columns = Vec::new();
        let mut depth = 0usize;
        let mut at_column_start = true;
        loop {
            let token = self.next("column definition")?;
            match token {
                Token::LParen => depth += 1,
                Token::RParen if depth == 0 => break,
                Token::RParen => depth -= 1,
                Token::Comma if depth == 0 => at_column_start = true,
                Token::Word(word) if at_column_start => {
                    columns.push(word);
                    at_column_start = false;
                }
                _ => {}
            }
        }

        Ok(Statement::CreateTable {
            table,
            columns,
            if_not_exists,
        })
    }

    fn insert(&mut self) -> Result<Statement, StatementError> {
        self.keyword("INSERT")?;
        self.keyword("INTO")?;
        let table = self.identifier("table name")?;

        self.expect(Token::LParen, "(")?;
        let columns = self.list(|parser| parser.identifier("column name"))?;
        self.keyword("VALUES")?;
        self.expect(Token::LParen, "(")?;
        let values = self.list(Parser::operand)?;

        if columns.len() != values.len() {
            return Err(StatementError::ColumnCount {
                columns: columns.len(),
                values: values.len(),
            });
        }

        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn select(&mut self) -> Result<Statement, StatementError> {
        self.keyword("SELECT")?;
        let projection = if self.peek() == Some(&Token::Star) {
            self.pos += 1;
            Projection::All
        } else {
            let mut columns = vec![self.identifier("column name")?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                columns.push(self.identifier("column name")?);
            }
            Projection::Columns(columns)
        };
        self.keyword("FROM")?;
        let table = self.identifier("table name")?;
        let filter = self.filter()?;

        Ok(Statement::Select {
            table,
            projection,
            filter,
        })
    }

    fn delete(&mut self) -> Result<Statement, StatementError> {
        self.keyword("DELETE")?;
        self.keyword("FROM")?;
        let table = self.identifier("table name")?;
        let filter = self.filter()?;
        Ok(Statement::Delete { table, filter })
    }

    fn filter(&mut self) -> Result<Option<Filter>, StatementError> {
        if !self.peek().is_some_and(|t| t.is_keyword("WHERE")) {
            return Ok(None);
        }
        self.keyword("WHERE")?;
        let column = self.identifier("column name")?;
        self.expect(Token::Equals, "=")?;
        let value = self.operand()?;
        Ok(Some(Filter { column, value }))
    }

    /// Parses `item, item, ... )`; the opening parenthesis is already consumed.
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, StatementError>,
    ) -> Result<Vec<T>, StatementError> {
        let mut items = vec![item(self)?];
        loop {
            match self.next(", or )")? {
                Token::Comma => items.push(item(self)?),
                Token::RParen => return Ok(items),
                other => {
                    return Err(StatementError::UnexpectedToken {
                        found: other.describe(),
                        expected: ", or )",
                    });
                }
            }
        }
    }

    fn operand(&mut self) -> Result<Operand, StatementError> {
        match self.next("a value")? {
            Token::Placeholder => {
                let index = self.placeholders;
                self.placeholders += 1;
                Ok(Operand::Placeholder(index))
            }
            Token::Text(text) => Ok(Operand::Literal(Value::String(text))),
            Token::Number(number) => serde_json::from_str::<Value>(&number)
                .ok()
                .filter(Value::is_number)
                .map(Operand::Literal)
                .ok_or(StatementError::UnexpectedToken {
                    found: number,
                    expected: "a number",
                }),
            Token::Word(word) if word.eq_ignore_ascii_case("NULL") => {
                Ok(Operand::Literal(Value::Null))
            }
            Token::Word(word) if word.eq_ignore_ascii_case("TRUE") => {
                Ok(Operand::Literal(Value::Bool(true)))
            }
            Token::Word(word) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Operand::Literal(Value::Bool(false)))
            }
            other => Err(StatementError::UnexpectedToken {
                found: other.describe(),
                expected: "a value",
            }),
        }
    }

    fn identifier(&mut self, expected: &'static str) -> Result<String, StatementError> {
        match self.next(expected)? {
            Token::Word(word) => Ok(word),
            other => Err(StatementError::UnexpectedToken {
                found: other.describe(),
                expected,
            }),
        }
    }

    fn keyword(&mut self, keyword: &'static str) -> Result<(), StatementError> {
        let token = self.next(keyword)?;
        if token.is_keyword(keyword) {
            Ok(())
        } else {
            Err(StatementError::UnexpectedToken {
                found: token.describe(),
                expected: keyword,
            })
        }
    }

    fn expect(&mut self, wanted: Token, expected: &'static str) -> Result<(), StatementError> {
        let token = self.next(expected)?;
        if token == wanted {
            Ok(())
        } else {
            Err(StatementError::UnexpectedToken {
                found: token.describe(),
                expected,
            })
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, StatementError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(StatementError::UnexpectedEnd(expected))?;
        self.pos += 1;
        Ok(token)
    }
}
