//! The SQL surface: statements against entity views and the state views are
//! rewritten onto cache tables and the staged-write table before SQLite
//! sees them. Everything else passes through.

pub mod classify;
pub mod entity_view;
pub mod state_read;
pub mod state_write;
pub mod token;

use std::collections::{BTreeMap, BTreeSet};

use verstate_core::schema::Schema;

use crate::config::EngineConfig;
use crate::error::EngineError;

pub use classify::{Classification, StatementKind, classify};
pub use token::{Token, render, split_statements, tokenize};

pub const STATE_VIEW: &str = "state";
pub const STATE_BY_VERSION_VIEW: &str = "state_by_version";
pub const BY_VERSION_SUFFIX: &str = "_by_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewScope {
    /// Rows of the active version only.
    Active,
    /// Rows of every version, addressed through `sys_version_id`.
    ByVersion,
}

/// Latest registered definition of each schema key.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, Schema>,
}

impl SchemaCatalog {
    pub fn insert(&mut self, schema: Schema) {
        self.schemas.insert(schema.key.clone(), schema);
    }

    pub fn get(&self, key: &str) -> Option<&Schema> {
        self.schemas.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.schemas.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    fn lookup(&self, name: &str) -> Option<&Schema> {
        self.schemas
            .get(name)
            .or_else(|| self.schemas.values().find(|s| s.key.eq_ignore_ascii_case(name)))
    }

    /// The schema and scope behind an entity view name.
    pub fn resolve_view(&self, name: &str) -> Option<(&Schema, ViewScope)> {
        if let Some(schema) = self.lookup(name) {
            return Some((schema, ViewScope::Active));
        }
        let lower = name.to_ascii_lowercase();
        let base = lower.strip_suffix(BY_VERSION_SUFFIX)?;
        let base = &name[..base.len()];
        self.lookup(base).map(|schema| (schema, ViewScope::ByVersion))
    }

    /// Schemas holding a foreign key into `key`.
    pub fn referencing(&self, key: &str) -> Vec<&Schema> {
        self.schemas
            .values()
            .filter(|s| s.foreign_keys.iter().any(|fk| fk.references.schema_key == key))
            .collect()
    }
}

/// A statement ready for SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub sql: String,
    pub kind: StatementKind,
    /// Inserts into `internal_state_writes`, which must be flushed afterwards.
    pub stages_writes: bool,
    /// Schemas whose cache the statement reads.
    pub schema_keys: BTreeSet<String>,
}

impl Prepared {
    fn passthrough(sql: &str, kind: StatementKind) -> Self {
        Self {
            sql: sql.to_string(),
            kind,
            stages_writes: false,
            schema_keys: BTreeSet::new(),
        }
    }
}

/// Rewrite one statement.
///
/// Write shapes the rewriter cannot express are executed unchanged; SQLite
/// then reports whatever it makes of them.
pub fn prepare(
    sql: &str,
    catalog: &SchemaCatalog,
    config: &EngineConfig,
) -> Result<Prepared, EngineError> {
    let mut tokens = tokenize(sql)?;
    while tokens.last().is_some_and(|t| t.is_punct(";")) {
        tokens.pop();
    }
    if tokens.iter().any(|t| t.is_punct(";")) {
        return Err(EngineError::Syntax {
            offset: 0,
            message: "multiple statements given, use execute_batch".into(),
        });
    }

    let class = classify(&tokens);
    if class.kind == StatementKind::Other {
        return Ok(Prepared::passthrough(sql, class.kind));
    }
    match rewrite(tokens, class, catalog, config) {
        Ok(Some(prepared)) => Ok(prepared),
        Ok(None) => Ok(Prepared::passthrough(sql, class.kind)),
        Err(EngineError::UnresolvedRewrite(reason)) => {
            tracing::debug!(%reason, "statement passed through unchanged");
            Ok(Prepared::passthrough(sql, class.kind))
        }
        Err(err) => Err(err),
    }
}

fn rewrite(
    mut tokens: Vec<Token>,
    class: Classification,
    catalog: &SchemaCatalog,
    config: &EngineConfig,
) -> Result<Option<Prepared>, EngineError> {
    let mut kind = class.kind;
    let mut changed = false;
    let mut stages_writes = false;

    if kind.is_write() {
        if let Some(rewritten) = entity_view::rewrite(&tokens, class, catalog, config)? {
            tokens = rewritten;
            changed = true;
        }
        if let Some(rewritten) = state_write::rewrite(&tokens, classify(&tokens))? {
            tokens = rewritten;
            stages_writes = true;
            changed = true;
            kind = StatementKind::Insert;
        }
    }

    let read = state_read::rewrite(tokens, catalog)?;
    if !changed && !read.changed {
        return Ok(None);
    }
    Ok(Some(Prepared {
        sql: render(&read.tokens),
        kind,
        stages_writes,
        schema_keys: read.schema_keys,
    }))
}

/// Index of the `)` closing the `(` at `open`.
pub(crate) fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(index);
            }
        }
    }
    None
}

/// First index at or after `start`, outside parentheses, where `pred` holds.
pub(crate) fn find_top_level(
    tokens: &[Token],
    start: usize,
    pred: impl Fn(&Token) -> bool,
) -> Option<usize> {
    let mut depth = 0usize;
    for (index, token) in tokens.iter().enumerate().skip(start) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && pred(token) {
            return Some(index);
        }
    }
    None
}

pub(crate) fn split_commas(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(comma) = find_top_level(tokens, start, |t| t.is_punct(",")) {
        parts.push(&tokens[start..comma]);
        start = comma + 1;
    }
    parts.push(&tokens[start..]);
    parts
}

/// Parse `( expr, ... ) [, ( ... )]*` starting at `at`. Returns the tuples and
/// the index after the last one.
pub(crate) fn parse_tuples(
    tokens: &[Token],
    mut at: usize,
) -> Result<(Vec<Vec<&[Token]>>, usize), EngineError> {
    let mut rows = Vec::new();
    loop {
        if !tokens.get(at).is_some_and(|t| t.is_punct("(")) {
            return Err(EngineError::UnresolvedRewrite("expected a value tuple".into()));
        }
        let close = matching_paren(tokens, at).ok_or_else(|| EngineError::Syntax {
            offset: 0,
            message: "unbalanced parentheses".into(),
        })?;
        rows.push(split_commas(&tokens[at + 1..close]));
        at = close + 1;
        if tokens.get(at).is_some_and(|t| t.is_punct(",")) {
            at += 1;
        } else {
            return Ok((rows, at));
        }
    }
}

/// Parse a parenthesized list of bare column names starting at `at`.
pub(crate) fn parse_column_list(
    tokens: &[Token],
    at: usize,
) -> Result<(Vec<String>, usize), EngineError> {
    let close = matching_paren(tokens, at).ok_or_else(|| EngineError::Syntax {
        offset: 0,
        message: "unbalanced parentheses".into(),
    })?;
    let mut columns = Vec::new();
    for part in split_commas(&tokens[at + 1..close]) {
        match part {
            [token] => match token.ident_name() {
                Some(name) => columns.push(name.to_string()),
                None => {
                    return Err(EngineError::UnresolvedRewrite(format!(
                        "unexpected column token {token}"
                    )));
                }
            },
            _ => return Err(EngineError::UnresolvedRewrite("complex column list".into())),
        }
    }
    Ok((columns, close + 1))
}

/// Tokens under construction.
#[derive(Debug, Default)]
pub(crate) struct TokenBuf(Vec<Token>);

impl TokenBuf {
    pub fn kw(&mut self, keyword: &str) -> &mut Self {
        self.0.push(Token::kw(keyword));
        self
    }

    pub fn ident(&mut self, name: &str) -> &mut Self {
        self.0.push(Token::ident(name));
        self
    }

    pub fn punct(&mut self, p: &'static str) -> &mut Self {
        self.0.push(Token::Punct(p));
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.0.push(Token::string(value));
        self
    }

    pub fn tokens(&mut self, tokens: &[Token]) -> &mut Self {
        self.0.extend_from_slice(tokens);
        self
    }

    /// Append a parameter-free SQL fragment.
    pub fn sql(&mut self, fragment: &str) -> Result<&mut Self, EngineError> {
        self.0.extend(tokenize(fragment)?);
        Ok(self)
    }

    /// Append items separated by commas.
    pub fn list<T>(
        &mut self,
        items: impl IntoIterator<Item = T>,
        mut each: impl FnMut(&mut Self, T),
    ) -> &mut Self {
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 {
                self.punct(",");
            }
            each(self, item);
        }
        self
    }

    pub fn finish(self) -> Vec<Token> {
        self.0
    }
}
