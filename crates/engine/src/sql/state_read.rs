//! Reads of the state and entity views are answered from the cache tables.
//!
//! Each view reference in a `FROM` or `JOIN` position is replaced by a
//! subquery over the resolved state of the schemas it can touch. For the
//! state views that set is narrowed to literal `schema_key` predicates when
//! the statement has no `OR`, and is every registered schema otherwise.

use std::collections::BTreeSet;

use verstate_core::schema::Schema;
use verstate_storage::{STATE_COLUMNS, quote_literal, resolved_state_sql};

use super::entity_view::{SYS_COLUMNS, json_path};
use super::token::{Token, tokenize};
use super::{
    STATE_BY_VERSION_VIEW, STATE_VIEW, SchemaCatalog, TokenBuf, ViewScope, matching_paren,
};
use crate::error::EngineError;

const ACTIVE_VERSION_FILTER: &str =
    "WHERE version_id = (SELECT version_id FROM internal_active_version)";

const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "UNION", "EXCEPT", "INTERSECT", "WINDOW",
    "RETURNING", "SET", "VALUES", "SELECT",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRewrite {
    pub tokens: Vec<Token>,
    pub schema_keys: BTreeSet<String>,
    pub changed: bool,
}

enum ViewRef<'c> {
    State { by_version: bool },
    Entity { schema: &'c Schema, scope: ViewScope },
}

fn resolve<'c>(name: &str, catalog: &'c SchemaCatalog) -> Option<ViewRef<'c>> {
    if name.eq_ignore_ascii_case(STATE_VIEW) {
        return Some(ViewRef::State { by_version: false });
    }
    if name.eq_ignore_ascii_case(STATE_BY_VERSION_VIEW) {
        return Some(ViewRef::State { by_version: true });
    }
    catalog
        .resolve_view(name)
        .map(|(schema, scope)| ViewRef::Entity { schema, scope })
}

/// Names bound by a leading `WITH` clause.
fn cte_names(tokens: &[Token]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if !tokens.first().is_some_and(|t| t.is_keyword("WITH")) {
        return names;
    }
    let mut at = 1;
    if tokens.get(at).is_some_and(|t| t.is_keyword("RECURSIVE")) {
        at += 1;
    }
    while let Some(name) = tokens.get(at).and_then(Token::ident_name) {
        names.insert(name.to_ascii_lowercase());
        at += 1;
        if tokens.get(at).is_some_and(|t| t.is_punct("(")) {
            let Some(close) = matching_paren(tokens, at) else { break };
            at = close + 1;
        }
        if !tokens.get(at).is_some_and(|t| t.is_keyword("AS")) {
            break;
        }
        at += 1;
        while tokens
            .get(at)
            .is_some_and(|t| t.is_keyword("NOT") || t.is_keyword("MATERIALIZED"))
        {
            at += 1;
        }
        let Some(close) = matching_paren(tokens, at) else { break };
        at = close + 1;
        if !tokens.get(at).is_some_and(|t| t.is_punct(",")) {
            break;
        }
        at += 1;
    }
    names
}

/// Indexes of identifiers in table position.
fn table_refs(tokens: &[Token]) -> Vec<usize> {
    let mut refs = Vec::new();
    let mut expecting = false;
    // whether the current nesting level is inside a FROM clause
    let mut in_from = vec![false];
    for (index, token) in tokens.iter().enumerate() {
        if token.is_punct("(") {
            in_from.push(false);
            expecting = false;
            continue;
        }
        if token.is_punct(")") {
            in_from.pop();
            if in_from.is_empty() {
                in_from.push(false);
            }
            expecting = false;
            continue;
        }
        let level = in_from.len() - 1;
        if token.is_keyword("FROM") || token.is_keyword("JOIN") {
            in_from[level] = true;
            expecting = true;
        } else if CLAUSE_KEYWORDS.iter().any(|k| token.is_keyword(k)) {
            in_from[level] = false;
            expecting = false;
        } else if token.is_punct(",") {
            expecting = in_from[level];
        } else if expecting {
            let next = tokens.get(index + 1);
            if token.ident_name().is_some()
                && !next.is_some_and(|t| t.is_punct(".") || t.is_punct("("))
            {
                refs.push(index);
            }
            expecting = false;
        }
    }
    refs
}

/// Literal schema keys the statement restricts `schema_key` to, if it provably does.
fn literal_schema_keys(tokens: &[Token]) -> Option<BTreeSet<String>> {
    if tokens.iter().any(|t| t.is_keyword("OR")) {
        return None;
    }
    let mut keys = BTreeSet::new();
    for (index, token) in tokens.iter().enumerate() {
        if !token.is_ident("schema_key") {
            continue;
        }
        let equals = |t: Option<&Token>| t.is_some_and(|t| t.is_punct("=") || t.is_punct("=="));
        if equals(tokens.get(index + 1))
            && let Some(Token::Str(key)) = tokens.get(index + 2)
        {
            keys.insert(key.clone());
        } else if index >= 2
            && equals(tokens.get(index - 1))
            && let Some(Token::Str(key)) = tokens.get(index - 2)
        {
            keys.insert(key.clone());
        } else if tokens.get(index + 1).is_some_and(|t| t.is_keyword("IN"))
            && tokens.get(index + 2).is_some_and(|t| t.is_punct("("))
        {
            let close = matching_paren(tokens, index + 2)?;
            for item in &tokens[index + 3..close] {
                match item {
                    Token::Str(key) => {
                        keys.insert(key.clone());
                    }
                    Token::Punct(",") => {}
                    _ => return None,
                }
            }
        }
    }
    (!keys.is_empty()).then_some(keys)
}

fn state_subquery<'k>(keys: impl IntoIterator<Item = &'k String>, by_version: bool) -> String {
    let union: Vec<String> = keys.into_iter().map(|k| resolved_state_sql(k)).collect();
    let body = if union.is_empty() {
        let nulls: Vec<String> = STATE_COLUMNS.iter().map(|c| format!("NULL AS {c}")).collect();
        format!("SELECT {} WHERE 0", nulls.join(", "))
    } else {
        union.join(" UNION ALL ")
    };
    if by_version {
        body
    } else {
        format!("SELECT * FROM ({body}) {ACTIVE_VERSION_FILTER}")
    }
}

fn entity_subquery(schema: &Schema, scope: ViewScope) -> String {
    let mut columns: Vec<String> = schema
        .properties
        .keys()
        .map(|p| {
            format!(
                "json_extract(snapshot_content, {}) AS {}",
                quote_literal(&json_path(p)),
                Token::ident(p)
            )
        })
        .collect();
    columns.extend(SYS_COLUMNS.iter().map(|(view, state)| format!("{state} AS {view}")));
    let base = format!(
        "SELECT {} FROM ({})",
        columns.join(", "),
        resolved_state_sql(&schema.key)
    );
    match scope {
        ViewScope::Active => format!("{base} {ACTIVE_VERSION_FILTER}"),
        ViewScope::ByVersion => base,
    }
}

pub fn rewrite(tokens: Vec<Token>, catalog: &SchemaCatalog) -> Result<ReadRewrite, EngineError> {
    let ctes = cte_names(&tokens);
    let refs: Vec<(usize, ViewRef<'_>)> = table_refs(&tokens)
        .into_iter()
        .filter_map(|index| {
            let name = tokens[index].ident_name()?;
            if ctes.contains(&name.to_ascii_lowercase()) {
                return None;
            }
            resolve(name, catalog).map(|view| (index, view))
        })
        .collect();
    if refs.is_empty() {
        return Ok(ReadRewrite {
            tokens,
            schema_keys: BTreeSet::new(),
            changed: false,
        });
    }

    let mut schema_keys = BTreeSet::new();
    let state_keys: BTreeSet<String> = if refs.iter().any(|(_, v)| matches!(v, ViewRef::State { .. })) {
        match literal_schema_keys(&tokens) {
            Some(keys) => keys.into_iter().filter(|k| catalog.contains(k)).collect(),
            None => catalog.keys().map(String::from).collect(),
        }
    } else {
        BTreeSet::new()
    };
    schema_keys.extend(state_keys.iter().cloned());

    let mut out = TokenBuf::default();
    let mut next_ref = refs.iter().peekable();
    for (index, token) in tokens.iter().enumerate() {
        let Some((_, view)) = next_ref.next_if(|(i, _)| *i == index) else {
            out.tokens(std::slice::from_ref(token));
            continue;
        };
        let subquery = match view {
            ViewRef::State { by_version } => state_subquery(&state_keys, *by_version),
            ViewRef::Entity { schema, scope } => {
                schema_keys.insert(schema.key.clone());
                entity_subquery(schema, *scope)
            }
        };
        out.punct("(").tokens(&tokenize(&subquery)?).punct(")");
        let aliased = tokens
            .get(index + 1)
            .is_some_and(|t| t.is_keyword("AS") || t.ident_name().is_some());
        if !aliased {
            out.kw("AS").tokens(std::slice::from_ref(token));
        }
    }
    Ok(ReadRewrite {
        tokens: out.finish(),
        schema_keys,
        changed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::tests::todo_catalog;
    use crate::sql::token::render;
    use verstate_core::schema::PropertyType;

    fn read(sql: &str, catalog: &SchemaCatalog) -> ReadRewrite {
        rewrite(tokenize(sql).unwrap(), catalog).unwrap()
    }

    fn two_schemas() -> SchemaCatalog {
        let mut catalog = todo_catalog();
        catalog.insert(
            Schema::new("note", "1.0")
                .property("id", PropertyType::String)
                .primary_key(&["id"]),
        );
        catalog
    }

    #[test]
    fn entity_view_becomes_an_aliased_subquery() {
        let rewritten = read("SELECT title FROM todo WHERE done = 1", &todo_catalog());
        let sql = render(&rewritten.tokens);
        assert!(sql.starts_with("SELECT title FROM (SELECT json_extract(snapshot_content, '$.done') AS done"), "{sql}");
        assert!(sql.contains("FROM \"internal_cache_todo\""), "{sql}");
        assert!(sql.ends_with(") AS todo WHERE done = 1"), "{sql}");
        assert_eq!(rewritten.schema_keys, BTreeSet::from(["todo".to_string()]));
    }

    #[test]
    fn existing_aliases_are_kept() {
        let sql = render(&read("SELECT t.title FROM todo_by_version AS t", &todo_catalog()).tokens);
        assert!(sql.ends_with(") AS t"), "{sql}");
        assert!(!sql.contains("internal_active_version) AS t"));
    }

    #[test]
    fn state_reads_narrow_to_literal_keys() {
        let catalog = two_schemas();
        let rewritten = read("SELECT * FROM state WHERE schema_key = 'note'", &catalog);
        assert_eq!(rewritten.schema_keys, BTreeSet::from(["note".to_string()]));

        let rewritten = read(
            "SELECT * FROM state_by_version WHERE schema_key IN ('note', 'todo')",
            &catalog,
        );
        assert_eq!(rewritten.schema_keys.len(), 2);
    }

    #[test]
    fn disjunctions_read_every_schema() {
        let catalog = two_schemas();
        let rewritten = read(
            "SELECT * FROM state WHERE schema_key = 'note' OR entity_id = 'x'",
            &catalog,
        );
        assert_eq!(rewritten.schema_keys.len(), 2);
    }

    #[test]
    fn unknown_literal_keys_read_nothing() {
        let rewritten = read("SELECT * FROM state WHERE schema_key = 'ghost'", &todo_catalog());
        assert!(rewritten.schema_keys.is_empty());
        let sql = render(&rewritten.tokens);
        assert!(sql.contains("NULL AS entity_id"), "{sql}");
    }

    #[test]
    fn cte_names_shadow_views() {
        let rewritten = read(
            "WITH todo AS (SELECT 1 AS x) SELECT x FROM todo",
            &todo_catalog(),
        );
        assert!(!rewritten.changed);
    }

    #[test]
    fn joins_and_comma_lists_are_found() {
        let rewritten = read(
            "SELECT * FROM plain p JOIN todo t ON t.id = p.id, note WHERE 1",
            &two_schemas(),
        );
        assert_eq!(rewritten.schema_keys.len(), 2);
    }

    #[test]
    fn columns_and_functions_are_not_tables() {
        let rewritten = read("SELECT todo FROM plain WHERE note(1)", &two_schemas());
        assert!(!rewritten.changed);
    }
}
