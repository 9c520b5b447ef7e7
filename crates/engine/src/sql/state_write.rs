//! Writes against `state` and `state_by_version` are staged in
//! `internal_state_writes`. Updates and deletes select the matching live
//! rows, so each staged row carries the full new state of one entity.

use super::classify::{Classification, StatementKind};
use super::token::Token;
use super::{
    STATE_BY_VERSION_VIEW, STATE_VIEW, TokenBuf, find_top_level, parse_column_list, parse_tuples,
    split_commas,
};
use crate::error::EngineError;

const STAGING_TABLE: &str = "internal_state_writes";

const WRITABLE: [&str; 9] = [
    "entity_id",
    "schema_key",
    "file_id",
    "plugin_key",
    "schema_version",
    "version_id",
    "snapshot_content",
    "metadata",
    "untracked",
];

const ACTIVE_VERSION: &str = "(SELECT version_id FROM internal_active_version)";

struct StateTarget {
    by_version: bool,
    /// Target name plus optional alias, as written.
    tokens: Vec<Token>,
    end: usize,
}

fn parse_target(tokens: &[Token], at: usize) -> Option<StateTarget> {
    let name = tokens.get(at)?.ident_name()?;
    let by_version = if name.eq_ignore_ascii_case(STATE_VIEW) {
        false
    } else if name.eq_ignore_ascii_case(STATE_BY_VERSION_VIEW) {
        true
    } else {
        return None;
    };
    if tokens.get(at + 1).is_some_and(|t| t.is_punct(".")) {
        return None;
    }
    let mut end = at + 1;
    if tokens.get(end).is_some_and(|t| t.is_keyword("AS")) {
        end += 1;
    }
    if tokens.get(end).and_then(Token::ident_name).is_some() {
        end += 1;
    } else if end > at + 1 {
        return None;
    }
    Some(StateTarget {
        by_version,
        tokens: tokens[at..end].to_vec(),
        end,
    })
}

fn writable(name: &str) -> Result<&'static str, EngineError> {
    WRITABLE
        .iter()
        .find(|c| c.eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| EngineError::schema(STATE_VIEW, format!("column '{name}' is not writable")))
}

pub fn rewrite(tokens: &[Token], class: Classification) -> Result<Option<Vec<Token>>, EngineError> {
    let (target_at, kind) = match class.kind {
        StatementKind::Insert => {
            let mut at = class.verb + 1;
            if tokens[class.verb].is_keyword("INSERT")
                && tokens.get(at).is_some_and(|t| t.is_keyword("OR"))
            {
                at += 2;
            }
            if !tokens.get(at).is_some_and(|t| t.is_keyword("INTO")) {
                return Ok(None);
            }
            (at + 1, class.kind)
        }
        StatementKind::Update => {
            let mut at = class.verb + 1;
            if tokens.get(at).is_some_and(|t| t.is_keyword("OR")) {
                at += 2;
            }
            (at, class.kind)
        }
        StatementKind::Delete => {
            if !tokens.get(class.verb + 1).is_some_and(|t| t.is_keyword("FROM")) {
                return Ok(None);
            }
            (class.verb + 2, class.kind)
        }
        _ => return Ok(None),
    };
    let Some(target) = parse_target(tokens, target_at) else {
        return Ok(None);
    };
    if class.has_with {
        return Err(EngineError::UnresolvedRewrite("WITH clause on a state write".into()));
    }
    let rewritten = match kind {
        StatementKind::Insert => stage_insert(tokens, &target)?,
        StatementKind::Update => stage_update(tokens, &target)?,
        _ => stage_delete(tokens, &target)?,
    };
    Ok(Some(rewritten))
}

fn stage_insert(tokens: &[Token], target: &StateTarget) -> Result<Vec<Token>, EngineError> {
    if target.tokens.len() > 1 {
        return Err(EngineError::UnresolvedRewrite("aliased insert target".into()));
    }
    if !tokens.get(target.end).is_some_and(|t| t.is_punct("(")) {
        return Err(EngineError::UnresolvedRewrite("insert without a column list".into()));
    }
    let (names, after) = parse_column_list(tokens, target.end)?;
    if !tokens.get(after).is_some_and(|t| t.is_keyword("VALUES")) {
        return Err(EngineError::UnresolvedRewrite("insert from a query".into()));
    }
    let (rows, end) = parse_tuples(tokens, after + 1)?;
    if end != tokens.len() {
        return Err(EngineError::UnresolvedRewrite("upsert or returning clause".into()));
    }

    let columns = names
        .iter()
        .map(|n| writable(n))
        .collect::<Result<Vec<_>, _>>()?;
    let add_active_version = !target.by_version && !columns.contains(&"version_id");

    let mut out = TokenBuf::default();
    out.kw("INSERT").kw("INTO").ident(STAGING_TABLE).punct("(");
    out.list(columns.iter(), |buf, c| {
        buf.ident(c);
    });
    if add_active_version {
        out.punct(",").ident("version_id");
    }
    out.punct(")").kw("VALUES");
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(EngineError::schema(
                STATE_VIEW,
                format!("{} values for {} columns", row.len(), columns.len()),
            ));
        }
        if index > 0 {
            out.punct(",");
        }
        out.punct("(");
        out.list(row.iter(), |buf, expr| {
            buf.tokens(expr);
        });
        if add_active_version {
            out.punct(",").sql(ACTIVE_VERSION)?;
        }
        out.punct(")");
    }
    Ok(out.finish())
}

/// `INSERT INTO internal_state_writes (...) SELECT` header shared by updates and deletes.
fn staged_select(out: &mut TokenBuf) {
    out.kw("INSERT").kw("INTO").ident(STAGING_TABLE).punct("(");
    out.list(WRITABLE.iter(), |buf, c| {
        buf.ident(c);
    });
    out.punct(",").ident("origin_entity_id").punct(")").kw("SELECT");
}

fn from_target(out: &mut TokenBuf, target: &StateTarget, filter: &[Token]) {
    out.kw("FROM").tokens(&target.tokens);
    if !filter.is_empty() {
        out.kw("WHERE").tokens(filter);
    }
}

fn trailing_filter(tokens: &[Token], at: usize) -> Result<&[Token], EngineError> {
    match tokens.get(at) {
        None => Ok(&[]),
        Some(t) if t.is_keyword("WHERE") => {
            let rest = &tokens[at + 1..];
            let trailing = find_top_level(rest, 0, |t| {
                t.is_keyword("RETURNING") || t.is_keyword("ORDER") || t.is_keyword("LIMIT")
            });
            match trailing {
                Some(_) => Err(EngineError::UnresolvedRewrite("returning or limit clause".into())),
                None => Ok(rest),
            }
        }
        Some(t) => Err(EngineError::UnresolvedRewrite(format!("unsupported clause {t}"))),
    }
}

fn stage_update(tokens: &[Token], target: &StateTarget) -> Result<Vec<Token>, EngineError> {
    if !tokens.get(target.end).is_some_and(|t| t.is_keyword("SET")) {
        return Err(EngineError::UnresolvedRewrite("update without SET".into()));
    }
    let set_start = target.end + 1;
    let set_end = find_top_level(tokens, set_start, |t| {
        ["WHERE", "FROM", "RETURNING", "ORDER", "LIMIT"]
            .iter()
            .any(|k| t.is_keyword(k))
    })
    .unwrap_or(tokens.len());
    let filter = trailing_filter(tokens, set_end)?;

    let mut assigned: Vec<(&'static str, &[Token])> = Vec::new();
    for assignment in split_commas(&tokens[set_start..set_end]) {
        let [name, eq, expr @ ..] = assignment else {
            return Err(EngineError::UnresolvedRewrite("malformed assignment".into()));
        };
        let Some(name) = name.ident_name().filter(|_| eq.is_punct("=") && !expr.is_empty()) else {
            return Err(EngineError::UnresolvedRewrite("unsupported assignment".into()));
        };
        assigned.push((writable(name)?, expr));
    }

    let mut out = TokenBuf::default();
    staged_select(&mut out);
    for column in WRITABLE {
        match assigned.iter().rev().find(|(c, _)| *c == column) {
            Some((_, expr)) => out.punct("(").tokens(expr).punct(")"),
            None => out.ident(column),
        };
        out.punct(",");
    }
    out.ident("entity_id");
    from_target(&mut out, target, filter);
    Ok(out.finish())
}

fn stage_delete(tokens: &[Token], target: &StateTarget) -> Result<Vec<Token>, EngineError> {
    let filter = trailing_filter(tokens, target.end)?;
    let mut out = TokenBuf::default();
    staged_select(&mut out);
    out.sql(
        "entity_id, schema_key, file_id, plugin_key, schema_version, version_id, NULL, metadata, untracked, entity_id",
    )?;
    from_target(&mut out, target, filter);
    Ok(out.finish())
}
