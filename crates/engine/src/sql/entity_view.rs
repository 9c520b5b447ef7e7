//! Writes against entity views become writes against the state views.
//!
//! An entity view `K` exposes one column per property of schema `K` plus the
//! `sys_*` columns. `K_by_version` additionally addresses rows of any version
//! through `sys_version_id`.

use serde_json::Value;
use verstate_core::schema::{PropertyType, Schema, is_plain_identifier};

use super::classify::{Classification, StatementKind};
use super::token::Token;
use super::{
    SchemaCatalog, STATE_BY_VERSION_VIEW, STATE_VIEW, TokenBuf, ViewScope, find_top_level,
    parse_column_list, parse_tuples, split_commas,
};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Entity view column to state column.
pub const SYS_COLUMNS: [(&str, &str); 13] = [
    ("sys_entity_id", "entity_id"),
    ("sys_schema_key", "schema_key"),
    ("sys_file_id", "file_id"),
    ("sys_plugin_key", "plugin_key"),
    ("sys_version_id", "version_id"),
    ("sys_inherited_from_version_id", "inherited_from_version_id"),
    ("sys_change_id", "change_id"),
    ("sys_commit_id", "commit_id"),
    ("sys_metadata", "metadata"),
    ("sys_untracked", "untracked"),
    ("sys_schema_version", "schema_version"),
    ("sys_created_at", "created_at"),
    ("sys_updated_at", "updated_at"),
];

const INSERTABLE: [&str; 6] = [
    "sys_entity_id",
    "sys_file_id",
    "sys_plugin_key",
    "sys_version_id",
    "sys_metadata",
    "sys_untracked",
];

const UPDATABLE: [&str; 2] = ["sys_metadata", "sys_untracked"];

pub fn sys_column(name: &str) -> Option<&'static str> {
    SYS_COLUMNS
        .iter()
        .find(|(view, _)| view.eq_ignore_ascii_case(name))
        .map(|(_, state)| *state)
}

/// JSON path addressing a top-level property.
pub fn json_path(property: &str) -> String {
    if is_plain_identifier(property) {
        format!("$.{property}")
    } else {
        format!("$.\"{}\"", property.replace('"', "\\\""))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column<'s> {
    Property(&'s str),
    Sys(&'static str),
}

fn column<'s>(schema: &'s Schema, name: &str) -> Option<Column<'s>> {
    if let Some((key, _)) = schema.properties.get_key_value(name) {
        return Some(Column::Property(key));
    }
    if let Some(key) = schema.properties.keys().find(|k| k.eq_ignore_ascii_case(name)) {
        return Some(Column::Property(key));
    }
    SYS_COLUMNS
        .iter()
        .find(|(view, _)| view.eq_ignore_ascii_case(name))
        .map(|(view, _)| Column::Sys(view))
}

fn position(columns: &[Column<'_>], col: Column<'_>) -> Option<usize> {
    columns.iter().position(|c| *c == col)
}

struct Target<'c> {
    schema: &'c Schema,
    scope: ViewScope,
    /// Names the rows may be qualified with.
    qualifiers: Vec<String>,
    end: usize,
}

fn parse_target<'c>(tokens: &[Token], at: usize, catalog: &'c SchemaCatalog) -> Option<Target<'c>> {
    let name = tokens.get(at)?.ident_name()?;
    if tokens.get(at + 1).is_some_and(|t| t.is_punct(".")) {
        return None;
    }
    let (schema, scope) = catalog.resolve_view(name)?;
    let mut qualifiers = vec![name.to_string()];
    let mut end = at + 1;
    if tokens.get(end).is_some_and(|t| t.is_keyword("AS")) {
        end += 1;
    }
    if let Some(alias) = tokens.get(end).and_then(Token::ident_name) {
        qualifiers.push(alias.to_string());
        end += 1;
    }
    Some(Target {
        schema,
        scope,
        qualifiers,
        end,
    })
}

fn state_view(by_version: bool) -> &'static str {
    if by_version {
        STATE_BY_VERSION_VIEW
    } else {
        STATE_VIEW
    }
}

pub fn rewrite(
    tokens: &[Token],
    class: Classification,
    catalog: &SchemaCatalog,
    config: &EngineConfig,
) -> Result<Option<Vec<Token>>, EngineError> {
    match class.kind {
        StatementKind::Insert => rewrite_insert(tokens, class, catalog, config),
        StatementKind::Update => rewrite_update(tokens, class, catalog, config),
        StatementKind::Delete => rewrite_delete(tokens, class, catalog),
        _ => Ok(None),
    }
}

/// Replace property and `sys_*` references in an expression with state columns.
fn rewrite_expr(tokens: &[Token], schema: &Schema, qualifiers: &[String]) -> Vec<Token> {
    let mut out = TokenBuf::default();
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        let qualified = token.ident_name().is_some_and(|q| {
            qualifiers.iter().any(|name| name.eq_ignore_ascii_case(q))
        }) && tokens.get(i + 1).is_some_and(|t| t.is_punct("."))
            && tokens.get(i + 2).and_then(Token::ident_name).is_some();
        let (name_at, skip) = if qualified { (i + 2, 3) } else { (i, 1) };
        let candidate = &tokens[name_at];
        let bare = qualified
            || ((i == 0 || !tokens[i - 1].is_punct("."))
                && !tokens.get(i + 1).is_some_and(|t| t.is_punct(".") || t.is_punct("(")));
        match candidate.ident_name().filter(|_| bare).and_then(|n| column(schema, n)) {
            Some(Column::Property(p)) => {
                out.ident("json_extract")
                    .punct("(")
                    .ident("snapshot_content")
                    .punct(",")
                    .string(&json_path(p))
                    .punct(")");
                i += skip;
            }
            Some(Column::Sys(view)) => {
                out.ident(sys_column(view).unwrap_or(view));
                i += skip;
            }
            None => {
                out.tokens(std::slice::from_ref(token));
                i += 1;
            }
        }
    }
    out.finish()
}

/// Value expression for a property, parsing JSON text for structured types.
fn property_value(buf: &mut TokenBuf, schema: &Schema, property: &str, expr: &[Token]) {
    let structured = schema
        .properties
        .get(property)
        .is_some_and(|d| matches!(d.kind, PropertyType::Object | PropertyType::Array));
    if structured {
        buf.ident("json").punct("(").tokens(expr).punct(")");
    } else {
        buf.punct("(").tokens(expr).punct(")");
    }
}

fn default_literal(buf: &mut TokenBuf, value: &Value) {
    buf.ident("json").punct("(").string(&value.to_string()).punct(")");
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(String::from(if *b { "1" } else { "0" })),
        _ => None,
    }
}

/// Entity id expression joining the primary-key parts with the separator.
fn entity_id_expr(
    buf: &mut TokenBuf,
    schema: &Schema,
    separator: &str,
    mut part: impl FnMut(&mut TokenBuf, &str) -> Result<(), EngineError>,
) -> Result<(), EngineError> {
    if schema.primary_key.is_empty() {
        return Err(EngineError::schema(&schema.key, "schema has no primary key"));
    }
    for (index, pk) in schema.primary_key.iter().enumerate() {
        if index > 0 {
            buf.punct("||").string(separator).punct("||");
        }
        part(buf, pk)?;
    }
    Ok(())
}

fn rewrite_insert(
    tokens: &[Token],
    class: Classification,
    catalog: &SchemaCatalog,
    config: &EngineConfig,
) -> Result<Option<Vec<Token>>, EngineError> {
    let mut at = class.verb + 1;
    if tokens[class.verb].is_keyword("INSERT") && tokens.get(at).is_some_and(|t| t.is_keyword("OR")) {
        at += 2;
    }
    if !tokens.get(at).is_some_and(|t| t.is_keyword("INTO")) {
        return Ok(None);
    }
    let Some(target) = parse_target(tokens, at + 1, catalog) else {
        return Ok(None);
    };
    let schema = target.schema;
    if class.has_with {
        return Err(EngineError::UnresolvedRewrite("WITH clause on an entity view write".into()));
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

    let mut columns: Vec<Column<'_>> = Vec::with_capacity(names.len());
    for name in &names {
        let col = column(schema, name)
            .ok_or_else(|| EngineError::schema(&schema.key, format!("unknown column '{name}'")))?;
        if let Column::Sys(view) = col
            && !INSERTABLE.contains(&view)
        {
            return Err(EngineError::schema(&schema.key, format!("column '{name}' is read-only")));
        }
        if columns.contains(&col) {
            return Err(EngineError::schema(&schema.key, format!("column '{name}' given twice")));
        }
        columns.push(col);
    }

    let override_version = schema.override_str("sys_version_id");
    let by_version = target.scope == ViewScope::ByVersion
        || override_version.is_some()
        || columns.contains(&Column::Sys("sys_version_id"));
    if target.scope == ViewScope::ByVersion
        && override_version.is_none()
        && !columns.contains(&Column::Sys("sys_version_id"))
    {
        return Err(EngineError::schema(
            &schema.key,
            "sys_version_id is required when writing by version",
        ));
    }

    let mut out = TokenBuf::default();
    out.kw("INSERT").kw("INTO").ident(state_view(by_version)).punct("(");
    out.sql("entity_id, schema_key, file_id, plugin_key, schema_version, ")?;
    if by_version {
        out.sql("version_id, ")?;
    }
    out.sql("snapshot_content, metadata, untracked) VALUES")?;

    for (row_index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(EngineError::schema(
                &schema.key,
                format!("{} values for {} columns", row.len(), columns.len()),
            ));
        }
        let value = |col: Column<'_>| position(&columns, col).map(|i| row[i]);
        if row_index > 0 {
            out.punct(",");
        }
        out.punct("(");

        if let Some(expr) = value(Column::Sys("sys_entity_id")) {
            out.punct("(").tokens(expr).punct(")");
        } else {
            entity_id_expr(&mut out, schema, &config.entity_id_separator, |buf, pk| {
                if let Some(expr) = value(Column::Property(pk)) {
                    buf.kw("CAST").punct("(").tokens(expr).kw("AS").ident("TEXT").punct(")");
                    Ok(())
                } else if let Some(text) = schema.defaults.get(pk).and_then(scalar_text) {
                    buf.string(&text);
                    Ok(())
                } else {
                    Err(EngineError::schema(
                        &schema.key,
                        format!("primary key property '{pk}' is required"),
                    ))
                }
            })?;
        }
        out.punct(",").string(&schema.key).punct(",");

        for (column, fallback) in [
            ("sys_file_id", &config.default_file_id),
            ("sys_plugin_key", &config.default_plugin_key),
        ] {
            match value(Column::Sys(column)) {
                Some(expr) => out.punct("(").tokens(expr).punct(")"),
                None => out.string(schema.override_str(column).unwrap_or(fallback.as_str())),
            };
            out.punct(",");
        }
        out.string(&schema.version).punct(",");

        if by_version {
            match (value(Column::Sys("sys_version_id")), override_version) {
                (Some(expr), _) => out.punct("(").tokens(expr).punct(")"),
                (None, Some(version)) => out.string(version),
                (None, None) => out.kw("NULL"),
            };
            out.punct(",");
        }

        let properties: Vec<(&String, Option<&[Token]>)> = schema
            .properties
            .keys()
            .map(|p| (p, value(Column::Property(p))))
            .filter(|(p, expr)| expr.is_some() || schema.defaults.contains_key(*p))
            .collect();
        out.ident("json_object").punct("(");
        out.list(properties, |buf, (property, expr)| {
            buf.string(property).punct(",");
            match expr {
                Some(expr) => property_value(buf, schema, property, expr),
                None => {
                    if let Some(default) = schema.defaults.get(property) {
                        default_literal(buf, default);
                    }
                }
            }
        });
        out.punct(")").punct(",");

        match value(Column::Sys("sys_metadata")) {
            Some(expr) => out.ident("json").punct("(").tokens(expr).punct(")"),
            None => out.kw("NULL"),
        };
        out.punct(",");
        match value(Column::Sys("sys_untracked")) {
            Some(expr) => out.punct("(").tokens(expr).punct(")"),
            None => out.tokens(&[Token::Number("0".into())]),
        };
        out.punct(")");
    }
    Ok(Some(out.finish()))
}

/// The trailing `WHERE` of an update or delete. Other trailing clauses are not supported.
fn where_clause(tokens: &[Token], at: usize) -> Result<Option<&[Token]>, EngineError> {
    match tokens.get(at) {
        None => Ok(None),
        Some(t) if t.is_keyword("WHERE") => {
            let rest = &tokens[at + 1..];
            let trailing = find_top_level(rest, 0, |t| {
                t.is_keyword("RETURNING") || t.is_keyword("ORDER") || t.is_keyword("LIMIT")
            });
            if trailing.is_some() {
                return Err(EngineError::UnresolvedRewrite("returning or limit clause".into()));
            }
            Ok(Some(rest))
        }
        Some(t) => Err(EngineError::UnresolvedRewrite(format!("unsupported clause {t}"))),
    }
}

fn scope_filter(out: &mut TokenBuf, target: &Target<'_>, filter: Option<&[Token]>) {
    let schema = target.schema;
    out.kw("WHERE").ident("schema_key").punct("=").string(&schema.key);
    if target.scope == ViewScope::Active
        && let Some(version) = schema.override_str("sys_version_id")
    {
        out.kw("AND").ident("version_id").punct("=").string(version);
    }
    if let Some(filter) = filter {
        out.kw("AND")
            .punct("(")
            .tokens(&rewrite_expr(filter, schema, &target.qualifiers))
            .punct(")");
    }
}

fn writes_by_version(target: &Target<'_>) -> bool {
    target.scope == ViewScope::ByVersion || target.schema.override_str("sys_version_id").is_some()
}

fn rewrite_update(
    tokens: &[Token],
    class: Classification,
    catalog: &SchemaCatalog,
    config: &EngineConfig,
) -> Result<Option<Vec<Token>>, EngineError> {
    let mut at = class.verb + 1;
    if tokens.get(at).is_some_and(|t| t.is_keyword("OR")) {
        at += 2;
    }
    let Some(target) = parse_target(tokens, at, catalog) else {
        return Ok(None);
    };
    let schema = target.schema;
    if schema.immutable {
        return Err(EngineError::ImmutableSchemaViolation {
            schema_key: schema.key.clone(),
        });
    }
    if class.has_with {
        return Err(EngineError::UnresolvedRewrite("WITH clause on an entity view write".into()));
    }
    if !tokens.get(target.end).is_some_and(|t| t.is_keyword("SET")) {
        return Ok(None);
    }
    let set_start = target.end + 1;
    let set_end = find_top_level(tokens, set_start, |t| {
        ["WHERE", "FROM", "RETURNING", "ORDER", "LIMIT"]
            .iter()
            .any(|k| t.is_keyword(k))
    })
    .unwrap_or(tokens.len());
    let filter = where_clause(tokens, set_end)?;

    let mut properties: Vec<(&str, Vec<Token>)> = Vec::new();
    let mut sys: Vec<(&'static str, Vec<Token>)> = Vec::new();
    for assignment in split_commas(&tokens[set_start..set_end]) {
        let [name, eq, expr @ ..] = assignment else {
            return Err(EngineError::UnresolvedRewrite("malformed assignment".into()));
        };
        let Some(name) = name.ident_name().filter(|_| eq.is_punct("=") && !expr.is_empty()) else {
            return Err(EngineError::UnresolvedRewrite("unsupported assignment".into()));
        };
        let expr = rewrite_expr(expr, schema, &target.qualifiers);
        match column(schema, name) {
            Some(Column::Property(p)) => properties.push((p, expr)),
            Some(Column::Sys(view)) if UPDATABLE.contains(&view) => sys.push((view, expr)),
            Some(Column::Sys(_)) => {
                return Err(EngineError::schema(&schema.key, format!("column '{name}' is read-only")));
            }
            None => {
                return Err(EngineError::schema(&schema.key, format!("unknown column '{name}'")));
            }
        }
    }

    let mut out = TokenBuf::default();
    out.kw("UPDATE").ident(state_view(writes_by_version(&target))).kw("SET");
    let mut first = true;
    let mut separate = |out: &mut TokenBuf| {
        if !first {
            out.punct(",");
        }
        first = false;
    };

    if !properties.is_empty() {
        separate(&mut out);
        out.ident("snapshot_content").punct("=").ident("json_set").punct("(").ident("snapshot_content");
        for (property, expr) in &properties {
            out.punct(",").string(&json_path(property)).punct(",");
            property_value(&mut out, schema, property, expr);
        }
        out.punct(")");

        if properties.iter().any(|(p, _)| schema.primary_key.iter().any(|pk| pk.as_str() == *p)) {
            separate(&mut out);
            out.ident("entity_id").punct("=");
            entity_id_expr(&mut out, schema, &config.entity_id_separator, |buf, pk| {
                buf.kw("CAST").punct("(");
                match properties.iter().find(|(p, _)| *p == pk) {
                    Some((_, expr)) => buf.punct("(").tokens(expr).punct(")"),
                    None => buf
                        .ident("json_extract")
                        .punct("(")
                        .ident("snapshot_content")
                        .punct(",")
                        .string(&json_path(pk))
                        .punct(")"),
                };
                buf.kw("AS").ident("TEXT").punct(")");
                Ok(())
            })?;
        }
    }
    for (view, expr) in &sys {
        separate(&mut out);
        let column = sys_column(view).unwrap_or(*view);
        out.ident(column).punct("=");
        if *view == "sys_metadata" {
            out.ident("json").punct("(").tokens(expr).punct(")");
        } else {
            out.punct("(").tokens(expr).punct(")");
        }
    }
    scope_filter(&mut out, &target, filter);
    Ok(Some(out.finish()))
}

fn rewrite_delete(
    tokens: &[Token],
    class: Classification,
    catalog: &SchemaCatalog,
) -> Result<Option<Vec<Token>>, EngineError> {
    if !tokens.get(class.verb + 1).is_some_and(|t| t.is_keyword("FROM")) {
        return Ok(None);
    }
    let Some(target) = parse_target(tokens, class.verb + 2, catalog) else {
        return Ok(None);
    };
    if target.schema.immutable {
        return Err(EngineError::ImmutableSchemaViolation {
            schema_key: target.schema.key.clone(),
        });
    }
    if class.has_with {
        return Err(EngineError::UnresolvedRewrite("WITH clause on an entity view write".into()));
    }
    let filter = where_clause(tokens, target.end)?;

    let mut out = TokenBuf::default();
    out.kw("DELETE").kw("FROM").ident(state_view(writes_by_version(&target)));
    scope_filter(&mut out, &target, filter);
    Ok(Some(out.finish()))
}
