//! Tagged tokens for the SQL surface.
//!
//! Rewrites operate on token streams and render them back to text, so
//! literals and identifiers never need re-escaping by hand. Parameters are
//! renumbered to explicit `?N` placeholders following SQLite's numbering,
//! which keeps bindings stable when a rewrite moves or repeats them.

use std::collections::HashMap;
use std::fmt;

use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Location, Token as SqlToken, Tokenizer, Word};

use crate::error::EngineError;

const KEYWORDS: &[&str] = &[
    "ALL", "ALTER", "ANALYZE", "AND", "AS", "ASC", "ATTACH", "BEGIN", "BETWEEN", "BY", "CASE",
    "CAST", "COLLATE", "COMMIT", "CONFLICT", "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC",
    "DETACH", "DISTINCT", "DO", "DROP", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "EXPLAIN",
    "FILTER", "FROM", "FULL", "GLOB", "GROUP", "HAVING", "IGNORE", "IN", "INDEX", "INNER",
    "INSERT", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "LEFT", "LIKE", "LIMIT", "MATERIALIZED",
    "NATURAL", "NOT", "NOTHING", "NOTNULL", "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "OVER",
    "PARTITION", "PRAGMA", "RECURSIVE", "REINDEX", "RELEASE", "REPLACE", "RETURNING", "RIGHT",
    "ROLLBACK", "SAVEPOINT", "SELECT", "SET", "TABLE", "TEMP", "TEMPORARY", "THEN", "TRIGGER",
    "UNION", "UPDATE", "USING", "VACUUM", "VALUES", "VIEW", "WHEN", "WHERE", "WINDOW", "WITH",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Uppercased.
    Keyword(String),
    Ident { name: String, quoted: bool },
    Str(String),
    Number(String),
    /// Hex digits of an `X'..'` literal.
    Blob(String),
    Param(usize),
    Punct(&'static str),
}

impl Token {
    pub fn kw(keyword: &str) -> Self {
        Self::Keyword(keyword.to_ascii_uppercase())
    }

    pub fn ident(name: &str) -> Self {
        Self::Ident {
            name: name.to_string(),
            quoted: !is_bare_identifier(name),
        }
    }

    pub fn string(value: &str) -> Self {
        Self::Str(value.to_string())
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Keyword(k) if k == keyword)
    }

    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, Self::Punct(op) if *op == p)
    }

    pub fn ident_name(&self) -> Option<&str> {
        match self {
            Self::Ident { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Identifier matching `name` without regard to ASCII case.
    pub fn is_ident(&self, name: &str) -> bool {
        self.ident_name().is_some_and(|n| n.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyword(k) => f.write_str(k),
            Self::Ident { name, quoted: false } => f.write_str(name),
            Self::Ident { name, quoted: true } => write!(f, "\"{}\"", name.replace('"', "\"\"")),
            Self::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Number(n) => f.write_str(n),
            Self::Blob(hex) => write!(f, "X'{hex}'"),
            Self::Param(index) => write!(f, "?{index}"),
            Self::Punct(p) => f.write_str(p),
        }
    }
}

fn is_bare_identifier(name: &str) -> bool {
    verstate_core::schema::is_plain_identifier(name)
        && !KEYWORDS.contains(&name.to_ascii_uppercase().as_str())
}

#[derive(Debug, Default)]
struct ParamNumbering {
    max: usize,
    named: HashMap<String, usize>,
}

impl ParamNumbering {
    fn positional(&mut self) -> usize {
        self.max += 1;
        self.max
    }

    fn numbered(&mut self, index: usize) -> usize {
        self.max = self.max.max(index);
        index
    }

    fn named(&mut self, name: &str) -> usize {
        if let Some(index) = self.named.get(name) {
            return *index;
        }
        let index = self.positional();
        self.named.insert(name.to_string(), index);
        index
    }

    /// Number a placeholder as written: `?`, `?N`, or a named `:a`/`@a`/`$a`.
    fn placeholder(&mut self, text: &str) -> Result<usize, String> {
        match text.strip_prefix('?') {
            Some("") => Ok(self.positional()),
            Some(digits) => {
                let index: usize = digits
                    .parse()
                    .map_err(|_| format!("bad parameter {text}"))?;
                if index == 0 {
                    return Err("parameter index must be positive".into());
                }
                Ok(self.numbered(index))
            }
            None => Ok(self.named(text)),
        }
    }
}

/// Byte offsets of the 1-based line/column locations the tokenizer reports.
struct LineIndex<'a> {
    sql: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(sql: &'a str) -> Self {
        let starts = std::iter::once(0)
            .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { sql, starts }
    }

    fn offset(&self, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&start) = self.starts.get(line) else {
            return self.sql.len();
        };
        let column = (location.column as usize).saturating_sub(1);
        self.sql[start..]
            .char_indices()
            .nth(column)
            .map_or(self.sql.len(), |(i, _)| start + i)
    }
}

fn punct(token: &SqlToken) -> Option<&'static str> {
    Some(match token {
        SqlToken::Comma => ",",
        SqlToken::LParen => "(",
        SqlToken::RParen => ")",
        SqlToken::Period => ".",
        SqlToken::SemiColon => ";",
        SqlToken::Eq => "=",
        SqlToken::DoubleEq => "==",
        SqlToken::Neq => "<>",
        SqlToken::Lt => "<",
        SqlToken::Gt => ">",
        SqlToken::LtEq => "<=",
        SqlToken::GtEq => ">=",
        SqlToken::Plus => "+",
        SqlToken::Minus => "-",
        SqlToken::Mul => "*",
        SqlToken::Div => "/",
        SqlToken::Mod => "%",
        SqlToken::StringConcat => "||",
        SqlToken::Ampersand => "&",
        SqlToken::Pipe => "|",
        SqlToken::Tilde => "~",
        SqlToken::ShiftLeft => "<<",
        SqlToken::ShiftRight => ">>",
        SqlToken::Arrow => "->",
        SqlToken::LongArrow => "->>",
        _ => return None,
    })
}

fn word_token(word: Word, params: &mut ParamNumbering) -> Token {
    if word.quote_style.is_some() {
        return Token::Ident {
            name: word.value,
            quoted: true,
        };
    }
    if word.value.starts_with(|c: char| matches!(c, '$' | '@' | ':')) {
        return Token::Param(params.named(&word.value));
    }
    let upper = word.value.to_ascii_uppercase();
    if KEYWORDS.contains(&upper.as_str()) {
        Token::Keyword(upper)
    } else {
        Token::Ident {
            name: word.value,
            quoted: false,
        }
    }
}

/// Tokens of `sql`, each with the byte offset where it starts.
///
/// Lexing is done by the `sqlparser` tokenizer in its SQLite dialect; this
/// layer drops trivia, tags words against the keywords the rewrites care
/// about and numbers parameters.
fn lex(sql: &str) -> Result<Vec<(Token, usize)>, EngineError> {
    let index = LineIndex::new(sql);
    let dialect = SQLiteDialect {};
    let spanned = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|err| EngineError::Syntax {
            offset: index.offset(err.location),
            message: err.message,
        })?;

    let mut params = ParamNumbering::default();
    let mut out = Vec::with_capacity(spanned.len());
    let mut tokens = spanned.into_iter().peekable();
    while let Some(spanned) = tokens.next() {
        let offset = index.offset(spanned.span.start);

        // `:name` and `@name` arrive as a sigil followed by a bare word
        let sigil = match &spanned.token {
            SqlToken::Colon => Some(':'),
            SqlToken::AtSign => Some('@'),
            _ => None,
        };
        if let Some(sigil) = sigil
            && let Some(next) = tokens.next_if(
                |t| matches!(&t.token, SqlToken::Word(w) if w.quote_style.is_none()),
            )
            && let SqlToken::Word(word) = next.token
        {
            let slot = params.named(&format!("{sigil}{}", word.value));
            out.push((Token::Param(slot), offset));
            continue;
        }

        let token = match spanned.token {
            SqlToken::EOF | SqlToken::Whitespace(_) => continue,
            SqlToken::Word(word) => word_token(word, &mut params),
            SqlToken::SingleQuotedString(value) => Token::Str(value),
            SqlToken::DoubleQuotedString(name) => Token::Ident { name, quoted: true },
            SqlToken::Number(digits, _) => Token::Number(digits),
            SqlToken::HexStringLiteral(hex) if sql[offset..].starts_with('0') => {
                Token::Number(format!("0x{hex}"))
            }
            SqlToken::HexStringLiteral(hex) => Token::Blob(hex),
            SqlToken::Placeholder(text) => Token::Param(
                params
                    .placeholder(&text)
                    .map_err(|message| EngineError::Syntax { offset, message })?,
            ),
            other => Token::Punct(punct(&other).ok_or_else(|| EngineError::Syntax {
                offset,
                message: format!("unexpected token '{other}'"),
            })?),
        };
        out.push((token, offset));
    }
    Ok(out)
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, EngineError> {
    Ok(lex(sql)?.into_iter().map(|(token, _)| token).collect())
}

fn needs_space(prev: &Token, next: &Token) -> bool {
    if prev.is_punct("(") || prev.is_punct(".") {
        return false;
    }
    if next.is_punct(")") || next.is_punct(",") || next.is_punct(".") || next.is_punct(";") {
        return false;
    }
    !(next.is_punct("(") && (matches!(prev, Token::Ident { .. }) || prev.is_keyword("CAST")))
}

pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;
    for token in tokens {
        if let Some(p) = prev
            && needs_space(p, token)
        {
            out.push(' ');
        }
        out.push_str(&token.to_string());
        prev = Some(token);
    }
    out
}

/// Split a script into statements at top-level semicolons.
///
/// Trigger bodies contain semicolons of their own and only end at `END;`.
pub fn split_statements(sql: &str) -> Result<Vec<String>, EngineError> {
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut leading: Vec<Token> = Vec::new();
    let mut prev: Option<Token> = None;
    for (token, offset) in lex(sql)? {
        if token.is_punct(";") {
            let in_trigger = leading.first().is_some_and(|t| t.is_keyword("CREATE"))
                && leading.iter().any(|t| t.is_keyword("TRIGGER"));
            let closes = !in_trigger || prev.as_ref().is_some_and(|p| p.is_keyword("END"));
            if closes {
                let statement = sql[start..offset].trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                start = offset + 1;
                leading.clear();
                prev = None;
                continue;
            }
        }
        if leading.len() < 4 {
            leading.push(token.clone());
        }
        prev = Some(token);
    }
    let tail = sql[start..].trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_tokens() {
        let tokens = tokenize("select \"Name\", 'it''s' from todo where id = ?").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::kw("SELECT"),
                Token::Ident { name: "Name".into(), quoted: true },
                Token::Punct(","),
                Token::Str("it's".into()),
                Token::kw("FROM"),
                Token::Ident { name: "todo".into(), quoted: false },
                Token::kw("WHERE"),
                Token::Ident { name: "id".into(), quoted: false },
                Token::Punct("="),
                Token::Param(1),
            ]
        );
    }

    #[test]
    fn numbers_parameters_like_sqlite() {
        let tokens = tokenize("? ?5 ? :a @b :a $c").unwrap();
        let params: Vec<usize> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Param(i) => Some(*i),
                _ => None,
            })
            .collect();
        assert_eq!(params, vec![1, 5, 6, 7, 8, 7, 9]);
    }

    #[test]
    fn skips_comments() {
        let tokens = tokenize("SELECT 1 -- trailing\n /* block */ + 2.5e3").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::kw("SELECT"),
                Token::Number("1".into()),
                Token::Punct("+"),
                Token::Number("2.5e3".into()),
            ]
        );
    }

    #[test]
    fn renders_round_trip() {
        let sql = "SELECT json_extract(snapshot_content, '$.a') AS a FROM t WHERE x->>'$.b' <> X'00ff' AND y = ?2";
        let rendered = render(&tokenize(sql).unwrap());
        assert_eq!(
            rendered,
            "SELECT json_extract(snapshot_content, '$.a') AS a FROM t WHERE x ->> '$.b' <> X'00ff' AND y = ?2"
        );
    }

    #[test]
    fn tells_hex_numbers_from_blobs() {
        let tokens = tokenize("SELECT 0x1F, X'00ff'").unwrap();
        assert_eq!(tokens[1], Token::Number("0x1F".into()));
        assert_eq!(tokens[3], Token::Blob("00ff".into()));
    }

    #[test]
    fn quotes_identifiers_that_need_it() {
        assert_eq!(Token::ident("order").to_string(), "\"order\"");
        assert_eq!(Token::ident("my col").to_string(), "\"my col\"");
        assert_eq!(Token::ident("title").to_string(), "title");
    }

    #[test]
    fn splits_scripts() {
        let script = "CREATE TABLE a (x); INSERT INTO a VALUES (';');
            CREATE TRIGGER t AFTER INSERT ON a BEGIN SELECT 1; SELECT 2; END;
            SELECT * FROM a";
        let statements = split_statements(script).unwrap();
        assert_eq!(statements.len(), 4);
        assert_eq!(statements[1], "INSERT INTO a VALUES (';')");
        assert!(statements[2].ends_with("END"));
    }

    #[test]
    fn reports_unterminated_strings() {
        let err = tokenize("SELECT 'oops").unwrap_err();
        assert!(matches!(err, EngineError::Syntax { .. }));
    }
}
