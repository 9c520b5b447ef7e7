use super::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    /// DDL, pragmas and transaction control. Executed untouched.
    Other,
}

impl StatementKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: StatementKind,
    /// Index of the token that decided the kind.
    pub verb: usize,
    pub has_with: bool,
}

fn kind_of(token: &Token) -> Option<StatementKind> {
    match token {
        Token::Keyword(k) => match k.as_str() {
            "SELECT" | "VALUES" => Some(StatementKind::Select),
            "INSERT" | "REPLACE" => Some(StatementKind::Insert),
            "UPDATE" => Some(StatementKind::Update),
            "DELETE" => Some(StatementKind::Delete),
            _ => None,
        },
        _ => None,
    }
}

/// Classify a statement by its leading verb, looking past a `WITH` clause.
pub fn classify(tokens: &[Token]) -> Classification {
    let other = Classification {
        kind: StatementKind::Other,
        verb: 0,
        has_with: false,
    };
    let Some(first) = tokens.first() else {
        return other;
    };
    if !first.is_keyword("WITH") {
        return match kind_of(first) {
            Some(kind) => Classification {
                kind,
                verb: 0,
                has_with: false,
            },
            None => other,
        };
    }

    let mut depth = 0usize;
    for (index, token) in tokens.iter().enumerate().skip(1) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0
            && let Some(kind) = kind_of(token)
        {
            return Classification {
                kind,
                verb: index,
                has_with: true,
            };
        }
    }
    Classification {
        has_with: true,
        ..other
    }
}
