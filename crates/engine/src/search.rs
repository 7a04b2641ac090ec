//! Full-text search over the term index.
//!
//! Tokenization is deliberately minimal: lowercase, split on
//! non-alphanumerics. The simple form ANDs all tokens; the advanced form
//! adds `field:value`, `AND`/`OR`/`NOT`, and parenthesized grouping.
//! Relevance is the sum over matched fields of `field_weight × tf`.

use crate::{EngineError, EngineResult};
use emdb_index::{IndexStore, Posting};
use emdb_types::EmailId;
use std::collections::HashMap;

/// Field bit for subject matches.
pub const FIELD_SUBJECT: u8 = 1 << 0;
/// Field bit for sender matches.
pub const FIELD_FROM: u8 = 1 << 1;
/// Field bit for recipient matches.
pub const FIELD_TO: u8 = 1 << 2;
/// Field bit for body matches.
pub const FIELD_BODY: u8 = 1 << 3;

/// Scoring weight of one field.
pub const fn field_weight(field: u8) -> f64 {
    match field {
        FIELD_SUBJECT => 3.0,
        FIELD_FROM | FIELD_TO => 2.0,
        _ => 1.0,
    }
}

/// Names for a field bitmask, for `SearchResult::matched_fields`.
pub fn field_names(mask: u8) -> Vec<String> {
    let mut names = Vec::new();
    for (bit, name) in [
        (FIELD_SUBJECT, "subject"),
        (FIELD_FROM, "from"),
        (FIELD_TO, "to"),
        (FIELD_BODY, "body"),
    ] {
        if mask & bit != 0 {
            names.push(name.to_owned());
        }
    }
    names
}

fn field_by_name(name: &str) -> Option<u8> {
    match name {
        "subject" => Some(FIELD_SUBJECT),
        "from" => Some(FIELD_FROM),
        "to" => Some(FIELD_TO),
        "body" => Some(FIELD_BODY),
        _ => None,
    }
}

/// Lowercase + split on non-alphanumerics.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Per-field term frequencies of one email, accumulated at import.
pub fn field_postings(email_id: EmailId, field: u8, text: &str) -> Vec<(String, Posting)> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(token, tf)| {
            (token, Posting { email_id, fields: field, term_frequency: tf })
        })
        .collect()
}

/// A parsed search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// A term matched in any field.
    Term(String),
    /// A term restricted to one field.
    Field(u8, String),
    /// Both sides must match.
    And(Box<Query>, Box<Query>),
    /// Either side may match.
    Or(Box<Query>, Box<Query>),
    /// The operand must not match.
    Not(Box<Query>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Word(String),
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for raw in input.replace('(', " ( ").replace(')', " ) ").split_whitespace() {
        tokens.push(match raw {
            "(" => Token::LParen,
            ")" => Token::RParen,
            _ if raw.eq_ignore_ascii_case("AND") => Token::And,
            _ if raw.eq_ignore_ascii_case("OR") => Token::Or,
            _ if raw.eq_ignore_ascii_case("NOT") => Token::Not,
            word => Token::Word(word.to_owned()),
        });
    }
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.at).cloned();
        self.at += 1;
        token
    }

    fn parse_expr(&mut self) -> EngineResult<Query> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let right = self.parse_and()?;
            left = Query::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Query> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.bump();
                    let right = self.parse_unary()?;
                    left = Query::And(Box::new(left), Box::new(right));
                }
                // Adjacent terms are an implicit AND.
                Some(Token::Word(_)) | Some(Token::Not) | Some(Token::LParen) => {
                    let right = self.parse_unary()?;
                    left = Query::And(Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_unary(&mut self) -> EngineResult<Query> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                Ok(Query::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> EngineResult<Query> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EngineError::InvalidArgument("unbalanced parentheses".into())),
                }
            }
            Some(Token::Word(word)) => Ok(parse_word(&word)),
            other => Err(EngineError::InvalidArgument(format!(
                "expected a term, got {other:?}"
            ))),
        }
    }
}

fn parse_word(word: &str) -> Query {
    if let Some((field, value)) = word.split_once(':') {
        if let Some(bit) = field_by_name(&field.to_lowercase()) {
            return and_all(
                tokenize(value).into_iter().map(|t| Query::Field(bit, t)),
            )
            .unwrap_or(Query::Field(bit, String::new()));
        }
    }
    and_all(tokenize(word).into_iter().map(Query::Term)).unwrap_or(Query::Term(String::new()))
}

fn and_all(mut queries: impl Iterator<Item = Query>) -> Option<Query> {
    let first = queries.next()?;
    Some(queries.fold(first, |acc, q| Query::And(Box::new(acc), Box::new(q))))
}

/// Parses the advanced query grammar. The simple form (whitespace-
/// separated terms) parses to an AND chain through the same grammar.
pub fn parse_query(input: &str) -> EngineResult<Query> {
    let tokens = lex(input);
    if tokens.is_empty() {
        return Err(EngineError::InvalidArgument("empty query".into()));
    }
    let mut parser = Parser { tokens, at: 0 };
    let query = parser.parse_expr()?;
    if parser.peek().is_some() {
        return Err(EngineError::InvalidArgument("trailing tokens in query".into()));
    }
    Ok(query)
}

/// One scored match.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    /// The matching email.
    pub email_id: EmailId,
    /// Field-weighted relevance.
    pub score: f64,
    /// Which fields matched.
    pub fields: u8,
}

/// Evaluates a query against the term index. `universe` supplies all
/// live email ids and is consulted only for `NOT`.
pub fn rank(
    index: &IndexStore,
    term_index: &str,
    query: &Query,
    universe: &dyn Fn() -> EngineResult<Vec<EmailId>>,
) -> EngineResult<Vec<RankedHit>> {
    let hits = eval(index, term_index, query, universe)?;
    let mut ranked: Vec<RankedHit> = hits
        .into_iter()
        .map(|(email_id, (score, fields))| RankedHit { email_id, score, fields })
        .collect();
    ranked.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.email_id.cmp(&b.email_id))
    });
    Ok(ranked)
}

type HitMap = HashMap<EmailId, (f64, u8)>;

fn eval(
    index: &IndexStore,
    term_index: &str,
    query: &Query,
    universe: &dyn Fn() -> EngineResult<Vec<EmailId>>,
) -> EngineResult<HitMap> {
    match query {
        Query::Term(term) => postings_hits(index, term_index, term, u8::MAX),
        Query::Field(field, term) => postings_hits(index, term_index, term, *field),
        Query::And(left, right) => {
            let l = eval(index, term_index, left, universe)?;
            let r = eval(index, term_index, right, universe)?;
            Ok(l.into_iter()
                .filter_map(|(id, (score, fields))| {
                    r.get(&id).map(|(s2, f2)| (id, (score + s2, fields | f2)))
                })
                .collect())
        }
        Query::Or(left, right) => {
            let mut l = eval(index, term_index, left, universe)?;
            for (id, (score, fields)) in eval(index, term_index, right, universe)? {
                let entry = l.entry(id).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 |= fields;
            }
            Ok(l)
        }
        Query::Not(inner) => {
            let excluded = eval(index, term_index, inner, universe)?;
            Ok(universe()?
                .into_iter()
                .filter(|id| !excluded.contains_key(id))
                .map(|id| (id, (0.0, 0)))
                .collect())
        }
    }
}

fn postings_hits(
    index: &IndexStore,
    term_index: &str,
    term: &str,
    field_mask: u8,
) -> EngineResult<HitMap> {
    if term.is_empty() {
        return Ok(HitMap::new());
    }
    let mut hits = HitMap::new();
    let postings = index.get_postings(term_index, term.as_bytes())?.unwrap_or_default();
    for posting in postings {
        let matched = posting.fields & field_mask;
        if matched == 0 {
            continue;
        }
        let entry = hits.entry(posting.email_id).or_insert((0.0, 0));
        for bit in [FIELD_SUBJECT, FIELD_FROM, FIELD_TO, FIELD_BODY] {
            if matched & bit != 0 {
                entry.0 += field_weight(bit) * f64::from(posting.term_frequency);
            }
        }
        entry.1 |= matched;
    }
    Ok(hits)
}
