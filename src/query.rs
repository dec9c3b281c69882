//! Query-language contracts consumed by the store
//!
//! The store does not parse queries. Callers hand it already-built sources,
//! conditions and statements; this module defines their shape and the few
//! walks the store needs over them.

use std::fmt;

use regex::Regex;

use crate::error::Result;

/// A reference to a measurement, by name or by pattern
#[derive(Debug, Clone)]
pub struct MeasurementRef {
    pub database: String,
    pub retention_policy: String,
    pub name: String,
    pub regex: Option<Regex>,
}

impl MeasurementRef {
    /// Reference a measurement by name
    pub fn new(
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            name: name.into(),
            regex: None,
        }
    }

    /// Reference every measurement whose name matches `pattern`
    pub fn regex(
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        pattern: &str,
    ) -> Result<Self> {
        Ok(Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
            name: String::new(),
            regex: Some(Regex::new(pattern)?),
        })
    }

    /// Same database and retention policy, different literal name
    pub(crate) fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            database: self.database.clone(),
            retention_policy: self.retention_policy.clone(),
            name: name.into(),
            regex: None,
        }
    }
}

impl PartialEq for MeasurementRef {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl fmt::Display for MeasurementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.database.is_empty() {
            write!(f, "{}.", quote_ident(&self.database))?;
        }
        if !self.retention_policy.is_empty() {
            f.write_str(&quote_ident(&self.retention_policy))?;
        }
        if !self.database.is_empty() || !self.retention_policy.is_empty() {
            f.write_str(".")?;
        }
        match &self.regex {
            Some(re) => write!(f, "/{}/", re.as_str().replace('/', "\\/")),
            None => f.write_str(&quote_ident(&self.name)),
        }
    }
}

/// A FROM-clause source
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A measurement, named or matched by regex
    Measurement(MeasurementRef),
    /// A nested query, carried as its text; the store cannot expand these
    Subquery(String),
}

impl Source {
    /// Shorthand for a literal measurement source
    pub fn measurement(
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::Measurement(MeasurementRef::new(database, retention_policy, name))
    }

    /// Shorthand for a regex measurement source
    pub fn measurement_regex(
        database: impl Into<String>,
        retention_policy: impl Into<String>,
        pattern: &str,
    ) -> Result<Self> {
        Ok(Self::Measurement(MeasurementRef::regex(database, retention_policy, pattern)?))
    }

    /// The literal measurement name, if this is a literal measurement
    pub fn measurement_name(&self) -> Option<&str> {
        match self {
            Self::Measurement(m) if m.regex.is_none() => Some(&m.name),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measurement(m) => m.fmt(f),
            Self::Subquery(text) => write!(f, "({})", text),
        }
    }
}

/// Binary operators in a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Neq,
    EqRegex,
    NeqRegex,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl BinaryOp {
    /// Whether this operator compares two operands (as opposed to joining
    /// two conditions)
    pub fn is_comparison(&self) -> bool {
        !matches!(self, Self::And | Self::Or)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::EqRegex => "=~",
            Self::NeqRegex => "!~",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        };
        f.write_str(s)
    }
}

/// A boolean condition over tags, fields and time
#[derive(Debug, Clone)]
pub enum Expr {
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
    VarRef(String),
    String(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Regex(Regex),
    Time(chrono::DateTime<chrono::Utc>),
}

impl Expr {
    /// Build a binary expression
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// `key = 'value'`
    pub fn tag_eq(key: &str, value: &str) -> Self {
        Self::binary(BinaryOp::Eq, Self::VarRef(key.to_string()), Self::String(value.to_string()))
    }

    /// `key != 'value'`
    pub fn tag_neq(key: &str, value: &str) -> Self {
        Self::binary(BinaryOp::Neq, Self::VarRef(key.to_string()), Self::String(value.to_string()))
    }

    /// `key =~ /pattern/`
    pub fn tag_regex(key: &str, pattern: &str) -> Result<Self> {
        Ok(Self::binary(BinaryOp::EqRegex, Self::VarRef(key.to_string()), Self::Regex(Regex::new(pattern)?)))
    }

    /// `lhs AND rhs`
    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::And, lhs, rhs)
    }

    /// `lhs OR rhs`
    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Or, lhs, rhs)
    }

    /// Whether this is the literal `true`
    pub fn is_true_literal(&self) -> bool {
        matches!(self, Self::Boolean(true))
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            Self::Paren(inner) => write!(f, "({})", inner),
            Self::VarRef(name) => f.write_str(&quote_ident(name)),
            Self::String(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Self::Number(n) => write!(f, "{}", n),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Regex(re) => write!(f, "/{}/", re.as_str().replace('/', "\\/")),
            Self::Time(t) => write!(f, "'{}'", t.to_rfc3339()),
        }
    }
}

/// Whether the condition constrains `time` anywhere
pub fn has_time_expr(expr: Option<&Expr>) -> bool {
    match expr {
        None => false,
        Some(Expr::Binary { op, lhs, rhs }) => {
            if op.is_comparison() {
                is_time_ref(lhs) || is_time_ref(rhs)
            } else {
                has_time_expr(Some(lhs.as_ref())) || has_time_expr(Some(rhs.as_ref()))
            }
        }
        Some(Expr::Paren(inner)) => has_time_expr(Some(inner.as_ref())),
        Some(_) => false,
    }
}

fn is_time_ref(expr: &Expr) -> bool {
    matches!(expr, Expr::VarRef(name) if name.eq_ignore_ascii_case("time"))
        || matches!(expr, Expr::Time(_))
}

/// Quote an identifier unless it is a bare word
pub fn quote_ident(ident: &str) -> String {
    let mut chars = ident.chars();
    let bare = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if bare {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// `SHOW FIELD KEYS [FROM sources]`
#[derive(Debug, Clone, Default)]
pub struct ShowFieldKeysStatement {
    pub sources: Vec<Source>,
}

/// `SHOW TAG VALUES [FROM sources] WITH KEY IN (keys) [WHERE condition]`
#[derive(Debug, Clone, Default)]
pub struct ShowTagValuesStatement {
    pub sources: Vec<Source>,
    pub tag_keys: Vec<String>,
    pub condition: Option<Expr>,
}

/// `SHOW SERIES [FROM sources] [WHERE condition] [LIMIT n] [OFFSET m]`
///
/// A limit of zero means no limit.
#[derive(Debug, Clone, Default)]
pub struct ShowSeriesStatement {
    pub sources: Vec<Source>,
    pub condition: Option<Expr>,
    pub limit: usize,
    pub offset: usize,
}
