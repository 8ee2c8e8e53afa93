//! Routing engine.
//!
//! Decides whether a binding key matches a message's routing key for a given
//! exchange type. Stateless; every function here is pure.

use std::fmt;
use std::str::FromStr;

/// How an exchange forwards published messages to its bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExchangeType {
    /// Exact routing-key / binding-key equality.
    #[default]
    Direct,
    /// Every bound queue receives every message.
    Fanout,
    /// Dot-separated pattern match with `*` and `#` wildcards.
    Topic,
}

impl ExchangeType {
    /// Stable integer code used by the row store and the wire protocol.
    pub fn code(self) -> i32 {
        match self {
            ExchangeType::Direct => 1,
            ExchangeType::Fanout => 2,
            ExchangeType::Topic => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ExchangeType::Direct),
            2 => Some(ExchangeType::Fanout),
            3 => Some(ExchangeType::Topic),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Fanout => f.write_str("fanout"),
            ExchangeType::Topic => f.write_str("topic"),
        }
    }
}

impl FromStr for ExchangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            other => Err(format!("unknown exchange type: {other}")),
        }
    }
}

/// Returns `true` when `binding_key` selects `routing_key` under `kind`.
pub fn route(kind: ExchangeType, routing_key: &str, binding_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => routing_key == binding_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => topic_match(routing_key, binding_key),
    }
}

/// Splits on `.` dropping empty segments.
fn words(key: &str) -> Vec<&str> {
    key.split('.').filter(|w| !w.is_empty()).collect()
}

// dp[i][j]: the first i binding words match the first j routing words.
fn topic_match(routing_key: &str, binding_key: &str) -> bool {
    let bwords = words(binding_key);
    let rwords = words(routing_key);
    let (n, m) = (bwords.len(), rwords.len());

    let mut dp = vec![vec![false; m + 1]; n + 1];
    dp[0][0] = true;

    for i in 1..=n {
        if bwords[i - 1] != "#" {
            break;
        }
        dp[i][0] = true;
    }

    for i in 1..=n {
        let bword = bwords[i - 1];
        for j in 1..=m {
            if bword == "#" {
                dp[i][j] = dp[i - 1][j - 1] || dp[i][j - 1] || dp[i - 1][j];
            } else if bword == "*" || bword == rwords[j - 1] {
                dp[i][j] = dp[i - 1][j - 1];
            }
        }
    }

    dp[n][m]
}

/// A routing key may only contain ASCII alphanumerics, `_` and `.`, must not
/// start with `.`, and must not contain `..`.
pub fn is_valid_routing_key(routing_key: &str) -> bool {
    let mut prev: Option<char> = None;
    for ch in routing_key.chars() {
        let ok = match ch {
            c if c.is_ascii_alphanumeric() || c == '_' => true,
            '.' => matches!(prev, Some(p) if p != '.'),
            _ => false,
        };
        if !ok {
            return false;
        }
        prev = Some(ch);
    }
    true
}

/// A binding key may contain the routing-key alphabet plus `*` and `#`.
/// Wildcards must fill a whole word, and `#` may not follow `#` or `*`,
/// nor may `*` follow `#`.
pub fn is_valid_binding_key(binding_key: &str) -> bool {
    let legal = binding_key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '*' | '#'));
    if !legal {
        return false;
    }

    let parts = words(binding_key);
    if parts
        .iter()
        .any(|w| w.len() > 1 && (w.contains('*') || w.contains('#')))
    {
        return false;
    }

    parts.windows(2).all(|pair| {
        !matches!(
            (pair[0], pair[1]),
            ("*", "#") | ("#", "#") | ("#", "*")
        )
    })
}
