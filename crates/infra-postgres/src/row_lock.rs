// Row Lock Primitive - annotate a ledger SELECT with a Postgres row lock

use fleetbatch_core::domain::LockMode;
use fleetbatch_core::error::{AppError, Result};

fn locking_clause(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Wait => "FOR UPDATE",
        LockMode::SkipLocked => "FOR UPDATE SKIP LOCKED",
    }
}

/// Return `sql` with a write-intent row lock appended.
///
/// `Wait` blocks on rows another transaction holds; `SkipLocked` leaves them
/// out. Only single SELECT (or WITH ... SELECT) statements are accepted, and
/// a statement that already carries a locking clause is rejected rather than
/// locked twice. A trailing semicolon is kept.
pub fn apply_row_lock(sql: &str, mode: LockMode) -> Result<String> {
    let trimmed = sql.trim();
    let (body, terminator) = match trimmed.strip_suffix(';') {
        Some(body) => (body.trim_end(), ";"),
        None => (trimmed, ""),
    };

    if body.is_empty() {
        return Err(AppError::Validation("Cannot lock an empty query".to_string()));
    }
    let code = code_only(body);
    if code.contains(';') {
        return Err(AppError::Validation(
            "Row lock applies to a single statement".to_string(),
        ));
    }

    let words = keywords(&code);
    let first_word = words.first().map(String::as_str).unwrap_or_default();
    if first_word != "SELECT" && first_word != "WITH" {
        return Err(AppError::Validation(format!(
            "Row lock applies to SELECT queries only, got '{}'",
            first_word
        )));
    }
    if has_locking_clause(&words) {
        return Err(AppError::Validation(
            "Query already carries a row locking clause".to_string(),
        ));
    }

    Ok(format!("{} {}{}", body, locking_clause(mode), terminator))
}

/// `sql` with string literals, quoted identifiers and comments blanked out
fn code_only(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(' ');
                while let Some(inner) = chars.next() {
                    if inner == c {
                        // Doubled quote is an escaped quote
                        if chars.peek() == Some(&c) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(' ');
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(' ');
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Upper-cased identifier-like tokens, in order
fn keywords(code: &str) -> Vec<String> {
    code.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}

/// FOR UPDATE, FOR NO KEY UPDATE, FOR SHARE or FOR KEY SHARE anywhere in the statement
fn has_locking_clause(words: &[String]) -> bool {
    let is = |i: usize, word: &str| words.get(i).map(String::as_str) == Some(word);
    (0..words.len()).any(|i| {
        is(i, "FOR")
            && (is(i + 1, "UPDATE")
                || is(i + 1, "SHARE")
                || (is(i + 1, "NO") && is(i + 2, "KEY") && is(i + 3, "UPDATE"))
                || (is(i + 1, "KEY") && is(i + 2, "SHARE")))
    })
}
