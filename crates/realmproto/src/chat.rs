//! Client chat shorthands.
//!
//! Connections accept the usual MUD-style shorthands and rewrite them
//! into the worker's internal chat commands before queueing:
//!
//! - `"hello` / `say hello`  => `$say hello`
//! - `:grins` / `pose grins` => `$pose grins`
//! - `..ada psst`            => `$dpage ada psst`
//!
//! Anything else is passed through untouched.

use std::borrow::Cow;

/// Rewrite one cleaned client line.
pub fn rewrite_shorthand(line: &str) -> Cow<'_, str> {
    if let Some(msg) = line.strip_prefix('"') {
        let msg = msg.trim_start();
        if !msg.is_empty() {
            return Cow::Owned(format!("$say {msg}"));
        }
        return Cow::Borrowed(line);
    }

    if let Some(rest) = line.strip_prefix("..") {
        let rest = rest.trim_start();
        if let Some((name, msg)) = rest.split_once(char::is_whitespace) {
            let msg = msg.trim();
            if !name.is_empty() && !msg.is_empty() {
                return Cow::Owned(format!("$dpage {name} {msg}"));
            }
        }
        return Cow::Borrowed(line);
    }

    if let Some(act) = line.strip_prefix(':') {
        let act = act.trim_start();
        if !act.is_empty() {
            return Cow::Owned(format!("$pose {act}"));
        }
        return Cow::Borrowed(line);
    }

    if let Some(msg) = keyword_arg(line, "say") {
        return Cow::Owned(format!("$say {msg}"));
    }
    if let Some(act) = keyword_arg(line, "pose") {
        return Cow::Owned(format!("$pose {act}"));
    }

    Cow::Borrowed(line)
}

/// `keyword_arg("say  hi", "say")` => `Some("hi")`; the keyword must
/// be a whole word.
fn keyword_arg<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    Some(rest)
}
