//! Cursor-level text helpers for kernel templates.
//!
//! Templates reference kernel arguments through the `args.` marker:
//!
//! ```text
//! args.name                      bare argument   -> resolved to a parameter or pool slot
//! args.name.Selector(a, b)       selector call   -> expanded by the object's descriptor
//! args.name.Selector<T>(a, b)    templated call
//! ```
//!
//! Everything here is a pure function over `&str` that builds a fresh output
//! buffer; nothing rewrites its input in place.

use crate::error::{CompileError, CompileResult};

/// Marker that introduces every argument reference in a template.
pub const ARGS_PREFIX: &str = "args.";

#[inline]
pub(crate) fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// The identifier starting at byte `start` (possibly empty).
pub(crate) fn read_word(code: &str, start: usize) -> &str {
    let bytes = code.as_bytes();
    let mut end = start;
    while end < bytes.len() && is_word_char(bytes[end]) {
        end += 1;
    }
    &code[start..end]
}

fn closing_bracket(open: u8) -> Option<u8> {
    match open {
        b'(' => Some(b')'),
        b'{' => Some(b'}'),
        b'[' => Some(b']'),
        b'<' => Some(b'>'),
        _ => None,
    }
}

/// Position of the bracket that closes the one at `open_pos`.
///
/// Only brackets of the same kind are counted.
pub(crate) fn find_enclosing_bracket(code: &str, open_pos: usize) -> CompileResult<usize> {
    let bytes = code.as_bytes();
    let open = bytes.get(open_pos).copied().unwrap_or(0);
    let close = closing_bracket(open).ok_or_else(|| CompileError::MalformedSelector {
        position: open_pos,
        reason: format!("expected an opening bracket, found '{}'", open as char),
    })?;
    let mut depth = 0usize;
    for (pos, &b) in bytes.iter().enumerate().skip(open_pos) {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Ok(pos);
            }
        }
    }
    Err(CompileError::UnbalancedBracket {
        bracket: open as char,
        position: open_pos,
    })
}

/// Split a comma-separated argument list at top-level commas and trim each
/// piece. Commas nested in `()`, `[]` or `{}` do not split.
pub(crate) fn split_args(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (pos, b) in text.bytes().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b',' if depth == 0 => {
                args.push(text[start..pos].trim().to_string());
                start = pos + 1;
            }
            _ => {}
        }
    }
    args.push(text[start..].trim().to_string());
    args
}

/// Replace every whole-word occurrence of `old` with `new`.
pub fn replace_all_words(text: &str, old: &str, new: &str) -> String {
    if old.is_empty() {
        return text.to_string();
    }
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(found) = text[pos..].find(old).map(|p| p + pos) {
        let end = found + old.len();
        let left_ok = found == 0 || !is_word_char(bytes[found - 1]);
        let right_ok = end == bytes.len() || !is_word_char(bytes[end]);
        out.push_str(&text[pos..found]);
        out.push_str(if left_ok && right_ok { new } else { old });
        pos = end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Append `postfix` to the object name of every `args.` reference.
pub fn rename_args(code: &str, postfix: &str) -> String {
    let mut out = String::with_capacity(code.len() + postfix.len() * 4);
    let mut pos = 0;
    while let Some(found) = code[pos..].find(ARGS_PREFIX).map(|p| p + pos) {
        let name_start = found + ARGS_PREFIX.len();
        let name = read_word(code, name_start);
        out.push_str(&code[pos..name_start]);
        out.push_str(name);
        if !name.is_empty() {
            out.push_str(postfix);
        }
        pos = name_start + name.len();
    }
    out.push_str(&code[pos..]);
    out
}

/// Whether the `args.` marker at `pos` starts a token (is not the tail of a
/// longer identifier such as `myargs.x`).
pub(crate) fn starts_token(code: &str, pos: usize) -> bool {
    pos == 0 || !is_word_char(code.as_bytes()[pos - 1])
}

/// One `args.` reference parsed from a template.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Marker {
    /// `args.name`
    Bare { name: String, end: usize },
    /// `args.object.selector<template_args>(args)`
    Call(SelectorCall),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectorCall {
    pub object: String,
    pub selector: String,
    pub template_args: Vec<String>,
    pub args: Vec<String>,
    /// Byte just past the closing parenthesis.
    pub end: usize,
}

/// Parse the reference whose `args.` marker starts at `marker_pos`.
pub(crate) fn parse_marker(code: &str, marker_pos: usize) -> CompileResult<Marker> {
    let bytes = code.as_bytes();
    let name_start = marker_pos + ARGS_PREFIX.len();
    let name = read_word(code, name_start);
    if name.is_empty() {
        return Err(CompileError::MalformedSelector {
            position: marker_pos,
            reason: "expected an identifier after 'args.'".into(),
        });
    }
    let mut pos = name_start + name.len();
    if bytes.get(pos) != Some(&b'.') {
        return Ok(Marker::Bare {
            name: name.to_string(),
            end: pos,
        });
    }

    pos += 1;
    let selector = read_word(code, pos);
    if selector.is_empty() {
        return Err(CompileError::MalformedSelector {
            position: pos,
            reason: format!("expected a selector name after 'args.{name}.'"),
        });
    }
    pos += selector.len();

    let mut template_args = Vec::new();
    if bytes.get(pos) == Some(&b'<') {
        let close = find_enclosing_bracket(code, pos)?;
        template_args = split_args(&code[pos + 1..close]);
        pos = close + 1;
    }

    if bytes.get(pos) != Some(&b'(') {
        return Err(CompileError::MalformedSelector {
            position: pos,
            reason: format!("expected '(' after selector '{selector}'"),
        });
    }
    let close = find_enclosing_bracket(code, pos)?;
    Ok(Marker::Call(SelectorCall {
        object: name.to_string(),
        selector: selector.to_string(),
        template_args,
        args: split_args(&code[pos + 1..close]),
        end: close + 1,
    }))
}
