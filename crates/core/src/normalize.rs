//! Post-processing applied to every finished assistant reply.

use std::sync::OnceLock;

use regex::Regex;

fn think_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?</think>").expect("static regex"))
}

/// Strip `<think>` blocks, separate run-together words and numbers, trim.
///
/// Pure and idempotent: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let mut text = raw.to_string();
    // Removing one block can close up the halves of an enclosing one.
    while think_block().is_match(&text) {
        text = think_block().replace_all(&text, "").into_owned();
    }

    let spaced = separate_boundaries(&text);
    spaced.trim().to_string()
}

fn is_digit(c: char) -> bool {
    c.is_numeric()
}

fn is_letter(c: char) -> bool {
    c.is_alphabetic() && !c.is_numeric()
}

fn needs_space(prev: char, next: char) -> bool {
    (prev.is_lowercase() && next.is_uppercase())
        || (is_digit(prev) && is_letter(next))
        || (is_letter(prev) && is_digit(next))
}

fn separate_boundaries(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if let Some(p) = prev {
            if needs_space(p, c) {
                out.push(' ');
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out
}
