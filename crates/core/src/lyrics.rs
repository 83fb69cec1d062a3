//! Lyrics come back from analysis as one run-on string. Lines are recovered
//! by breaking before every capital letter.

/// Split lyrics into display lines.
///
/// A new line starts before each uppercase letter and at every explicit
/// newline. Lines are trimmed and blank lines dropped.
pub fn lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for chunk in text.lines() {
        let mut current = String::new();
        for c in chunk.chars() {
            if c.is_uppercase() && !current.trim().is_empty() {
                lines.push(current.trim().to_string());
                current.clear();
            }
            current.push(c);
        }
        if !current.trim().is_empty() {
            lines.push(current.trim().to_string());
        }
    }
    lines
}
