//! Line-level G-code tokenizer used by the toolpath decoder and the simulator.

#[derive(Debug, Clone, PartialEq)]
pub struct GcodeWord {
    pub letter: char,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GcodeLine<'a> {
    pub words: Vec<GcodeWord>,
    /// Text after the first `;`, trimmed.
    pub comment: Option<&'a str>,
}

impl<'a> GcodeLine<'a> {
    pub fn word(&self, letter: char) -> Option<f64> {
        self.words.iter().find(|w| w.letter == letter).map(|w| w.value)
    }

    /// The leading G/M command, e.g. `('G', 1)`.
    pub fn command(&self) -> Option<(char, u32)> {
        self.words
            .first()
            .filter(|w| w.letter == 'G' || w.letter == 'M')
            .map(|w| (w.letter, w.value as u32))
    }

    pub fn is_move(&self) -> bool {
        matches!(self.command(), Some(('G', 0)) | Some(('G', 1)))
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.comment.is_none()
    }
}

/// Tokenize one line. Malformed words are skipped rather than failing the whole line,
/// the way most firmware treats them.
pub fn parse_line(line: &str) -> GcodeLine<'_> {
    let (code, comment) = match line.find(';') {
        Some(idx) => (&line[..idx], Some(line[idx + 1..].trim())),
        None => (line, None),
    };
    let mut words = Vec::new();
    for token in code.split_whitespace() {
        let mut chars = token.chars();
        let Some(letter) = chars.next() else { continue };
        if !letter.is_ascii_alphabetic() {
            continue;
        }
        if let Ok(value) = chars.as_str().parse::<f64>() {
            words.push(GcodeWord {
                letter: letter.to_ascii_uppercase(),
                value,
            });
        }
    }
    GcodeLine { words, comment }
}

/// Parse a `key = value` or `key: value` header comment.
pub fn parse_metadata_comment(comment: &str) -> Option<(&str, &str)> {
    let idx = comment.find(|c| c == '=' || c == ':')?;
    let key = comment[..idx].trim();
    let value = comment[idx + 1..].trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value))
}
