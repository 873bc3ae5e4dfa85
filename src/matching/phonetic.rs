// src/matching/phonetic.rs
//! Phonetic encoders for PHONETIC comparisons.

/// American Soundex: first letter plus three digits (e.g. "Robert" -> "R163").
/// Returns an empty string when the input has no ASCII letters.
pub fn soundex(s: &str) -> String {
    let chars: Vec<char> = s.chars().filter(char::is_ascii_alphabetic).collect();
    if chars.is_empty() {
        return String::new();
    }

    let digit = |c: char| -> Option<char> {
        match c.to_ascii_lowercase() {
            'b' | 'f' | 'p' | 'v' => Some('1'),
            'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
            'd' | 't' => Some('3'),
            'l' => Some('4'),
            'm' | 'n' => Some('5'),
            'r' => Some('6'),
            _ => None, // vowels, h, w, y
        }
    };

    let mut code = String::with_capacity(4);
    code.push(chars[0].to_ascii_uppercase());
    let mut last_digit = digit(chars[0]);

    for &ch in &chars[1..] {
        if code.len() >= 4 {
            break;
        }
        let d = digit(ch);
        if let Some(value) = d {
            if d != last_digit {
                code.push(value);
            }
        }
        // h and w do not separate letters with the same code
        if !matches!(ch.to_ascii_lowercase(), 'h' | 'w') {
            last_digit = d;
        }
    }

    while code.len() < 4 {
        code.push('0');
    }
    code
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'A' | 'E' | 'I' | 'O' | 'U')
}

/// Original (single) Metaphone encoding. Returns an empty string when the
/// input has no ASCII letters.
pub fn metaphone(s: &str) -> String {
    let mut word: Vec<char> = s
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if word.is_empty() {
        return String::new();
    }

    // Initial-letter exceptions
    match (word.first().copied(), word.get(1).copied()) {
        (Some('A'), Some('E')) | (Some('G'), Some('N')) | (Some('K'), Some('N')) | (Some('P'), Some('N')) | (Some('W'), Some('R')) => {
            word.remove(0);
        }
        (Some('X'), _) => word[0] = 'S',
        (Some('W'), Some('H')) => {
            word.remove(1);
        }
        _ => {}
    }

    let len = word.len();
    let at = |i: usize| -> Option<char> { word.get(i).copied() };
    let mut code = String::new();

    for i in 0..len {
        let c = word[i];
        let prev = if i > 0 { at(i - 1) } else { None };
        let next = at(i + 1);
        let next2 = at(i + 2);

        // Skip doubled letters except C
        if prev == Some(c) && c != 'C' {
            continue;
        }

        match c {
            'A' | 'E' | 'I' | 'O' | 'U' => {
                if i == 0 {
                    code.push(c);
                }
            }
            'B' => {
                if !(prev == Some('M') && i == len - 1) {
                    code.push('B');
                }
            }
            'C' => {
                if next == Some('I') && next2 == Some('A') {
                    code.push('X');
                } else if next == Some('H') {
                    if prev == Some('S') {
                        code.push('K');
                    } else {
                        code.push('X');
                    }
                } else if matches!(next, Some('I') | Some('E') | Some('Y')) {
                    if prev != Some('S') {
                        code.push('S');
                    }
                } else {
                    code.push('K');
                }
            }
            'D' => {
                if next == Some('G') && matches!(next2, Some('E') | Some('I') | Some('Y')) {
                    code.push('J');
                } else {
                    code.push('T');
                }
            }
            'G' => {
                let silent_gh = next == Some('H') && !next2.map(is_vowel).unwrap_or(false) && i + 2 < len;
                let silent_gn = next == Some('N') && (i + 2 == len || (next2 == Some('E') && at(i + 3) == Some('D') && i + 4 == len));
                if silent_gh || silent_gn || (prev == Some('D') && matches!(next, Some('E') | Some('I') | Some('Y'))) {
                    continue;
                }
                if matches!(next, Some('I') | Some('E') | Some('Y')) {
                    code.push('J');
                } else {
                    code.push('K');
                }
            }
            'H' => {
                let after_modifier = matches!(prev, Some('C') | Some('S') | Some('P') | Some('T') | Some('G'));
                let between_vowel = prev.map(is_vowel).unwrap_or(false) && !next.map(is_vowel).unwrap_or(false);
                if !after_modifier && !between_vowel {
                    code.push('H');
                }
            }
            'K' => {
                if prev != Some('C') {
                    code.push('K');
                }
            }
            'P' => {
                if next == Some('H') {
                    code.push('F');
                } else {
                    code.push('P');
                }
            }
            'Q' => code.push('K'),
            'S' => {
                if next == Some('H') || (next == Some('I') && matches!(next2, Some('O') | Some('A'))) {
                    code.push('X');
                } else {
                    code.push('S');
                }
            }
            'T' => {
                if next == Some('I') && matches!(next2, Some('O') | Some('A')) {
                    code.push('X');
                } else if next == Some('H') {
                    code.push('0');
                } else if !(next == Some('C') && next2 == Some('H')) {
                    code.push('T');
                }
            }
            'V' => code.push('F'),
            'W' | 'Y' => {
                if next.map(is_vowel).unwrap_or(false) {
                    code.push(c);
                }
            }
            'X' => code.push_str("KS"),
            'Z' => code.push('S'),
            other => code.push(other),
        }
    }

    code
}
