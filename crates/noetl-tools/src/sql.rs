//! SQL statement splitting.
//!
//! Task commands may carry several statements separated by `;`. The splitter
//! tracks single/double-quoted literals, line and block comments, and
//! `$tag$ .. $tag$` dollar-quoted regions so procedure bodies survive intact.

/// Split a SQL script into individual statements.
///
/// Returns trimmed, non-empty statements without the trailing `;`.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;
    let mut dollar_tag: Option<String> = None;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if in_line_comment {
            current.push(c);
            if c == '\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }

        if in_block_comment {
            current.push(c);
            if c == '*' && next == Some('/') {
                current.push('/');
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }

        if let Some(ref tag) = dollar_tag {
            current.push(c);
            if c == '$' && matches_tag(&chars, i, tag) {
                for offset in 1..tag.len() {
                    current.push(chars[i + offset]);
                }
                i += tag.len();
                dollar_tag = None;
                continue;
            }
            i += 1;
            continue;
        }

        if in_single {
            current.push(c);
            // doubled quote is an escaped quote inside the literal
            if c == '\'' {
                if next == Some('\'') {
                    current.push('\'');
                    i += 2;
                    continue;
                }
                in_single = false;
            }
            i += 1;
            continue;
        }

        if in_double {
            current.push(c);
            if c == '"' {
                in_double = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                current.push(c);
                i += 1;
            }
            '"' => {
                in_double = true;
                current.push(c);
                i += 1;
            }
            '-' if next == Some('-') => {
                in_line_comment = true;
                current.push(c);
                i += 1;
            }
            '/' if next == Some('*') => {
                in_block_comment = true;
                current.push(c);
                i += 1;
            }
            '$' => {
                if let Some(tag) = read_dollar_tag(&chars, i) {
                    current.push_str(&tag);
                    i += tag.len();
                    dollar_tag = Some(tag);
                } else {
                    current.push(c);
                    i += 1;
                }
            }
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }

    statements
}

/// Read a `$tag$` opener at position `i`, returning the full tag (`$$`,
/// `$body$`, ...) when one starts here.
fn read_dollar_tag(chars: &[char], i: usize) -> Option<String> {
    let mut tag = String::from("$");
    let mut j = i + 1;
    while j < chars.len() {
        let c = chars[j];
        if c == '$' {
            tag.push('$');
            return Some(tag);
        }
        if c.is_alphanumeric() || c == '_' {
            tag.push(c);
            j += 1;
        } else {
            return None;
        }
    }
    None
}

/// Check whether the closing tag occurs at position `i`.
fn matches_tag(chars: &[char], i: usize, tag: &str) -> bool {
    let tag_chars: Vec<char> = tag.chars().collect();
    if i + tag_chars.len() > chars.len() {
        return false;
    }
    chars[i..i + tag_chars.len()] == tag_chars[..]
}
