//! Minimal SQL scanner separating code from quoted text and comments

/// A run of SQL text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    /// Keywords, identifiers, operators, whitespace
    Code(&'a str),
    /// A quoted literal or identifier including its quotes
    Quoted(&'a str),
}

/// Split `sql` into code and quoted runs. `--` and `/* */` comments are
/// dropped; an unterminated quote runs to the end of the input.
pub(crate) fn segments(sql: &str) -> Vec<Segment<'_>> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                if start < i {
                    out.push(Segment::Code(&sql[start..i]));
                }
                let open = i;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // doubled quote is an escaped quote
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                let close = (i + 1).min(bytes.len());
                out.push(Segment::Quoted(&sql[open..close]));
                i = close;
                start = i;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                if start < i {
                    out.push(Segment::Code(&sql[start..i]));
                }
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                out.push(Segment::Code(" "));
                start = i;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                if start < i {
                    out.push(Segment::Code(&sql[start..i]));
                }
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                out.push(Segment::Code(" "));
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        out.push(Segment::Code(&sql[start..]));
    }
    out
}

/// `sql` with comments removed and every single-quoted literal emptied to
/// `''`, for pattern checks that must not look inside strings
pub(crate) fn code_only(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for segment in segments(sql) {
        match segment {
            Segment::Code(code) => out.push_str(code),
            Segment::Quoted(q) if q.starts_with('\'') => out.push_str("''"),
            Segment::Quoted(q) => out.push_str(q),
        }
    }
    out
}

/// Apply `f` to each maximal code run, leaving quoted runs untouched
pub(crate) fn map_code(sql: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut code = String::new();
    for segment in segments(sql) {
        match segment {
            Segment::Code(c) => code.push_str(c),
            Segment::Quoted(q) => {
                if !code.is_empty() {
                    out.push_str(&f(&code));
                    code.clear();
                }
                out.push_str(q);
            }
        }
    }
    if !code.is_empty() {
        out.push_str(&f(&code));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_are_isolated() {
        let segs = segments("SELECT 'it''s' FROM t");
        assert_eq!(
            segs,
            vec![
                Segment::Code("SELECT "),
                Segment::Quoted("'it''s'"),
                Segment::Code(" FROM t"),
            ]
        );
    }

    #[test]
    fn test_comments_dropped() {
        assert_eq!(
            code_only("SELECT a -- drop table x\nFROM t /* note */"),
            "SELECT a  \nFROM t  "
        );
    }

    #[test]
    fn test_code_only_blanks_strings() {
        assert_eq!(
            code_only("SELECT * FROM t WHERE note = 'DELETE FROM x'"),
            "SELECT * FROM t WHERE note = ''"
        );
    }

    #[test]
    fn test_map_code_joins_runs_around_comments() {
        let mapped = map_code("a -- x\nb 'q' c", |code| format!("[{}]", code));
        assert_eq!(mapped, "[a  \nb ]'q'[ c]");
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(code_only("SELECT 'abc"), "SELECT ''");
    }
}
