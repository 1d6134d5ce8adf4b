//! DOS wildcard matching for directory listings.
//!
//! `FindFilesWithPattern` receives the search expression the caller passed to
//! `FindFirstFile`. When an implementation only provides `find_files`, the
//! dispatcher filters its entries with [`is_name_in_expression`], mirroring
//! `FsRtlIsNameInExpression`:
//!
//! | char | meaning |
//! |------|---------|
//! | `*`  | any sequence, including empty |
//! | `?`  | exactly one character |
//! | `<`  | `DOS_STAR`: any sequence up to the final `.` in the name |
//! | `>`  | `DOS_QM`: one character, or nothing at a `.` or the end |
//! | `"`  | `DOS_DOT`: a `.`, or nothing at the end |

const DOS_STAR: char = '<';
const DOS_QM: char = '>';
const DOS_DOT: char = '"';

/// True if the expression contains any wildcard character.
pub fn has_wildcards(expression: &str) -> bool {
    expression.contains(['*', '?', DOS_STAR, DOS_QM, DOS_DOT])
}

/// Matches `name` against a DOS search expression.
///
/// An empty expression matches everything, as the driver sends it for a plain
/// directory enumeration.
pub fn is_name_in_expression(expression: &str, name: &str, ignore_case: bool) -> bool {
    if expression.is_empty() || expression == "*" {
        return true;
    }

    let fold = |s: &str| -> Vec<char> {
        if ignore_case {
            s.chars().flat_map(char::to_uppercase).collect()
        } else {
            s.chars().collect()
        }
    };
    let pattern = fold(expression);
    let name = fold(name);
    let last_dot = name.iter().rposition(|&c| c == '.');

    Matcher {
        pattern: &pattern,
        name: &name,
        last_dot,
        memo: vec![None; (pattern.len() + 1) * (name.len() + 1)],
    }
    .matches(0, 0)
}

struct Matcher<'a> {
    pattern: &'a [char],
    name: &'a [char],
    last_dot: Option<usize>,
    memo: Vec<Option<bool>>,
}

impl Matcher<'_> {
    fn matches(&mut self, p: usize, n: usize) -> bool {
        let slot = p * (self.name.len() + 1) + n;
        if let Some(known) = self.memo[slot] {
            return known;
        }
        let result = self.step(p, n);
        self.memo[slot] = Some(result);
        result
    }

    fn step(&mut self, p: usize, n: usize) -> bool {
        let at_end = n == self.name.len();
        let Some(&pc) = self.pattern.get(p) else {
            return at_end;
        };
        match pc {
            '*' => self.matches(p + 1, n) || (!at_end && self.matches(p, n + 1)),
            '?' => !at_end && self.matches(p + 1, n + 1),
            DOS_STAR => {
                let may_consume = !at_end && self.last_dot.is_none_or(|dot| n < dot);
                self.matches(p + 1, n) || (may_consume && self.matches(p, n + 1))
            }
            DOS_QM => {
                if at_end || self.name[n] == '.' {
                    self.matches(p + 1, n)
                } else {
                    self.matches(p + 1, n + 1)
                }
            }
            DOS_DOT => {
                if at_end {
                    self.matches(p + 1, n)
                } else {
                    self.name[n] == '.' && self.matches(p + 1, n + 1)
                }
            }
            literal => !at_end && self.name[n] == literal && self.matches(p + 1, n + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_star_and_question() {
        assert!(is_name_in_expression("*", "anything.txt", true));
        assert!(is_name_in_expression("*.txt", "notes.TXT", true));
        assert!(!is_name_in_expression("*.txt", "notes.TXT", false));
        assert!(is_name_in_expression("a?c", "abc", false));
        assert!(!is_name_in_expression("a?c", "ac", false));
        assert!(is_name_in_expression("", "whatever", false));
    }

    #[test]
    fn test_dos_star() {
        // <.txt is what cmd sends for *.txt
        assert!(is_name_in_expression("<.txt", "a.b.txt", true));
        assert!(is_name_in_expression("<", "noext", true));
        assert!(!is_name_in_expression("<", "a.b", true));
        assert!(is_name_in_expression("<.b", "a.b", true));
    }

    #[test]
    fn test_dos_qm_and_dot() {
        assert!(is_name_in_expression("ab>", "ab", true));
        assert!(is_name_in_expression("ab>", "abc", true));
        assert!(is_name_in_expression("a>\"txt", "ab.txt", true));
        assert!(is_name_in_expression("file\"", "file", true));
        assert!(!is_name_in_expression("file\"", "filex", true));
    }

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("*.rs"));
        assert!(has_wildcards("a<"));
        assert!(!has_wildcards("plain.txt"));
    }

    proptest! {
        #[test]
        fn prop_literal_matches_itself(name in "[a-zA-Z0-9._ -]{1,24}") {
            prop_assert!(is_name_in_expression(&name, &name, false));
            prop_assert!(is_name_in_expression(&name.to_lowercase(), &name, true));
        }

        #[test]
        fn prop_star_suffix(stem in "[a-z0-9]{0,10}", ext in "[a-z]{1,4}") {
            let name = format!("{stem}.{ext}");
            let pattern = format!("*.{ext}");
            prop_assert!(is_name_in_expression(&pattern, &name, true));
        }
    }
}
