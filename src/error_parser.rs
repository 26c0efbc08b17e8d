//! Pure parsing of a raw log message into a canonical error definition,
//! stack trace, and stack key. No I/O, no Store access.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::error_def::{ErrorDefinition, StackFrame, StackTrace};

pub const PROMOTED_PREFIX: &str = "[promoted from WARNING] ";

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^  File "(.*)", line (\d+), in (.*)$"#).unwrap())
}

fn deploy_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.*\d{4,6}-\d{4}-[0-9a-f]{12}\.\d+/").unwrap())
}

fn memcache_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^Memcache set failed for ([^(\['"{]*)"#).unwrap())
}

fn strip_deploy_path(filename: &str) -> String {
    deploy_path_re().replace(filename, "").to_string()
}

/// Parse a raw multi-line log message into `(ErrorDefinition, StackTrace, stack_key)`.
pub fn parse_message(message: &str, status: &str, level: &str) -> (ErrorDefinition, StackTrace, String) {
    let mut lines = message.split('\n');
    let first_line = lines.next().unwrap_or("");
    let last_line = message.rsplit('\n').next().unwrap_or("");
    let raw_title = if first_line.is_empty() { last_line } else { first_line };
    let title = raw_title
        .strip_prefix(PROMOTED_PREFIX)
        .unwrap_or(raw_title)
        .to_string();

    let id0 = format!(
        "{status} {level} {}",
        digits_re().replace_all(&title, "%%")
    );

    let (id1, id2, id3) = non_combinable_ids(&title, status, level, &id0);

    let key = fingerprint(&id0, id1.as_deref(), id2.as_deref(), id3.as_deref());

    let stack = parse_stack(message);

    let def = ErrorDefinition {
        key,
        title,
        status: status.to_string(),
        level: level.to_string(),
        id0,
        id1,
        id2,
        id3,
    };
    let stack_key = stack.stack_key();
    (def, stack, stack_key)
}

fn non_combinable_ids(
    title: &str,
    status: &str,
    level: &str,
    id0: &str,
) -> (Option<String>, Option<String>, Option<String>) {
    if title.contains("object has no attribute") || title.starts_with("Error in signature for") {
        return (None, None, None);
    }

    if let Some(caps) = memcache_prefix_re().captures(title) {
        let captured = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        return (None, None, Some(captured));
    }

    let words: Vec<&str> = id0.split(' ').collect();
    let id1_words = slice_words(&words, 2, 5);
    let id2_words = last_n_words(&words, 3);

    let id1 = Some(format!("{status} {level} {}", id1_words.join(" ")));
    let id2 = Some(format!("{status} {level} {}", id2_words.join(" ")));
    (id1, id2, None)
}

fn slice_words<'a>(words: &[&'a str], start: usize, end: usize) -> Vec<&'a str> {
    let start = start.min(words.len());
    let end = end.min(words.len());
    if start >= end {
        return Vec::new();
    }
    words[start..end].to_vec()
}

fn last_n_words<'a>(words: &[&'a str], n: usize) -> Vec<&'a str> {
    let n = n.min(words.len());
    words[words.len() - n..].to_vec()
}

fn fingerprint(id0: &str, id1: Option<&str>, id2: Option<&str>, id3: Option<&str>) -> String {
    let joined = format!(
        "{}{}{}{}",
        id0,
        id1.unwrap_or("None"),
        id2.unwrap_or("None"),
        id3.unwrap_or("None"),
    );
    let digest = format!("{:x}", md5::compute(joined.as_bytes()));
    digest[..8].to_string()
}

fn parse_stack(message: &str) -> StackTrace {
    let mut frames = Vec::new();
    for line in message.split('\n').skip(1) {
        if line.starts_with("Traceback") {
            continue;
        }
        let Some(caps) = frame_re().captures(line) else {
            continue;
        };
        let filename = strip_deploy_path(&caps[1]);
        let lineno = caps[2].to_string();
        let function = caps[3].to_string();
        frames.push(StackFrame { filename, lineno, function });
    }
    StackTrace(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_uses_first_nonempty_line() {
        let (def, _, _) = parse_message("boom\nsecond line", "500", "3");
        assert_eq!(def.title, "boom");
    }

    #[test]
    fn empty_first_line_falls_back_to_last_line() {
        let (def, _, _) = parse_message("\nmiddle\nlast line", "500", "3");
        assert_eq!(def.title, "last line");
    }

    #[test]
    fn strips_promotion_prefix() {
        let (def, _, _) = parse_message("[promoted from WARNING] something broke", "500", "3");
        assert_eq!(def.title, "something broke");
    }

    #[test]
    fn digits_in_title_do_not_change_key() {
        let (d1, _, _) = parse_message("Error while parsing directive 1", "500", "3");
        let (d2, _, _) = parse_message("Error while parsing directive 2", "500", "3");
        assert_eq!(d1.key, d2.key);
    }

    #[test]
    fn attribute_error_has_no_id1_id2() {
        let (def, _, _) = parse_message("'Foo' object has no attribute 'bar'", "500", "3");
        assert!(def.id1.is_none());
        assert!(def.id2.is_none());
        assert!(def.id3.is_none());
    }

    #[test]
    fn attribute_error_groups_only_on_exact_id0() {
        let (a, _, _) = parse_message("'Foo' object has no attribute 'bar'", "500", "3");
        let (b, _, _) = parse_message("'Baz' object has no attribute 'qux'", "500", "3");
        assert_ne!(a.id0, b.id0);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn memcache_prefix_captures_up_to_delimiter() {
        let (def, _, _) = parse_message("Memcache set failed for key_name(123)", "500", "3");
        assert_eq!(def.id3.as_deref(), Some("key_name"));
        assert!(def.id1.is_none());
        assert!(def.id2.is_none());
    }

    #[test]
    fn stack_frames_parsed_and_deploy_path_stripped() {
        let message = concat!(
            "boom\n",
            "Traceback (most recent call last):\n",
            "  File \"/base/data/home/apps/s~app/000000-0000-0123456789ab.123456789/main.py\", line 42, in handler\n",
            "not a frame line\n",
        );
        let (_, stack, _) = parse_message(message, "500", "3");
        assert_eq!(stack.0.len(), 1);
        assert_eq!(stack.0[0].filename, "main.py");
        assert_eq!(stack.0[0].lineno, "42");
        assert_eq!(stack.0[0].function, "handler");
    }

    #[test]
    fn stack_key_ignores_line_numbers() {
        let a = concat!(
            "boom\n",
            "  File \"main.py\", line 1, in handler\n",
        );
        let b = concat!(
            "boom\n",
            "  File \"main.py\", line 99, in handler\n",
        );
        let (_, sa, ka) = parse_message(a, "500", "3");
        let (_, sb, kb) = parse_message(b, "500", "3");
        assert_eq!(ka, kb);
        assert_eq!(sa.stack_key(), sb.stack_key());
    }
}
