// Remote paths are POSIX-like ("/Docs/A.txt") regardless of the local
// platform; normalization here is purely lexical.

#[cfg(not(windows))]
const TO_ESCAPE: &[char] = &['\\', ' ', '\''];
#[cfg(windows)]
const TO_ESCAPE: &[char] = &[' '];

/// Normalizes a path and splits it into segments, root to leaf.
///
/// `.` segments and repeated separators collapse; `..` consumes the lexical
/// ancestor (leading `..` is kept for relative paths). An absolute path
/// yields an explicit leading empty segment; the empty path yields nothing.
pub fn normalize_and_split(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut segments: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if segments.last().is_some_and(|s| s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..".to_string());
                }
            }
            name => segments.push(name.to_string()),
        }
    }
    if absolute {
        segments.insert(0, String::new());
    }
    segments
}

/// Escapes separator, space, and quote characters for shell-style display.
/// On Windows the backslash is the separator itself, so only space is
/// escaped there.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if TO_ESCAPE.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
