//! Pull JSON out of `meshtastic` CLI output.
//!
//! `--info` prints labelled blocks (`My info: {..}`, `Metadata: {..}`, `Nodes in mesh: {..}`)
//! between plain-text banners. Each balanced `{..}` block that parses is folded into one
//! object keyed by its label; unlabelled blocks are merged at the top level.

use serde_json::{Map, Value};

/// Parse `text` as JSON, or assemble an object from the JSON blocks embedded in it.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let blocks = labelled_blocks(text);
    if blocks.is_empty() {
        return None;
    }
    if let [(None, only)] = blocks.as_slice() {
        return Some(only.clone());
    }

    let mut merged = Map::new();
    for (label, value) in blocks {
        match label {
            Some(key) => {
                merged.insert(key, value);
            }
            None => {
                if let Value::Object(fields) = value {
                    merged.extend(fields);
                }
            }
        }
    }
    Some(Value::Object(merged))
}

/// Every parseable top-level `{..}` block with the label found before it on the same line.
fn labelled_blocks(text: &str) -> Vec<(Option<String>, Value)> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        match block_end(bytes, i) {
            Some(end) => match serde_json::from_str::<Value>(&text[i..=end]) {
                Ok(value) if value.is_object() => {
                    out.push((label_before(text, i), value));
                    i = end + 1;
                }
                _ => i += 1,
            },
            None => break,
        }
    }
    out
}

/// Index of the brace closing the block opened at `start`, honouring JSON strings.
fn block_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn label_before(text: &str, brace: usize) -> Option<String> {
    let line_start = text[..brace].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let label = text[line_start..brace].trim().trim_end_matches(':').trim();
    if label.is_empty() {
        return None;
    }
    Some(label_key(label))
}

/// `"Nodes in mesh"` → `"nodes"`, otherwise camelCase (`"My info"` → `"myInfo"`).
fn label_key(label: &str) -> String {
    let lower = label.to_ascii_lowercase();
    if lower.starts_with("nodes") {
        return "nodes".to_string();
    }
    let mut key = String::with_capacity(label.len());
    for (idx, word) in lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
    {
        if idx == 0 {
            key.push_str(word);
        } else {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                key.push(first.to_ascii_uppercase());
                key.push_str(chars.as_str());
            }
        }
    }
    key
}
