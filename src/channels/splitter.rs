//! Outbound text splitting.
//!
//! Auto-split breaks an agent reply at paragraph boundaries; channels with a
//! hard length cap (Discord: 2000 chars) additionally split oversized chunks
//! at the nearest whitespace before the limit, falling back to a hard cut
//! for unbroken runs.

fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// Split at `\n\n` boundaries, dropping empty fragments. Order is preserved.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim_end)
        .filter(|chunk| !chunk.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Split `text` into pieces of at most `max_chars` characters, preferring
/// the nearest whitespace before the limit.
pub fn split_at_whitespace(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return Vec::new();
    }
    if char_count(text) <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while char_count(rest) > max_chars {
        // Byte offset of the character boundary at max_chars.
        let limit_byte = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);

        let window = &rest[..limit_byte];
        let cut = window
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(idx, _)| idx)
            .next_back();

        match cut {
            Some(at) if at > 0 => {
                chunks.push(rest[..at].to_string());
                // Skip the whitespace character itself.
                let next = rest[at..]
                    .char_indices()
                    .nth(1)
                    .map_or(rest.len(), |(idx, _)| at + idx);
                rest = &rest[next..];
            }
            _ => {
                chunks.push(window.to_string());
                rest = &rest[limit_byte..];
            }
        }
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Produce the ordered outbound chunks for one reply.
///
/// `auto_split` controls paragraph splitting; `max_chars` (when the channel
/// has one) is enforced regardless.
pub fn plan_chunks(text: &str, auto_split: bool, max_chars: Option<usize>) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let base = if auto_split {
        split_paragraphs(text)
    } else {
        vec![text.to_string()]
    };

    match max_chars {
        None => base,
        Some(limit) => base
            .iter()
            .flat_map(|chunk| split_at_whitespace(chunk, limit))
            .collect(),
    }
}
