// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Splits outbound reply text into adapter-sized chunks:
//! breaks only at line boundaries, keeps fenced code blocks (`` ``` ``)
//! unbroken when possible, and never drops or reorders a character — the
//! concatenation of the returned chunks is always byte-identical to the
//! input.

/// Default per-chunk ceiling: 4000 chars.
pub const DEFAULT_MAX_CHARS: usize = 4_000;

/// Split `text` into chunks no longer than `max_chars`, breaking only at
/// line boundaries and keeping fenced code blocks together whenever a
/// single fence's contents do not themselves exceed `max_chars`.
pub fn chunk(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in split_keep_newlines(text) {
        let is_fence_marker = line.trim_start().trim_end_matches('\n').starts_with("```");

        // Break before this line if it would overflow — but never while a
        // fence is open, since that would ship a broken code block.
        if !current.is_empty() && !in_fence && current.len() + line.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }

        current.push_str(line);
        if is_fence_marker {
            in_fence = !in_fence;
        }

        // A line (or an unbroken fence) that alone pushed `current` past
        // the ceiling is flushed as soon as it's safe to do so (fence
        // closed, or it was never fenced to begin with).
        if current.len() > max_chars && !in_fence {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split `text` into lines that each retain their trailing `\n` (the final
/// segment may lack one). Concatenating the result reproduces `text`
/// exactly.
fn split_keep_newlines(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '\n' {
            result.push(&text[start..=i]);
            start = i + 1;
        }
    }
    if start < text.len() {
        result.push(&text[start..]);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk("hello world", 4000);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk("", 4000).is_empty());
    }

    #[test]
    fn concatenation_reproduces_the_input_exactly() {
        let mut text = String::new();
        for i in 0..500 {
            text.push_str(&format!("line number {i} has some filler words to pad it out\n"));
        }
        let chunks = chunk(&text, 400);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunks_stay_under_ceiling_when_lines_are_small() {
        let mut text = String::new();
        for i in 0..200 {
            text.push_str(&format!("short line {i}\n"));
        }
        let chunks = chunk(&text, 300);
        for c in &chunks {
            assert!(c.len() <= 300, "chunk exceeded ceiling: {} chars", c.len());
        }
    }

    #[test]
    fn fenced_code_block_is_not_split_even_if_it_crosses_the_ceiling() {
        let mut fence_body = String::from("```rust\n");
        for i in 0..50 {
            fence_body.push_str(&format!("let x{i} = {i};\n"));
        }
        fence_body.push_str("```\n");
        let text = format!("intro paragraph\n\n{fence_body}\nafter\n");

        let chunks = chunk(&text, 200);
        assert_eq!(chunks.concat(), text);

        // The fence body must appear intact inside exactly one chunk.
        let containing = chunks.iter().find(|c| c.contains("let x0 = 0;"));
        assert!(containing.is_some());
        let c = containing.unwrap();
        assert!(c.contains("let x49 = 49;"), "fence was split: {c}");
    }
}
