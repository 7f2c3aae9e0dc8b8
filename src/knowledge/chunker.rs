//! Markdown-aware chunking.
//!
//! Documents over the target size are split along section boundaries and
//! smaller neighbors are merged back together, so one large document does not
//! dominate retrieval with a single giant chunk.

/// Preferred chunk size in bytes of text.
const TARGET_CHUNK_BYTES: usize = 3 * 1024;

/// Chunks below this merge into a neighbor when possible.
const MIN_CHUNK_BYTES: usize = 1024;

/// Hard ceiling; sections beyond this are split on paragraph boundaries.
const MAX_CHUNK_BYTES: usize = 4 * 1024;

/// Split a document into retrieval-sized chunks.
///
/// Empty input yields no chunks; input under the target size yields exactly
/// one chunk.
pub fn chunk_text(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= MAX_CHUNK_BYTES {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    for section in split_sections(text) {
        if section.len() <= MAX_CHUNK_BYTES {
            pieces.push(section);
        } else {
            pieces.extend(split_paragraphs(&section));
        }
    }
    merge_small_neighbors(pieces)
}

/// Split at markdown heading lines, keeping each heading with its section.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        let is_heading = !in_fence
            && trimmed.starts_with('#')
            && trimmed.chars().take_while(|c| *c == '#').count() <= 6
            && trimmed
                .chars()
                .nth(trimmed.chars().take_while(|c| *c == '#').count())
                .is_some_and(|c| c == ' ');
        if is_heading && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        // lines() dropped the knowledge of whether the text ended with a
        // newline; don't invent one.
        if !text.ends_with('\n') {
            current.pop();
        }
        sections.push(current);
    }
    sections
}

/// Accumulate paragraphs up to the target size; hard-split any paragraph that
/// alone exceeds the ceiling.
fn split_paragraphs(section: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for para in section.split("\n\n") {
        if para.trim().is_empty() {
            continue;
        }
        if current.len() + para.len() > TARGET_CHUNK_BYTES && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if para.len() > MAX_CHUNK_BYTES {
            out.extend(hard_split(para));
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

fn hard_split(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + TARGET_CHUNK_BYTES).min(text.len());
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
        out.push(text[start..end].to_string());
        start = end;
    }
    out
}

fn merge_small_neighbors(pieces: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for piece in pieces {
        match out.last_mut() {
            Some(last)
                if (last.len() < MIN_CHUNK_BYTES || piece.len() < MIN_CHUNK_BYTES)
                    && last.len() + piece.len() <= MAX_CHUNK_BYTES =>
            {
                last.push('\n');
                last.push_str(&piece);
            }
            _ => out.push(piece),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text("   \n  ").is_empty());
    }

    #[test]
    fn small_document_is_one_chunk() {
        let chunks = chunk_text("# Title\n\nA short document.");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("A short document."));
    }

    #[test]
    fn large_document_splits_on_headings() {
        let section = format!("lorem ipsum dolor sit amet. {}\n", "word ".repeat(400));
        let doc = format!(
            "# One\n\n{section}\n# Two\n\n{section}\n# Three\n\n{section}"
        );
        let chunks = chunk_text(&doc);
        assert!(chunks.len() >= 3, "expected >=3 chunks, got {}", chunks.len());
        assert!(chunks.iter().any(|c| c.contains("# Two")));
        for c in &chunks {
            assert!(c.len() <= MAX_CHUNK_BYTES + TARGET_CHUNK_BYTES);
        }
    }

    #[test]
    fn small_sections_merge() {
        let mut doc = String::new();
        for i in 0..40 {
            doc.push_str(&format!("# Section {i}\n\ntiny body {i}\n\n"));
        }
        // Pad past the single-chunk fast path.
        doc.push_str(&"filler text ".repeat(400));
        let chunks = chunk_text(&doc);
        // 40 tiny sections must not become 40 chunks.
        assert!(chunks.len() < 10, "got {} chunks", chunks.len());
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let doc = "x".repeat(3 * MAX_CHUNK_BYTES);
        let chunks = chunk_text(&doc);
        assert!(chunks.len() >= 3);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, doc.len());
    }

    #[test]
    fn headings_inside_code_fences_do_not_split() {
        let body = "word ".repeat(900);
        let doc = format!("# Real\n\n{body}\n```\n# not a heading\ncode\n```\n\n{body}");
        let chunks = chunk_text(&doc);
        let with_fence: Vec<_> = chunks.iter().filter(|c| c.contains("```")).collect();
        // The fenced block stays with surrounding text rather than opening a
        // section of its own.
        assert!(!with_fence.is_empty());
        for c in with_fence {
            assert!(!c.trim_start().starts_with("# not a heading"));
        }
    }

    #[test]
    fn utf8_boundaries_survive_hard_split() {
        let doc = "héllo wörld ".repeat(1500);
        let chunks = chunk_text(&doc);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat().len(), doc.trim().len());
    }
}
