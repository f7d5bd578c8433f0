// crates/contextd-server/src/indexer/chunking.rs
// Line-based chunking for embedding generation

/// One chunk of a source file, with 1-indexed line bounds.
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub content: String,
    pub line_start: u32,
    pub line_end: u32,
}

/// Split file content into overlapping line windows. With chunking disabled
/// callers pass the whole file through `single_chunk` instead.
pub fn chunk_lines(content: &str, chunk_size: usize, overlap: usize) -> Vec<FileChunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);
    let step = chunk_size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(lines.len());
        let body = lines[start..end].join("\n");
        if !body.trim().is_empty() {
            chunks.push(FileChunk {
                content: body,
                line_start: start as u32 + 1,
                line_end: end as u32,
            });
        }
        if end == lines.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// The whole file as one chunk.
pub fn single_chunk(content: &str) -> Vec<FileChunk> {
    let line_count = content.lines().count() as u32;
    if line_count == 0 || content.trim().is_empty() {
        return Vec::new();
    }
    vec![FileChunk {
        content: content.to_string(),
        line_start: 1,
        line_end: line_count,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(lines: usize) -> String {
        (1..=lines)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_single_chunk_covers_file() {
        let content = numbered(10);
        let chunks = single_chunk(&content);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].line_start, 1);
        assert_eq!(chunks[0].line_end, 10);
    }

    #[test]
    fn test_chunks_overlap_and_cover() {
        let content = numbered(250);
        let chunks = chunk_lines(&content, 100, 20);

        assert_eq!(chunks[0].line_start, 1);
        assert_eq!(chunks[0].line_end, 100);
        assert_eq!(chunks[1].line_start, 81);
        assert_eq!(chunks[1].line_end, 180);
        // Last chunk reaches the final line.
        assert_eq!(chunks.last().unwrap().line_end, 250);
    }

    #[test]
    fn test_short_file_is_one_chunk() {
        let chunks = chunk_lines(&numbered(5), 100, 20);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].line_end, 5);
    }

    #[test]
    fn test_empty_and_blank_content() {
        assert!(chunk_lines("", 100, 20).is_empty());
        assert!(single_chunk("\n\n  \n").is_empty());
    }
}
