//! Display cleanup for raw generated text.
//!
//! Generated text is the concatenation of raw vocabulary pieces, which still
//! carry SentencePiece markers. [`clean_output`] turns it into plain text.

/// Word-boundary marker used by SentencePiece vocabularies.
pub const WORD_MARKER: char = '\u{2581}';

/// Byte-fallback piece for a newline.
const NEWLINE_PIECE: &str = "<0x0A>";

/// `▁` becomes a space and `<0x0A>` a newline; runs of spaces collapse,
/// lines are trimmed and blank lines dropped.
pub fn clean_output(raw: &str) -> String {
    let text = raw.replace(WORD_MARKER, " ").replace(NEWLINE_PIECE, "\n");

    text.split('\n')
        .map(|line| {
            line.split(' ')
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
