/// Advances a 1-based line and column pair over already decoded text.
///
/// Columns count characters, not bytes, so a line holding multi-byte characters
/// reports the same column an editor would show. A `\n` moves to the next line
/// and resets the column; every other character (including `\r`) advances it.
pub fn advance_line_and_column(text: &str, line: usize, column: usize) -> (usize, usize) {
    let mut line = line;
    let mut column = column;
    for c in text.chars() {
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_characters_not_bytes() {
        let (line, column) = advance_line_and_column("a\nb\r\ncdéfgåí界", 1, 1);
        assert_eq!(line, 3);
        assert_eq!(column, 9);
    }

    #[test]
    fn test_empty_text_keeps_position() {
        assert_eq!(advance_line_and_column("", 4, 7), (4, 7));
    }
}
