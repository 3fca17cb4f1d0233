const MAX_FILENAME_CHARS: usize = 200;

// Leading dots and reserved device names pass through unchanged.
pub fn clean_filename(value: &str) -> String {
    value
        .chars()
        .filter(|character| !matches!(character, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .take(MAX_FILENAME_CHARS)
        .collect()
}
