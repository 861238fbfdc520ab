/// Rough token count for display: fragments left after splitting on
/// whitespace and ASCII punctuation. Never used for request sizing.
pub fn count_tokens(text: &str) -> usize {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|fragment| !fragment.is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_words_between_punctuation() {
        assert_eq!(count_tokens("Hello"), 1);
        assert_eq!(count_tokens("Hi there"), 2);
        assert_eq!(count_tokens("Hello, world! How's it going?"), 6);
        assert_eq!(count_tokens("a.b/c-d_e"), 5);
    }

    #[test]
    fn empty_and_separator_only() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("   \n\t"), 0);
        assert_eq!(count_tokens("...!?"), 0);
    }

    #[test]
    fn non_ascii_letters_stay_in_words() {
        assert_eq!(count_tokens("привет, мир"), 2);
        assert_eq!(count_tokens("naïve café"), 2);
    }
}
