/// Estimate token count from text using the chars/4 heuristic.
///
/// Uses ceiling division to avoid underestimating by a fraction.
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count() as u64;
    i64::try_from(chars.div_ceil(4)).unwrap_or(i64::MAX)
}
