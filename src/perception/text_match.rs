//! OCR 文本模糊匹配
//!
//! 去掉全部空白后：子串包含直接命中；否则取"字符命中率"与编辑相似度（`similar` 的 ratio），
//! 任一达到阈值即视为匹配。

use similar::TextDiff;

pub fn is_text_match(target: &str, detected: &str, threshold: f64) -> bool {
    let target: String = target.chars().filter(|c| !c.is_whitespace()).collect();
    let detected: String = detected.chars().filter(|c| !c.is_whitespace()).collect();
    if target.is_empty() || detected.is_empty() {
        return false;
    }
    if detected.contains(&target) {
        return true;
    }

    let total = target.chars().count();
    let hits = target.chars().filter(|c| detected.contains(*c)).count();
    let hit_ratio = hits as f64 / total as f64;
    let diff_ratio = f64::from(TextDiff::from_chars(target.as_str(), detected.as_str()).ratio());

    diff_ratio >= threshold || hit_ratio >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_wins_regardless_of_threshold() {
        assert!(is_text_match("Boss", "The Boss Arrives", 0.5));
        assert!(is_text_match("Boss", "The Boss Arrives", 1.0));
        assert!(is_text_match("世界 王", "出現：世界王！", 0.99));
    }

    #[test]
    fn test_unrelated_text_rejected() {
        assert!(!is_text_match("Boss", "xyz", 0.9));
        assert!(!is_text_match("Boss", "xyz", 0.1));
    }

    #[test]
    fn test_empty_inputs_never_match() {
        assert!(!is_text_match("", "anything", 0.0));
        assert!(!is_text_match("Boss", "   ", 0.0));
    }

    #[test]
    fn test_fuzzy_match_by_ratio() {
        // OCR 把 o 识别成 0
        assert!(is_text_match("Boss", "B0ss", 0.7));
        assert!(!is_text_match("Boss", "B0ss", 0.8));
    }
}
