//! Text cleanup applied to assistant replies before speech synthesis

use regex::Regex;
use std::sync::LazyLock;

/// Replacement spoken in place of fenced code
pub const CODE_BLOCK_PLACEHOLDER: &str = "bloque de código";

static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x{1F600}-\x{1F64F}\x{1F300}-\x{1F5FF}\x{1F680}-\x{1F6FF}\x{2600}-\x{26FF}]")
        .expect("invalid emoji regex")
});

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("invalid code block regex"));

static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("invalid bold regex"));

static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*(.*?)\*").expect("invalid italic regex"));

/// Strip emoji, collapse code blocks and drop markdown emphasis.
/// The result may be empty, in which case nothing should be spoken.
pub fn clean_for_speech(text: &str) -> String {
    let text = EMOJI.replace_all(text, "");
    let text = CODE_BLOCK.replace_all(&text, CODE_BLOCK_PLACEHOLDER);
    let text = BOLD.replace_all(&text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_emoji_ranges() {
        assert_eq!(clean_for_speech("¡Hola! 😊🌸🚀☀"), "¡Hola!");
        // Outside the stripped ranges
        assert_eq!(clean_for_speech("vale 🤔"), "vale 🤔");
    }

    #[test]
    fn code_blocks_become_placeholder() {
        let text = "Prueba esto:\n```rust\nfn main() {}\n```\ny me cuentas";
        assert_eq!(clean_for_speech(text), "Prueba esto:\nbloque de código\ny me cuentas");
    }

    #[test]
    fn emphasis_markers_dropped() {
        assert_eq!(
            clean_for_speech("Eso es **muy** importante, *de verdad*."),
            "Eso es muy importante, de verdad."
        );
    }

    #[test]
    fn only_emoji_leaves_nothing() {
        assert_eq!(clean_for_speech("  😔  "), "");
    }
}
