/// Strips recognizer artifact markers and collapses whitespace so only text
/// the clinician actually dictated reaches the session transcript.
pub fn sanitize_fragment(input: &str) -> String {
    let without_artifacts = strip_bracket_artifacts(input);
    normalize_whitespace(&without_artifacts)
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_bracket_artifacts(input: &str) -> String {
    let chars = input.chars().collect::<Vec<_>>();
    let mut output = String::with_capacity(input.len());
    let mut idx = 0usize;

    while idx < chars.len() {
        if chars[idx] == '[' {
            let mut end = idx + 1;
            while end < chars.len() && chars[end] != ']' {
                end += 1;
            }

            if end < chars.len() {
                let token = chars[idx + 1..end].iter().collect::<String>();
                if is_artifact_token(&token) {
                    idx = end + 1;
                    continue;
                }
            }
        }

        output.push(chars[idx]);
        idx += 1;
    }

    output
}

// Recognizer markers come back as short upper-case bracket tokens such as
// [BLANK_AUDIO] or [MUSIC]; dictated bracket text like [v1] must survive.
fn is_artifact_token(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 48 {
        return false;
    }

    let mut saw_ascii_alpha = false;
    for ch in trimmed.chars() {
        if ch.is_ascii_alphabetic() {
            if ch.is_ascii_lowercase() {
                return false;
            }
            saw_ascii_alpha = true;
            continue;
        }

        if ch.is_ascii_digit() || ch == '_' || ch == '-' || ch == ' ' {
            continue;
        }

        return false;
    }

    saw_ascii_alpha
}

#[cfg(test)]
mod tests {
    use super::{normalize_whitespace, sanitize_fragment};

    #[test]
    fn strips_blank_audio_marker() {
        assert_eq!(
            sanitize_fragment("patient reports [BLANK_AUDIO] dizziness"),
            "patient reports dizziness"
        );
    }

    #[test]
    fn keeps_dictated_bracket_text() {
        assert_eq!(
            sanitize_fragment("dosage [v2] unchanged"),
            "dosage [v2] unchanged"
        );
    }

    #[test]
    fn collapses_whitespace_after_sanitization() {
        assert_eq!(
            sanitize_fragment("  follow   [MUSIC]   up  "),
            "follow up"
        );
    }

    #[test]
    fn normalize_joins_interior_runs() {
        assert_eq!(normalize_whitespace(" a  b\t c \n"), "a b c");
    }
}
