/// Short preview of a secret for logs and status output. Never the full value.
pub fn mask_secret(secret: &str) -> String {
    let s = secret.trim();
    if s.is_empty() {
        return "unset".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    // Short secrets would be mostly revealed by any preview.
    if chars.len() < 16 {
        return "set".to_string();
    }
    let start: String = chars.iter().take(4).collect();
    let end: String = chars[chars.len() - 4..].iter().collect();
    format!("{start}******{end}")
}

pub fn bearer_token(auth: &str) -> Option<&str> {
    let s = auth.trim();
    let prefix = "Bearer ";
    if s.len() > prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return Some(s[prefix.len()..].trim());
    }
    None
}

/// Accepts `Bearer <key>` as well as the bare key, matching what existing
/// OpenAI clients send.
pub fn api_key_matches(authorization: Option<&str>, expected: &str) -> bool {
    let expected = expected.trim();
    if expected.is_empty() {
        return true;
    }
    let Some(auth) = authorization else {
        return false;
    };
    let presented = bearer_token(auth).unwrap_or_else(|| auth.trim());
    presented == expected
}
