//! Small helpers shared across the workspace.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric identifier of the given length.
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Strip markup tags from a text fragment, keeping only character data.
pub fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_has_requested_length() {
        let id = random_id(6);
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(random_id(16), random_id(16));
    }

    #[test]
    fn strips_tags() {
        assert_eq!(strip_tags("<b>bold</b> and plain"), "bold and plain");
        assert_eq!(strip_tags("no tags"), "no tags");
        assert_eq!(strip_tags("<a href=\"x\">link</a>"), "link");
    }
}
