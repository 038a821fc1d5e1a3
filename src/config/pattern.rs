//! URL pattern normalization.

/// Rewrites templated placeholders (`{{.Name}}`) into route parameters
/// (`:name`), so the same logical route always yields the same attribute
/// value.
///
/// Unterminated placeholders are left untouched.
pub fn normalize_url_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find("{{.") {
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push(':');
        out.push_str(&after[..end].to_lowercase());
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_placeholders() {
        assert_eq!(normalize_url_pattern("/users/{{.Id}}"), "/users/:id");
        assert_eq!(
            normalize_url_pattern("/a/{{.Foo}}/b/{{.BarBaz}}"),
            "/a/:foo/b/:barbaz"
        );
    }

    #[test]
    fn test_normalize_without_placeholders() {
        assert_eq!(normalize_url_pattern("/plain/path"), "/plain/path");
        assert_eq!(normalize_url_pattern(""), "");
    }

    #[test]
    fn test_normalize_unterminated() {
        assert_eq!(normalize_url_pattern("/x/{{.Open"), "/x/{{.Open");
        assert_eq!(normalize_url_pattern("/{{.A}}/{{.B"), "/:a/{{.B");
    }
}
