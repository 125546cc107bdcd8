//! Shell text sent to the remote host. Paths are always single-quoted.

/// Quote `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Create `dir` (and parents) unless it already exists. Safe to repeat.
pub fn mkdir_if_absent(dir: &str) -> String {
    let dir = quote(dir);
    format!("if [ ! -d {dir} ]; then mkdir -p {dir}; fi")
}

pub fn remove_recursive(dir: &str) -> String {
    format!("rm -rf {}", quote(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_uses_test_then_create() {
        assert_eq!(
            mkdir_if_absent("/var/www/my site"),
            "if [ ! -d '/var/www/my site' ]; then mkdir -p '/var/www/my site'; fi"
        );
    }

    #[test]
    fn clean_quotes_target() {
        assert_eq!(remove_recursive("/dst/a b"), "rm -rf '/dst/a b'");
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
