//! Denylist scan over the raw submission text.

use regex::{escape, RegexSet};

use crate::errors::{SandboxError, SecurityViolation};

/// Scanned in order; the first entry that matches is reported.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "eval(",
    "exec(",
    "open(",
    "write(",
    "delete",
    "remove",
    "shutil",
    "__import__",
    "socket",
    "threading",
    "multiprocessing",
    "compile(",
];

/// Case-insensitive matcher for denylist entries.
///
/// Entries match anywhere in the text, so `os` also fires inside `pos` or
/// `close` and `remove` inside `list_remove_count`. An entry ending in `(`
/// matches the name followed by optional whitespace and the parenthesis.
#[derive(Debug, Clone)]
pub struct PatternScanner {
    tokens: Vec<String>,
    set: RegexSet,
}

impl PatternScanner {
    pub fn new<I, S>(entries: I) -> Result<Self, SandboxError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = entries
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();

        let expressions: Vec<String> = tokens.iter().map(|token| entry_regex(token)).collect();
        let set = RegexSet::new(&expressions)
            .map_err(|e| SandboxError::Config(format!("Invalid denylist entry: {}", e)))?;

        Ok(Self { tokens, set })
    }

    pub fn with_defaults() -> Self {
        // The built-in entries are literals that always compile.
        Self::new(DEFAULT_DENYLIST.iter().copied()).unwrap_or_else(|_| Self {
            tokens: Vec::new(),
            set: RegexSet::empty(),
        })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Returns the first denylisted entry, in denylist order, found in `code`.
    pub fn first_match(&self, code: &str) -> Option<&str> {
        self.set
            .matches(code)
            .iter()
            .next()
            .map(|index| self.tokens[index].as_str())
    }

    pub fn check(&self, code: &str) -> Result<(), SecurityViolation> {
        match self.first_match(code) {
            Some(token) => Err(SecurityViolation::pattern(token)),
            None => Ok(()),
        }
    }
}

fn entry_regex(entry: &str) -> String {
    let mut expression = String::from("(?i)");
    match entry.strip_suffix('(') {
        Some(name) => {
            expression.push_str(&escape(name.trim_end()));
            expression.push_str(r"\s*\(");
        }
        None => expression.push_str(&escape(entry)),
    }
    expression
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_entries_anywhere_in_the_text() {
        let scanner = PatternScanner::with_defaults();
        assert_eq!(scanner.first_match("import os"), Some("os"));
        assert_eq!(scanner.first_match("x = os.path.join('a')"), Some("os"));
        assert_eq!(scanner.first_match("IMPORT SYS"), Some("sys"));
        assert_eq!(scanner.first_match("pos = 1"), Some("os"));
        assert_eq!(scanner.first_match("plt.close()"), Some("os"));
    }

    #[test]
    fn embedded_names_are_caught() {
        let scanner = PatternScanner::with_defaults();
        assert_eq!(scanner.first_match("os_name = 'x'"), Some("os"));
        assert_eq!(scanner.first_match("list_remove_count = 2"), Some("remove"));
        assert_eq!(scanner.first_match("items.remove_all()"), Some("remove"));
        assert_eq!(scanner.first_match("db.deleteAll()"), Some("delete"));
        assert_eq!(scanner.first_match("import my_shutil_wrapper"), Some("shutil"));
    }

    #[test]
    fn call_entries_need_a_parenthesis() {
        let scanner = PatternScanner::with_defaults();
        assert_eq!(scanner.first_match("eval ('1+1')"), Some("eval("));
        assert_eq!(scanner.first_match("f.write('x')"), Some("write("));
        assert_eq!(scanner.first_match("reopen(x)"), Some("open("));
        assert_eq!(scanner.first_match("evaluation = 3"), None);
        assert_eq!(scanner.first_match("writer = None"), None);
    }

    #[test]
    fn reports_first_entry_in_denylist_order() {
        let scanner = PatternScanner::with_defaults();
        // `socket` appears first in the text, `os` first in the denylist.
        assert_eq!(scanner.first_match("import socket; import os"), Some("os"));
    }

    #[test]
    fn dunder_import_is_matched() {
        let scanner = PatternScanner::with_defaults();
        assert_eq!(scanner.first_match("m = __import__('x')"), Some("__import__"));
    }

    #[test]
    fn safe_clustering_code_passes() {
        let scanner = PatternScanner::with_defaults();
        let code = "import numpy as np\n\
                    from sklearn.cluster import KMeans\n\
                    X = np.random.RandomState(0).rand(50, 2)\n\
                    labels = KMeans(n_clusters=3, n_init=10).fit_predict(X)\n\
                    plt.scatter(X[:, 0], X[:, 1], c=labels)\n\
                    print(labels[:5])";
        assert!(scanner.check(code).is_ok());
    }

    #[test]
    fn extra_entries_without_word_edges_compile() {
        let scanner = PatternScanner::new(["pickle", ".loads("]).unwrap();
        assert_eq!(scanner.first_match("import pickle"), Some("pickle"));
        assert_eq!(scanner.first_match("json.loads (s)"), Some(".loads("));
        assert_eq!(scanner.tokens().len(), 2);
    }
}
