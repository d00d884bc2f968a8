//! Syntax-tree inspection of a submission.
//!
//! The code is parsed with the Python 3 grammar from `rustpython-parser` and
//! every node is visited. Parsing failures are reported with the parser's
//! own message.

use rustpython_ast::Visitor;
use rustpython_parser::{ast, Parse};

use crate::errors::SecurityViolation;

pub const FORBIDDEN_MODULES: &[&str] = &["os", "sys", "subprocess"];
pub const FORBIDDEN_CALLS: &[&str] = &["eval", "exec", "open"];

const SOURCE_PATH: &str = "<submission>";
const FUTURE_MODULE: &str = "__future__";

pub fn check_structure(code: &str) -> Result<(), SecurityViolation> {
    let suite = ast::Suite::parse(code, SOURCE_PATH)
        .map_err(|e| SecurityViolation::syntax(e.to_string()))?;

    let mut finder = ForbiddenNodeFinder::default();
    for stmt in suite {
        finder.visit_stmt(stmt);
        if finder.violation.is_some() {
            break;
        }
    }

    match finder.violation {
        Some(violation) => Err(violation),
        None => Ok(()),
    }
}

/// `os.path` is judged by its root package `os`.
fn module_root(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[derive(Default)]
struct ForbiddenNodeFinder {
    violation: Option<SecurityViolation>,
}

impl ForbiddenNodeFinder {
    fn record(&mut self, violation: SecurityViolation) {
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
    }

    fn check_module(&mut self, name: &str) {
        let root = module_root(name);
        if FORBIDDEN_MODULES.contains(&root) {
            self.record(SecurityViolation::import(root));
        }
    }
}

impl Visitor for ForbiddenNodeFinder {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            self.check_module(alias.name.as_str());
        }
        self.generic_visit_stmt_import(node);
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        if let Some(module) = &node.module {
            if module.as_str() == FUTURE_MODULE {
                // The snippet is embedded in the harness body, where CPython refuses these.
                self.record(SecurityViolation::syntax(
                    "from __future__ imports are not supported",
                ));
            }
            self.check_module(module.as_str());
        }
        self.generic_visit_stmt_import_from(node);
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        if let ast::Expr::Name(name) = node.func.as_ref() {
            let function = name.id.as_str();
            if FORBIDDEN_CALLS.contains(&function) {
                self.record(SecurityViolation::call(function));
            }
        }
        self.generic_visit_expr_call(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SecurityRule;

    #[test]
    fn rejects_forbidden_imports() {
        let violation = check_structure("import numpy\nimport subprocess\n").unwrap_err();
        assert_eq!(violation.rule, SecurityRule::AstImport);
        assert_eq!(violation.token, "subprocess");

        let violation = check_structure("import os.path as p").unwrap_err();
        assert_eq!(violation.token, "os");

        let violation = check_structure("from sys import argv").unwrap_err();
        assert_eq!(violation.token, "sys");
    }

    #[test]
    fn rejects_direct_calls_anywhere_in_the_tree() {
        let code = "def f(x):\n    return [eval(v) for v in x]\n";
        let violation = check_structure(code).unwrap_err();
        assert_eq!(violation.rule, SecurityRule::AstCall);
        assert_eq!(violation.token, "eval");

        let code = "if True:\n    data = open('f').read()\n";
        assert_eq!(check_structure(code).unwrap_err().token, "open");
    }

    #[test]
    fn attribute_calls_are_not_direct_calls() {
        // Only bare-name calls count for the structural layer.
        assert!(check_structure("import numpy as np\nnp.load('x')\n").is_ok());
    }

    #[test]
    fn future_imports_are_refused() {
        for code in [
            "from __future__ import annotations\nx: int = 1\n",
            "import numpy as np\nfrom __future__ import division\n",
        ] {
            let violation = check_structure(code).unwrap_err();
            assert_eq!(violation.rule, SecurityRule::Syntax);
            assert!(violation.message.contains("__future__"));
        }
        // Only the compiler directive is affected.
        assert!(check_structure("import numpy as np\nfuture = 1\n").is_ok());
    }

    #[test]
    fn syntax_errors_are_reported() {
        let violation = check_structure("def broken(:\n    pass\n").unwrap_err();
        assert_eq!(violation.rule, SecurityRule::Syntax);
        assert!(violation.message.starts_with("Syntax error"));
    }

    #[test]
    fn clustering_snippet_passes() {
        let code = r#"
import numpy as np
from sklearn.cluster import KMeans
from scipy.cluster.hierarchy import linkage

X = np.random.RandomState(42).rand(30, 2)
model = KMeans(n_clusters=2, n_init=10, random_state=0).fit(X)
Z = linkage(X, "ward")
print(model.labels_.tolist())
"#;
        assert!(check_structure(code).is_ok());
    }
}
