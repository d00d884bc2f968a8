//! Generation of the Python harness that wraps a submission.
//!
//! The harness is assembled from three fixed sections around the user code:
//!
//! - a preamble that points matplotlib at the writable tmpfs, imports the
//!   clustering library set and opens a `try` with stdout/stderr redirected
//!   into in-memory buffers;
//! - the user code, indented by [`BODY_INDENT`] on every line;
//! - an epilogue that exports every open figure as base64 PNG and prints the
//!   result envelope between [`ENVELOPE_BEGIN`] and [`ENVELOPE_END`].
//!
//! Indentation contract: line endings are normalized to `\n`, a leading BOM is
//! dropped, and every line of the submission (blank lines included) gets the
//! same prefix. The text is otherwise copied unchanged, which also means the
//! prefix lands inside multi-line string literals. A trailing `pass` keeps the
//! block valid when the submission holds only comments.

/// First line of the envelope block in the container output.
pub const ENVELOPE_BEGIN: &str = "@@CLUSTERLAB-ENVELOPE-BEGIN@@";
/// Last line of the envelope block in the container output.
pub const ENVELOPE_END: &str = "@@CLUSTERLAB-ENVELOPE-END@@";

/// Two levels: `try:` then `with redirect_stdout(...)`.
pub const BODY_INDENT: &str = "        ";

/// File name of the harness inside the workspace.
pub const HARNESS_FILE_NAME: &str = "main.py";

const PREAMBLE: &str = r#"import os
os.environ['MPLCONFIGDIR'] = '/tmp/matplotlib'
os.environ['TMPDIR'] = '/tmp'
os.makedirs('/tmp/matplotlib', exist_ok=True)

import base64
import io
import json
import tempfile
from contextlib import redirect_stderr, redirect_stdout

tempfile.tempdir = '/tmp'

import numpy as np
from sklearn.cluster import KMeans, DBSCAN
from sklearn.datasets import make_blobs, make_moons
from scipy.cluster.hierarchy import linkage, dendrogram, fcluster
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt

plt.show = lambda *args, **kwargs: None

_clusterlab_stdout = io.StringIO()
_clusterlab_stderr = io.StringIO()
_clusterlab_success = True
_clusterlab_error = ''

try:
    with redirect_stdout(_clusterlab_stdout), redirect_stderr(_clusterlab_stderr):
"#;

const EPILOGUE: &str = r#"except BaseException as _clusterlab_exc:
    _clusterlab_success = False
    _clusterlab_error = 'Execution error: %s: %s' % (type(_clusterlab_exc).__name__, _clusterlab_exc)

_clusterlab_images = []
try:
    for _clusterlab_index, _clusterlab_number in enumerate(plt.get_fignums()):
        _clusterlab_buffer = io.BytesIO()
        plt.figure(_clusterlab_number).savefig(_clusterlab_buffer, format='png', bbox_inches='tight')
        _clusterlab_images.append({
            'id': _clusterlab_index,
            'data': base64.b64encode(_clusterlab_buffer.getvalue()).decode('ascii'),
        })
        plt.close(_clusterlab_number)
except Exception as _clusterlab_exc:
    _clusterlab_success = False
    _clusterlab_error = 'Figure export error: %s' % (_clusterlab_exc,)

_clusterlab_result = {
    'output': _clusterlab_stdout.getvalue(),
    'error': _clusterlab_stderr.getvalue() if _clusterlab_success else _clusterlab_error,
    'images': _clusterlab_images,
    'success': _clusterlab_success,
}
"#;

/// Parameterized builder for the harness text.
#[derive(Debug, Clone, Default)]
pub struct HarnessTemplate {
    algorithm_hint: Option<String>,
}

impl HarnessTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded as a comment in the harness header; never changes behavior.
    pub fn with_algorithm_hint(mut self, hint: Option<&str>) -> Self {
        self.algorithm_hint = hint
            .map(sanitize_comment)
            .filter(|hint| !hint.is_empty());
        self
    }

    pub fn render(&self, code: &str) -> String {
        let body = indent_body(code);
        let mut harness = String::with_capacity(PREAMBLE.len() + body.len() + EPILOGUE.len() + 256);

        harness.push_str("# clusterlab sandbox harness (generated)\n");
        if let Some(hint) = &self.algorithm_hint {
            harness.push_str("# algorithm: ");
            harness.push_str(hint);
            harness.push('\n');
        }
        harness.push_str(PREAMBLE);
        harness.push_str(&body);
        harness.push_str(EPILOGUE);
        harness.push_str(&format!(
            "print('{}\\n' + json.dumps(_clusterlab_result) + '\\n{}', flush=True)\n",
            ENVELOPE_BEGIN, ENVELOPE_END
        ));
        harness
    }
}

/// Indents every line of `code` by [`BODY_INDENT`] and appends a `pass`.
pub fn indent_body(code: &str) -> String {
    let code = code.strip_prefix('\u{feff}').unwrap_or(code);
    let normalized = code.replace("\r\n", "\n").replace('\r', "\n");

    let mut body = String::with_capacity(normalized.len() + 64);
    for line in normalized.split('\n') {
        body.push_str(BODY_INDENT);
        body.push_str(line);
        body.push('\n');
    }
    body.push_str(BODY_INDENT);
    body.push_str("pass\n");
    body
}

fn sanitize_comment(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}
