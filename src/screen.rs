/// Static pre-execution screen for submitted solver code.
///
/// The isolation layer is the real boundary; this screen exists to turn
/// the obvious escape and egress attempts into an auditable security
/// classification instead of an opaque in-sandbox failure. A hit fails
/// the submission before a sandbox slot is spent on it.

const BLOCKED_IMPORTS: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "pathlib",
    "socket",
    "requests",
    "httpx",
    "ftplib",
    "smtplib",
    "ctypes",
    "pickle",
    "importlib",
    "multiprocessing",
    "threading",
    "signal",
    "resource",
];

const ESCAPE_PATTERNS: &[(&str, &str)] = &[
    ("__import__", "import machinery access"),
    ("__builtins__", "builtins table access"),
    ("__subclasses__", "class hierarchy walk"),
    ("__globals__", "globals table access"),
    ("eval(", "dynamic evaluation"),
    ("exec(", "dynamic execution"),
    ("compile(", "dynamic compilation"),
    ("open(", "direct file access"),
    ("../", "path traversal"),
    ("/etc/", "host filesystem probe"),
    ("/proc/", "host filesystem probe"),
    ("/sys/", "host filesystem probe"),
    ("/dev/", "host filesystem probe"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub reason: String,
}

/// Scan `code` for sandbox-escape or egress constructs. Returns the
/// first violation found, or `None` when the code is clean.
pub fn screen(code: &str) -> Option<Violation> {
    for line in code.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        if let Some(module) = imported_module(line) {
            if BLOCKED_IMPORTS.contains(&module) {
                return Some(Violation {
                    reason: format!("blocked import of '{module}'"),
                });
            }
        }
        for (needle, label) in ESCAPE_PATTERNS {
            if line.contains(needle) {
                return Some(Violation {
                    reason: format!("{label} ({needle})"),
                });
            }
        }
    }
    None
}

/// Root module of an `import x` / `from x import y` line, if any.
fn imported_module(line: &str) -> Option<&str> {
    let rest = line
        .strip_prefix("import ")
        .or_else(|| line.strip_prefix("from "))?;
    let module = rest.split_whitespace().next()?;
    Some(module.split('.').next().unwrap_or(module))
}
