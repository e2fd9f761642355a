//! Line-level Python source scanning. This is a deliberately shallow
//! collaborator: it extracts imported modules, attribute accesses and
//! top-level definitions without building a syntax tree, and accepts
//! both Python 2 and Python 3 sources.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PythonAnalysis {
    pub imports: Vec<String>,
    pub attributes: Vec<String>,
    pub function_defs: Vec<String>,
    pub class_defs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PythonErrorInfo {
    pub line: Option<u32>,
    pub message: String,
}

/// Pipeline heuristic: a `.py` path, or an executable starting with a
/// python shebang.
pub fn looks_like_python(name: &str, data: &[u8]) -> bool {
    if name.ends_with(".py") {
        return true;
    }
    let first_line = data.split(|&b| b == b'\n').next().unwrap_or(b"");
    first_line.starts_with(b"#!")
        && String::from_utf8_lossy(first_line).contains("python")
}

fn regexes() -> &'static (Regex, Regex, Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"^\s*import\s+(.+)$").unwrap(),
            Regex::new(r"^\s*from\s+([\w.]+)\s+import\b").unwrap(),
            Regex::new(r"^\s*def\s+([A-Za-z_]\w*)").unwrap(),
            Regex::new(r"^\s*class\s+([A-Za-z_]\w*)").unwrap(),
            Regex::new(r"\.([A-Za-z_]\w*)").unwrap(),
        )
    })
}

pub fn analyze(data: &[u8]) -> Result<PythonAnalysis, PythonErrorInfo> {
    if data.contains(&0) {
        return Err(PythonErrorInfo {
            line: None,
            message: "source contains NUL bytes".to_string(),
        });
    }
    let text = String::from_utf8_lossy(data);
    let (re_import, re_from, re_def, re_class, re_attr) = regexes();

    let mut imports = BTreeSet::new();
    let mut attributes = BTreeSet::new();
    let mut function_defs = Vec::new();
    let mut class_defs = Vec::new();

    for line in text.lines() {
        let code = match line.split_once('#') {
            Some((code, _)) => code,
            None => line,
        };
        if let Some(caps) = re_from.captures(code) {
            imports.insert(caps[1].to_string());
        } else if let Some(caps) = re_import.captures(code) {
            for part in caps[1].split(',') {
                let module = part
                    .trim()
                    .split_whitespace()
                    .next()
                    .unwrap_or_default();
                if !module.is_empty()
                    && module
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                {
                    imports.insert(module.to_string());
                }
            }
        }
        if let Some(caps) = re_def.captures(code) {
            function_defs.push(caps[1].to_string());
        }
        if let Some(caps) = re_class.captures(code) {
            class_defs.push(caps[1].to_string());
        }
        for caps in re_attr.captures_iter(code) {
            attributes.insert(caps[1].to_string());
        }
    }

    Ok(PythonAnalysis {
        imports: imports.into_iter().collect(),
        attributes: attributes.into_iter().collect(),
        function_defs,
        class_defs,
    })
}
