use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const SOURCE_EXT: &str = "mx";

pub fn scan_imports_in_text(src: &str) -> BTreeSet<String> {
    let re = Regex::new(r#"(?m)^\s*import\s+"([^"]+)""#).unwrap();
    re.captures_iter(src)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

pub fn scan_package_name(src: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^\s*package\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    re.captures(src)
        .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
}

pub fn scan_file(p: &Path) -> Result<(Option<String>, BTreeSet<String>)> {
    let s = fs::read_to_string(p).map_err(|e| Error::io(format!("read {}", p.display()), e))?;
    Ok((scan_package_name(&s), scan_imports_in_text(&s)))
}
