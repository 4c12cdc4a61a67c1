// Purpose: Registry protocol client: list version labels and download module archives.
// Inputs/Outputs: `@v/list` and `@v/<version>.zip` over HTTP or file:// directory bases.
// Invariants: Archive extraction never writes outside the destination directory.
// Gotchas: Archives may nest content under a single root directory; strip it.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

use crate::cache::ensure_dir;
use crate::error::{Error, FetchError, Result};

/// Where a module's versions live. `file://` bases serve tests and
/// air-gapped mirrors with the same layout as an HTTP registry.
#[derive(Debug, Clone)]
pub enum Source {
    Dir(PathBuf),
    Http(String),
}

/// Default registry base when no `[[source]]` entry applies: the module's
/// host. Requests append the full module identity, so the base must not
/// already contain it.
pub fn default_source_url(module: &str) -> String {
    let host = module
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(module);
    format!("https://{}", host)
}

fn http_url(base: &str, rel: &str) -> String {
    format!("{}/{}", base, rel)
}

pub fn parse_source(url: &str) -> Source {
    if let Some(path) = file_url_to_path(url) {
        return Source::Dir(path);
    }
    Source::Http(url.trim_end_matches('/').to_string())
}

fn file_url_to_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    #[cfg(windows)]
    {
        if rest.len() >= 3 && rest.starts_with('/') && rest.as_bytes()[2] == b':' {
            return Some(PathBuf::from(&rest[1..]));
        }
    }
    Some(PathBuf::from(rest))
}

fn read_text(source: &Source, rel: &str) -> std::result::Result<String, FetchError> {
    match source {
        Source::Dir(base) => {
            let p = base.join(rel);
            fs::read_to_string(&p).map_err(|e| FetchError::Read { path: p, source: e })
        }
        Source::Http(base) => {
            let url = http_url(base, rel);
            let resp = ureq::get(&url).call().map_err(|e| FetchError::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;
            let mut body = String::new();
            resp.into_reader()
                .read_to_string(&mut body)
                .map_err(|e| FetchError::Http {
                    url,
                    message: e.to_string(),
                })?;
            Ok(body)
        }
    }
}

fn read_bytes(source: &Source, rel: &str) -> std::result::Result<Vec<u8>, FetchError> {
    match source {
        Source::Dir(base) => {
            let p = base.join(rel);
            fs::read(&p).map_err(|e| FetchError::Read { path: p, source: e })
        }
        Source::Http(base) => {
            let url = http_url(base, rel);
            let resp = ureq::get(&url).call().map_err(|e| FetchError::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;
            let mut buf = Vec::new();
            resp.into_reader()
                .read_to_end(&mut buf)
                .map_err(|e| FetchError::Http {
                    url,
                    message: e.to_string(),
                })?;
            Ok(buf)
        }
    }
}

pub fn list_versions(source: &Source, module: &str) -> std::result::Result<Vec<String>, FetchError> {
    let rel = format!("{}/@v/list", module);
    let list = read_text(source, &rel)?;
    let out: Vec<String> = list
        .lines()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if out.is_empty() {
        return Err(FetchError::NoVersions {
            module: module.to_string(),
        });
    }
    Ok(out)
}

pub fn download(
    source: &Source,
    module: &str,
    version: &str,
) -> std::result::Result<Vec<u8>, FetchError> {
    let rel = format!("{}/@v/{}.zip", module, version);
    read_bytes(source, &rel)
}

fn safe_rel_path(p: &Path, module: &str, version: &str) -> std::result::Result<PathBuf, FetchError> {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(FetchError::BadArchive {
                    module: module.to_string(),
                    version: version.to_string(),
                    message: format!("unsafe path in archive entry: {}", p.display()),
                });
            }
        }
    }
    Ok(out)
}

/// Extract a module archive into `dst`, stripping a common leading directory
/// when every entry shares one (registries often pack `<module>@<version>/`).
pub fn unpack(bytes: &[u8], dst: &Path, module: &str, version: &str) -> Result<()> {
    let bad = |message: String| {
        Error::from(FetchError::BadArchive {
            module: module.to_string(),
            version: version.to_string(),
            message,
        })
    };

    ensure_dir(dst)?;
    let cursor = Cursor::new(bytes.to_vec());
    let mut zip = ZipArchive::new(cursor).map_err(|e| bad(format!("invalid zip: {}", e)))?;

    let mut common_prefix: Option<Vec<std::ffi::OsString>> = None;
    let mut max_depth = 0usize;
    for i in 0..zip.len() {
        let f = zip.by_index(i).map_err(|e| bad(e.to_string()))?;
        let name = f.name().to_string();
        if name.is_empty() {
            continue;
        }
        let rel = safe_rel_path(Path::new(&name), module, version)?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let comps: Vec<std::ffi::OsString> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(seg) => Some(seg.to_os_string()),
                _ => None,
            })
            .collect();
        if comps.is_empty() {
            continue;
        }
        max_depth = max_depth.max(comps.len());

        match &mut common_prefix {
            None => common_prefix = Some(comps),
            Some(prefix) => {
                let mut keep = 0usize;
                while keep < prefix.len() && keep < comps.len() && prefix[keep] == comps[keep] {
                    keep += 1;
                }
                prefix.truncate(keep);
            }
        }
    }
    let root_prefix = common_prefix.and_then(|parts| {
        if parts.is_empty() || max_depth <= parts.len() {
            return None;
        }
        let mut p = PathBuf::new();
        for seg in parts {
            p.push(seg);
        }
        Some(p)
    });

    for i in 0..zip.len() {
        let mut f = zip.by_index(i).map_err(|e| bad(e.to_string()))?;
        let name = f.name().to_string();
        if name.is_empty() {
            continue;
        }
        let mut rel = safe_rel_path(Path::new(&name), module, version)?;
        if let Some(root) = root_prefix.as_ref()
            && let Ok(stripped) = rel.strip_prefix(root)
        {
            rel = stripped.to_path_buf();
        }
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if f.is_dir() {
            ensure_dir(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        let mut w = fs::File::create(&out)
            .map_err(|e| Error::io(format!("create {}", out.display()), e))?;
        std::io::copy(&mut f, &mut w)
            .map_err(|e| Error::io(format!("write {}", out.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::SimpleFileOptions;

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("modkit-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::<u8>::new()));
        let opts = SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(name.to_string(), opts).expect("start file");
            zip.write_all(body.as_bytes()).expect("write file");
        }
        zip.finish().expect("finish zip").into_inner()
    }

    #[test]
    fn default_source_is_the_module_host() {
        assert_eq!(
            default_source_url("example.com/acme/greeter"),
            "https://example.com"
        );
    }

    #[test]
    fn http_requests_carry_the_module_path_once() {
        let base = default_source_url("example.com/acme/greeter");
        let url = http_url(&base, "example.com/acme/greeter/@v/list");
        assert_eq!(url, "https://example.com/example.com/acme/greeter/@v/list");
    }

    #[test]
    fn file_source_lists_versions() {
        let base = temp_dir("registry-list");
        let module = "example.com/acme/greeter";
        let vdir = base.join(module).join("@v");
        fs::create_dir_all(&vdir).expect("create registry dir");
        fs::write(vdir.join("list"), "v1.0.0\nv1.2.0\n\n").expect("write list");

        let src = parse_source(&format!("file://{}", base.to_string_lossy()));
        let versions = list_versions(&src, module).expect("list");
        assert_eq!(versions, vec!["v1.0.0", "v1.2.0"]);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn empty_list_is_an_error() {
        let base = temp_dir("registry-empty");
        let module = "example.com/acme/greeter";
        let vdir = base.join(module).join("@v");
        fs::create_dir_all(&vdir).expect("create registry dir");
        fs::write(vdir.join("list"), "\n").expect("write list");

        let src = parse_source(&format!("file://{}", base.to_string_lossy()));
        let err = list_versions(&src, module).expect_err("no versions");
        assert!(matches!(err, FetchError::NoVersions { .. }));

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn unpack_strips_common_prefix() {
        let dst = temp_dir("registry-unpack");
        let bytes = zip_of(&[
            ("lib@v1.0.0/modkit.toml", "module = \"example.com/acme/lib\"\n"),
            ("lib@v1.0.0/src/p.mx", "package lib\n"),
        ]);
        unpack(&bytes, &dst, "example.com/acme/lib", "v1.0.0").expect("unpack");
        assert!(dst.join("modkit.toml").exists());
        assert!(dst.join("src").join("p.mx").exists());

        let _ = fs::remove_dir_all(dst);
    }

    #[test]
    fn unpack_keeps_flat_archives_flat() {
        let dst = temp_dir("registry-unpack-flat");
        let bytes = zip_of(&[("modkit.toml", "module = \"example.com/acme/lib\"\n")]);
        unpack(&bytes, &dst, "example.com/acme/lib", "v1.0.0").expect("unpack");
        assert!(dst.join("modkit.toml").exists());

        let _ = fs::remove_dir_all(dst);
    }

    #[test]
    fn unpack_rejects_escaping_paths() {
        let dst = temp_dir("registry-unpack-escape");
        let bytes = zip_of(&[("../evil.txt", "nope")]);
        let err = unpack(&bytes, &dst, "example.com/acme/lib", "v1.0.0").expect_err("escape");
        assert_eq!(err.kind(), "fetch");

        let _ = fs::remove_dir_all(dst);
    }
}
