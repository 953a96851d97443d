//! Absolute path helpers shared by the store, the proxies and the backends.
//!
//! Every key the cache persists is a cleaned absolute path: a leading `/`,
//! no trailing `/`, no empty, `.` or `..` segments.

use crate::error::{Error, Result};

/// Normalise `p` into the canonical `/a/b/c` form. `..` pops a segment but
/// never climbs above the root.
pub fn clean(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Like [`clean`] but rejects paths that name the root, which can never be
/// a file.
pub fn clean_file(p: &str) -> Result<String> {
    let path = clean(p);
    if path == "/" {
        return Err(Error::InvalidPath(p.to_string()));
    }
    Ok(path)
}

/// Split a cleaned path into `(parent, name)`. The root splits into `("/", "")`.
pub fn split(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".into(), path[1..].into()),
        Some(n) => (path[..n].into(), path[n + 1..].into()),
        None => ("/".into(), path.into()),
    }
}

pub fn parent(path: &str) -> String {
    split(path).0
}

pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" || dir.is_empty() {
        clean(&format!("/{name}"))
    } else {
        clean(&format!("{dir}/{name}"))
    }
}

/// Whether `path` lies strictly below `dir`.
pub fn is_descendant(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path != "/";
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}
