//! Stateless request construction and path handling
//!
//! Paths are kept in the agent's own dialect: POSIX (`/usr/bin`) or Windows
//! drive-letter (`C:\Users`). The dialect is detected from the string itself
//! and separators are never mixed within one path.

use base64::Engine as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{OperationError, Result};
use crate::message::{DownloadSub, HashTag, Request};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique request id: `req-<unix ms>-<counter>`
pub fn generate_request_id() -> String {
    generate_prefixed_id("req")
}

/// Same scheme with a caller-chosen prefix (`upload`, `download`)
pub fn generate_prefixed_id(prefix: &str) -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}-{}-{}", prefix, chrono::Utc::now().timestamp_millis(), n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDialect {
    Posix,
    Windows,
}

impl PathDialect {
    pub fn separator(self) -> char {
        match self {
            PathDialect::Posix => '/',
            PathDialect::Windows => '\\',
        }
    }
}

fn starts_with_drive(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

fn is_bare_drive(path: &str) -> bool {
    path.len() == 2 && starts_with_drive(path)
}

pub fn detect_dialect(path: &str) -> PathDialect {
    let has_back = path.contains('\\');
    let has_fwd = path.contains('/');
    if has_back && !has_fwd {
        PathDialect::Windows
    } else if has_fwd {
        PathDialect::Posix
    } else if starts_with_drive(path) {
        PathDialect::Windows
    } else {
        PathDialect::Posix
    }
}

/// Append one segment to `base` using `base`'s separator
pub fn join_path(base: &str, segment: &str) -> String {
    let segment = segment.trim_start_matches(['/', '\\']);

    match base {
        "" => {
            if starts_with_drive(segment) && !segment.ends_with('\\') {
                format!("{}\\", segment)
            } else {
                segment.to_string()
            }
        }
        "/" => format!("/{}", segment),
        "\\" => format!("\\{}", segment),
        _ => {
            let sep = detect_dialect(base).separator();
            if base.ends_with(sep) {
                format!("{}{}", base, segment)
            } else {
                format!("{}{}{}", base, sep, segment)
            }
        }
    }
}

/// Parent directory; the parent of a bare drive is the drive list (`\`)
pub fn parent_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    if path == "/" || path == "\\" {
        return path.to_string();
    }

    if detect_dialect(path) == PathDialect::Windows {
        let trimmed = path.trim_end_matches('\\');
        if is_bare_drive(trimmed) {
            return "\\".to_string();
        }
        let mut parts: Vec<&str> = trimmed.split('\\').filter(|p| !p.is_empty()).collect();
        parts.pop();
        return match parts.split_first() {
            None => "\\".to_string(),
            Some((first, rest)) if is_bare_drive(first) => {
                if rest.is_empty() {
                    format!("{}\\", first)
                } else {
                    format!("{}\\{}", first, rest.join("\\"))
                }
            }
            Some(_) => format!("\\{}", parts.join("\\")),
        };
    }

    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Non-empty segments of a path in its own dialect
pub fn parse_path(path: &str) -> Vec<String> {
    let sep = detect_dialect(path).separator();
    path.split(sep)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Canonical form sent in `ls`: root is `""`, drive paths use backslashes
pub fn normalize_requested_path(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return String::new();
    }

    // "/C:" or "/C:/x" as produced by POSIX-style breadcrumbs
    let unprefixed = path.strip_prefix('/').filter(|rest| starts_with_drive(rest));
    let candidate = unprefixed.unwrap_or(path);

    if starts_with_drive(candidate) {
        let (drive, remainder) = candidate.split_at(2);
        if remainder.is_empty() {
            return format!("{}\\", drive);
        }
        if remainder.starts_with('/') {
            let rest = remainder.replace('/', "\\");
            return format!("{}\\{}", drive, rest.trim_start_matches('\\'));
        }
        if remainder.starts_with('\\') && unprefixed.is_none() {
            return candidate.replace('/', "\\");
        }
    }
    path.to_string()
}

/// Strip characters illegal on common filesystems
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '\u{0}'..='\u{1f}'))
        .collect()
}

/// Reject any `.` or `..` segment under either separator
pub fn validate_path(path: &str) -> Result<()> {
    if path
        .split(['/', '\\'])
        .any(|segment| segment == "." || segment == "..")
    {
        return Err(OperationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Sanitize a user-supplied name; empty or traversal results are rejected
pub fn validated_name(name: &str) -> Result<String> {
    let clean = sanitize_name(name);
    if clean.is_empty() || clean == "." || clean == ".." {
        return Err(OperationError::InvalidName(name.to_string()));
    }
    Ok(clean)
}

fn validate_items(items: &[String]) -> Result<()> {
    for item in items {
        if item.is_empty() {
            return Err(OperationError::InvalidName(item.clone()));
        }
        validate_path(item)?;
    }
    Ok(())
}

pub fn list_directory(path: &str) -> Result<Request> {
    validate_path(path)?;
    Ok(Request::Ls {
        reqid: generate_request_id(),
        path: path.to_string(),
    })
}

pub fn make_dir(path: &str, folder_name: &str) -> Result<Request> {
    validate_path(path)?;
    let name = validated_name(folder_name)?;
    Ok(Request::Mkdir {
        reqid: generate_request_id(),
        path: join_path(path, &name),
    })
}

pub fn rename(path: &str, old_name: &str, new_name: &str) -> Result<Request> {
    validate_path(path)?;
    validate_items(&[old_name.to_string()])?;
    let newname = validated_name(new_name)?;
    Ok(Request::Rename {
        reqid: generate_request_id(),
        path: path.to_string(),
        oldname: old_name.to_string(),
        newname,
    })
}

pub fn delete(path: &str, items: &[String], recursive: bool) -> Result<Request> {
    validate_path(path)?;
    validate_items(items)?;
    Ok(Request::Rm {
        reqid: generate_request_id(),
        path: path.to_string(),
        delfiles: items.to_vec(),
        rec: recursive,
    })
}

pub fn copy(source: &str, destination: &str, names: &[String]) -> Result<Request> {
    validate_path(source)?;
    validate_path(destination)?;
    validate_items(names)?;
    Ok(Request::Copy {
        reqid: generate_request_id(),
        scpath: source.to_string(),
        dspath: destination.to_string(),
        names: names.to_vec(),
    })
}

pub fn move_items(source: &str, destination: &str, names: &[String]) -> Result<Request> {
    validate_path(source)?;
    validate_path(destination)?;
    validate_items(names)?;
    Ok(Request::Move {
        reqid: generate_request_id(),
        scpath: source.to_string(),
        dspath: destination.to_string(),
        names: names.to_vec(),
    })
}

pub fn zip(path: &str, files: &[String], zip_name: &str) -> Result<Request> {
    validate_path(path)?;
    validate_items(files)?;
    let zipname = validated_name(zip_name)?;
    Ok(Request::Zip {
        reqid: generate_request_id(),
        path: path.to_string(),
        files: files.to_vec(),
        zipname,
    })
}

pub fn unzip(path: &str, zip_file: &str) -> Result<Request> {
    validate_path(path)?;
    validate_items(&[zip_file.to_string()])?;
    Ok(Request::Unzip {
        reqid: generate_request_id(),
        path: path.to_string(),
        file: zip_file.to_string(),
    })
}

pub fn search(path: &str, filter: &str) -> Result<Request> {
    validate_path(path)?;
    Ok(Request::FindFile {
        reqid: generate_request_id(),
        path: path.to_string(),
        filter: filter.to_string(),
    })
}

pub fn get_file(path: &str, file_name: &str) -> Result<Request> {
    validate_path(path)?;
    validate_items(&[file_name.to_string()])?;
    Ok(Request::Get {
        reqid: generate_request_id(),
        path: path.to_string(),
        file: file_name.to_string(),
    })
}

/// `set` carries the new content base64-encoded
pub fn set_file(path: &str, file_name: &str, content: &[u8]) -> Result<Request> {
    validate_path(path)?;
    validate_items(&[file_name.to_string()])?;
    Ok(Request::Set {
        reqid: generate_request_id(),
        path: path.to_string(),
        file: file_name.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(content),
    })
}

/// Decode the base64 `data` of a `get` response
pub fn decode_file_content(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| OperationError::Server(format!("invalid file content: {}", e)))
}

pub fn upload(id: &str, path: &str, name: &str, size: u64, append: bool) -> Result<Request> {
    validate_path(path)?;
    Ok(Request::Upload {
        reqid: id.to_string(),
        path: path.to_string(),
        name: name.to_string(),
        size,
        append,
    })
}

pub fn upload_hash(id: &str, path: &str, name: &str, hash: &str, size: u64) -> Result<Request> {
    validate_path(path)?;
    Ok(Request::UploadHash {
        reqid: id.to_string(),
        path: path.to_string(),
        name: name.to_string(),
        tag: HashTag {
            hash: hash.to_string(),
            size,
            skip: true,
        },
    })
}

pub fn upload_done(id: &str) -> Request {
    Request::UploadDone {
        reqid: id.to_string(),
    }
}

pub fn download(sub: DownloadSub, id: &str, path: &str) -> Result<Request> {
    validate_path(path)?;
    Ok(Request::Download {
        sub,
        id: id.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("req-"));
        assert!(generate_prefixed_id("upload").starts_with("upload-"));
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/a/b/c").is_ok());
        assert!(validate_path("").is_ok());
        assert!(validate_path("C:\\Users\\bob").is_ok());
        assert!(validate_path("/a/.hidden").is_ok());
        assert_eq!(
            validate_path("/a/../b"),
            Err(OperationError::InvalidPath("/a/../b".into()))
        );
        assert!(validate_path("a/./b").is_err());
        assert!(validate_path("C:\\a\\..\\b").is_err());
        assert!(validate_path("..").is_err());
    }

    #[test]
    fn test_detect_dialect() {
        assert_eq!(detect_dialect("/usr"), PathDialect::Posix);
        assert_eq!(detect_dialect("C:\\x"), PathDialect::Windows);
        assert_eq!(detect_dialect("D:"), PathDialect::Windows);
        assert_eq!(detect_dialect("plain"), PathDialect::Posix);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "C:"), "C:\\");
        assert_eq!(join_path("", "home"), "home");
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("/usr", "/bin"), "/usr/bin");
        assert_eq!(join_path("/usr/", "bin"), "/usr/bin");
        assert_eq!(join_path("C:\\", "Users"), "C:\\Users");
        assert_eq!(join_path("C:\\Users", "bob"), "C:\\Users\\bob");
        assert_eq!(join_path("\\", "x"), "\\x");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path(""), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/a/b/"), "/a");
        assert_eq!(parent_path("C:\\"), "\\");
        assert_eq!(parent_path("C:\\Users"), "C:\\");
        assert_eq!(parent_path("C:\\Users\\bob"), "C:\\Users");
        assert_eq!(parent_path("\\share\\x"), "\\share");
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("/a//b/"), vec!["a", "b"]);
        assert_eq!(parse_path("C:\\Users\\bob"), vec!["C:", "Users", "bob"]);
        assert!(parse_path("").is_empty());
    }

    #[test]
    fn test_normalize_requested_path() {
        assert_eq!(normalize_requested_path(""), "");
        assert_eq!(normalize_requested_path("/"), "");
        assert_eq!(normalize_requested_path("/C:"), "C:\\");
        assert_eq!(normalize_requested_path("/C:/Users/bob"), "C:\\Users\\bob");
        assert_eq!(normalize_requested_path("C:"), "C:\\");
        assert_eq!(normalize_requested_path("C:/x"), "C:\\x");
        assert_eq!(normalize_requested_path("C:\\a/b"), "C:\\a\\b");
        assert_eq!(normalize_requested_path("/home/bob"), "/home/bob");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("a<b>:c\"d/e\\f|g?h*i"), "abcdefghi");
        assert_eq!(sanitize_name("tab\there\u{1}"), "tabhere");
        assert_eq!(sanitize_name("ok name.txt"), "ok name.txt");
        assert!(validated_name("???").is_err());
        assert!(validated_name("..").is_err());
    }

    #[test]
    fn test_builders_validate_before_serializing() {
        assert!(list_directory("/a/../etc").is_err());
        assert!(copy("/a", "/b/..", &["x".into()]).is_err());
        assert!(delete("/a", &["..".into()], true).is_err());
        assert!(make_dir("/a", "<>").is_err());

        let Request::Mkdir { path, .. } = make_dir("C:\\Users", "new*dir").unwrap() else {
            panic!("expected mkdir");
        };
        assert_eq!(path, "C:\\Users\\newdir");

        let Request::Set { data, .. } = set_file("/etc", "motd", b"hello").unwrap() else {
            panic!("expected set");
        };
        assert_eq!(data, "aGVsbG8=");
        assert_eq!(decode_file_content(&data).unwrap(), b"hello");
        assert!(decode_file_content("***").is_err());
    }
}
