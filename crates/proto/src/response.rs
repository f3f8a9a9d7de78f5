use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const SUFFIX_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xml", "text/xml"),
    ("txt", "text/plain"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("ico", "image/x-icon"),
    ("avi", "video/x-msvideo"),
    ("mp4", "video/mp4"),
    ("mp3", "audio/mpeg"),
    ("pdf", "application/pdf"),
    ("gz", "application/x-gzip"),
    ("tar", "application/x-tar"),
];

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// A fully staged response: status head and body, ready for vectored writes.
pub struct Response {
    pub status: u16,
    pub head: Vec<u8>,
    pub body: Vec<u8>,
}

impl Response {
    /// Resolve `req_path` against the document root and stage either the file
    /// or the matching error page.
    pub fn build(root: &Path, req_path: &str, keep_alive: bool) -> Self {
        match resolve(root, req_path) {
            Ok((body, mime)) => Self::assemble(200, mime, body, keep_alive),
            Err(status) => Self::error(status, keep_alive),
        }
    }

    pub fn error(status: u16, keep_alive: bool) -> Self {
        Self::assemble(status, "text/html", error_page(status), keep_alive)
    }

    fn assemble(status: u16, mime: &str, body: Vec<u8>, keep_alive: bool) -> Self {
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason(status));
        if keep_alive {
            head.push_str("Connection: keep-alive\r\n");
            head.push_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            head.push_str("Connection: close\r\n");
        }
        head.push_str(&format!("Content-Type: {mime}\r\n"));
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        Self {
            status,
            head: head.into_bytes(),
            body,
        }
    }
}

fn resolve(root: &Path, req_path: &str) -> Result<(Vec<u8>, &'static str), u16> {
    // the query string plays no part in file lookup
    let path = req_path.split('?').next().unwrap_or(req_path);

    if !path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(403);
    }
    let rel = if path == "/" { "/index.html" } else { path };
    let full = root.join(&rel[1..]);

    let meta = fs::metadata(&full).map_err(|_| 404u16)?;
    if meta.is_dir() {
        return Err(404);
    }
    if meta.permissions().mode() & 0o004 == 0 {
        return Err(403);
    }

    let body = fs::read(&full).map_err(|_| 403u16)?;
    Ok((body, mime_for(&full)))
}

fn mime_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return "text/plain";
    };
    SUFFIX_TYPES
        .iter()
        .find(|(suffix, _)| ext.eq_ignore_ascii_case(suffix))
        .map(|&(_, mime)| mime)
        .unwrap_or("text/plain")
}

fn error_page(status: u16) -> Vec<u8> {
    format!(
        "<html><head><title>{status} {reason}</title></head>\
         <body><h1>{status} {reason}</h1><hr></body></html>",
        reason = reason(status),
    )
    .into_bytes()
}
