//! Response resolution and serialization.
//!
//! [`Response::build`] resolves the request path against the document root
//! (missing files and directories become 404, files without world-read
//! permission 403) and picks the body: a memory-mapped file region for
//! static assets, a mapped error page for 4xx/5xx when the root provides
//! one, or a built-in fallback HTML body otherwise.
//!
//! [`Response::compose`] writes the status line and headers into the output
//! buffer; an inline body follows the headers in the buffer, while a mapped
//! file stays out-of-line as the second gathered-write segment.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use memmap2::Mmap;

use super::types::reason;
use crate::buffer::Buffer;

/// World-readable permission bit (`S_IROTH`).
const MODE_OTHER_READ: u32 = 0o4;

enum Body {
    File {
        map: Mmap,
        content_type: &'static str,
    },
    Inline {
        content: String,
        content_type: &'static str,
    },
}

/// A composed HTTP response: status, headers, and a two-segment body plan.
pub struct Response {
    status: u16,
    keep_alive: bool,
    body: Body,
}

impl Response {
    /// Resolves `req_path` under `root` and builds the response.
    ///
    /// `status` is the handler's verdict before file resolution: 200 lets
    /// the filesystem decide, anything else forces that error page.
    #[must_use]
    pub fn build(root: &Path, req_path: &str, keep_alive: bool, status: u16) -> Self {
        let mut status = status;
        let mut file_path = root.join(req_path.trim_start_matches('/'));

        if status == 200 {
            status = match std::fs::metadata(&file_path) {
                Err(_) => 404,
                Ok(meta) if meta.is_dir() => 404,
                Ok(meta) if meta.permissions().mode() & MODE_OTHER_READ == 0 => 403,
                Ok(_) => 200,
            };
        }

        if status != 200 {
            file_path = root.join(format!("{status}.html"));
        }

        let body = match map_file(&file_path) {
            Some(map) => Body::File {
                map,
                content_type: content_type_for(&file_path),
            },
            None if status == 200 => {
                // Mapping raced with file removal; degrade to 404.
                status = 404;
                fallback_body(404)
            }
            None => fallback_body(status),
        };

        Self {
            status,
            keep_alive,
            body,
        }
    }

    /// The response status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Serializes the status line, headers, and any inline body into `buf`.
    pub fn compose(&self, buf: &mut Buffer) {
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status)));
        if self.keep_alive {
            buf.append_str("Connection: keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("Connection: close\r\n");
        }

        match &self.body {
            Body::File { map, content_type } => {
                buf.append_str(&format!("Content-Type: {content_type}\r\n"));
                buf.append_str(&format!("Content-Length: {}\r\n\r\n", map.len()));
            }
            Body::Inline {
                content,
                content_type,
            } => {
                buf.append_str(&format!("Content-Type: {content_type}\r\n"));
                buf.append_str(&format!("Content-Length: {}\r\n\r\n", content.len()));
                buf.append_str(content);
            }
        }
    }

    /// The mapped file region, or an empty slice for inline bodies.
    #[must_use]
    pub fn file_segment(&self) -> &[u8] {
        match &self.body {
            Body::File { map, .. } => map,
            Body::Inline { .. } => &[],
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("keep_alive", &self.keep_alive)
            .field("file_bytes", &self.file_segment().len())
            .finish()
    }
}

/// Maps `path` read-only; `None` for unopenable or empty files.
#[allow(unsafe_code)]
fn map_file(path: &Path) -> Option<Mmap> {
    let file = File::open(path).ok()?;
    if file.metadata().ok()?.len() == 0 {
        return None;
    }
    // SAFETY: the file is opened read-only and served as immutable bytes.
    // Document-root assets are not truncated while the server runs.
    unsafe { Mmap::map(&file) }.ok()
}

fn fallback_body(status: u16) -> Body {
    Body::Inline {
        content: format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">\
             {status} : {}\n<p>{}</p><hr><em>hearth</em></body></html>",
            reason(status),
            reason(status),
        ),
        content_type: "text/html",
    }
}

/// MIME type from the file suffix.
fn content_type_for(path: &Path) -> &'static str {
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match suffix {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "txt" => "text/plain",
        "xml" => "text/xml",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mpeg" | "mpg" => "video/mpeg",
        "au" => "audio/basic",
        "pdf" => "application/pdf",
        "doc" | "word" => "application/msword",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        _ => "application/octet-stream",
    }
}
