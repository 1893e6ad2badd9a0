//! The `https` arc locator: streaming download into a temp file with an
//! early content-length reject and a hard running-byte cap, followed by
//! the shared validation pipeline.

use std::io::{Read, Write};

use log::{debug, warn};

use super::local::validate_and_open;
use super::{ArcLocator, ArcOpenOptions, ArcOpenResult, ArcUri};

/// Download buffer size.
const CHUNK: usize = 64 * 1024;

/// Locator for `arc://https/...`. The URI path is the host-and-path part
/// of the HTTPS URL.
pub struct HttpArcLocator {
    client: reqwest::blocking::Client,
}

impl HttpArcLocator {
    /// Locator with a default client.
    pub fn new() -> Self {
        HttpArcLocator {
            client: reqwest::blocking::Client::builder()
                .build()
                .expect("http client construction cannot fail with default tls"),
        }
    }
}

impl Default for HttpArcLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArcLocator for HttpArcLocator {
    fn authority(&self) -> &str {
        "https"
    }

    fn open(&self, uri: &ArcUri, options: &ArcOpenOptions) -> ArcOpenResult {
        let url = transform_cloud_url(&format!("https://{}", uri.path));
        debug!("fetching arc from {}", url);

        let response = match self
            .client
            .get(&url)
            .timeout(options.http_timeout)
            .send()
        {
            Ok(r) => r,
            Err(e) => {
                return ArcOpenResult::Unreachable {
                    message: format!("GET {} failed: {}", url, e),
                }
            }
        };
        if !response.status().is_success() {
            return ArcOpenResult::Unreachable {
                message: format!("GET {} returned {}", url, response.status()),
            };
        }

        // Early reject on the declared length, before any body bytes.
        if let Some(declared) = response.content_length() {
            if declared > options.max_file_size_bytes {
                return ArcOpenResult::Untrusted {
                    message: format!(
                        "declared content length {} exceeds the {} byte cap",
                        declared, options.max_file_size_bytes
                    ),
                };
            }
        }

        // Stream the body under the running cap.
        let mut download = match tempfile::NamedTempFile::new() {
            Ok(f) => f,
            Err(e) => {
                return ArcOpenResult::Unreachable {
                    message: format!("cannot create download file: {}", e),
                }
            }
        };
        let mut reader = response;
        let mut buf = [0u8; CHUNK];
        let mut total: u64 = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    return ArcOpenResult::Unreachable {
                        message: format!("download from {} failed: {}", url, e),
                    }
                }
            };
            total += n as u64;
            if total > options.max_file_size_bytes {
                warn!("download from {} exceeded the size cap mid-stream", url);
                return ArcOpenResult::Untrusted {
                    message: format!(
                        "download exceeded the {} byte cap",
                        options.max_file_size_bytes
                    ),
                };
            }
            if let Err(e) = download.write_all(&buf[..n]) {
                return ArcOpenResult::Unreachable {
                    message: format!("cannot spool download: {}", e),
                };
            }
        }
        if let Err(e) = download.flush() {
            return ArcOpenResult::Unreachable {
                message: format!("cannot spool download: {}", e),
            };
        }
        debug!("downloaded {} bytes from {}", total, url);

        let path = download.path().to_path_buf();
        validate_and_open(&path, uri, options, Some(download))
    }
}

/// Best-effort rewrites that turn share links of common hosts into direct
/// downloads. Unknown hosts pass through unchanged.
pub fn transform_cloud_url(url: &str) -> String {
    // Dropbox share links: force the direct-download flag.
    if url.contains("dropbox.com") && url.contains("?dl=0") {
        return url.replace("?dl=0", "?dl=1");
    }
    // Google Drive viewer links: /file/d/<id>/view -> uc?export=download.
    if url.contains("drive.google.com") {
        if let Some(start) = url.find("/file/d/") {
            let id_start = start + "/file/d/".len();
            let tail = &url[id_start..];
            let id_end = tail.find('/').unwrap_or(tail.len());
            let id = &tail[..id_end];
            if !id.is_empty() {
                return format!("https://drive.google.com/uc?export=download&id={}", id);
            }
        }
    }
    url.to_string()
}

// ============================================================================
// Tests
// ============================================================================
