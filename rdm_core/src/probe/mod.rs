//! `FileInfoProbe` (spec component C8, §4.5): resolves a URL to file
//! metadata before a download starts. Filename extraction is adapted from
//! the segment-level prober this engine's worker descends from.

use std::path::Path;

use reqwest::Client;

use crate::error::EngineError;
use crate::types::PROBE_TIMEOUT;

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub supports_pause: bool,
    pub file_name: String,
    pub content_length: u64,
}

pub struct FileInfoProbe;

impl FileInfoProbe {
    /// Issues a `HEAD` request with a 10-second timeout. Fails with
    /// `UnsupportedSource` when the response carries no `content-length`.
    pub async fn probe(client: &Client, url: &str) -> Result<FileInfo, EngineError> {
        let response = client
            .head(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        let supports_pause = response
            .headers()
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        let content_length = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(EngineError::UnsupportedSource)?;

        if content_length == 0 {
            return Err(EngineError::UnsupportedSource);
        }

        let content_type = response.headers().get("content-type").and_then(|v| v.to_str().ok());

        let file_name = response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(extract_filename)
            .unwrap_or_else(|| file_name_from_url(response.url().as_str()));
        let file_name = ensure_extension(file_name, content_type);

        Ok(FileInfo {
            supports_pause,
            file_name,
            content_length,
        })
    }
}

/// Appends an extension derived from `content_type` when `file_name` has
/// none of its own (adapted from `ensure_extension` in the multipart
/// download strategy this probe's ancestor fed filenames into).
fn ensure_extension(file_name: String, content_type: Option<&str>) -> String {
    if Path::new(&file_name).extension().is_some() {
        return file_name;
    }
    match ext_from_mime(content_type) {
        Some(ext) => format!("{file_name}.{ext}"),
        None => file_name,
    }
}

/// Maps a MIME type to a file extension for the common binary/media types a
/// download manager sees without a `Content-Disposition` filename.
fn ext_from_mime(content_type: Option<&str>) -> Option<String> {
    let mime = content_type?.split(';').next()?.trim().to_lowercase();

    let ext = match mime.as_str() {
        "video/mp4" | "video/x-m4v" => "mp4",
        "video/x-matroska" => "mkv",
        "video/webm" => "webm",
        "video/x-msvideo" => "avi",
        "video/quicktime" => "mov",
        "video/x-ms-wmv" => "wmv",
        "video/3gpp" => "3gp",
        "video/x-flv" => "flv",
        "video/mpeg" => "mpg",
        "audio/mpeg" => "mp3",
        "audio/flac" => "flac",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/aac" => "aac",
        "audio/x-m4a" | "audio/mp4" => "m4a",
        "audio/opus" => "opus",
        "application/zip" => "zip",
        "application/x-tar" => "tar",
        "application/gzip" | "application/x-gzip" => "gz",
        "application/x-bzip2" => "bz2",
        "application/x-7z-compressed" => "7z",
        "application/x-rar-compressed" | "application/vnd.rar" => "rar",
        "application/pdf" => "pdf",
        "application/x-msdownload" => "exe",
        "application/x-ms-installer" | "application/x-msi" => "msi",
        "application/vnd.debian.binary-package" => "deb",
        "application/x-rpm" => "rpm",
        "application/x-apple-diskimage" => "dmg",
        _ => return None,
    };
    Some(ext.to_string())
}

/// Last path segment of the URL, minus any query string, percent-decoded.
fn file_name_from_url(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    let last_segment = without_query.rsplit('/').next().unwrap_or("download");
    let decoded = percent_decode(last_segment);
    if decoded.is_empty() {
        "download".to_string()
    } else {
        decoded
    }
}

/// Extract the filename from a `Content-Disposition` header value. Handles
/// both the plain `filename=` form and the RFC 5987 `filename*=` extended
/// form (e.g. `filename*=UTF-8''My%20File.mp4`); the RFC 5987 form takes
/// priority when both are present.
fn extract_filename(disposition: &str) -> Option<String> {
    extract_filename_star(disposition).or_else(|| extract_filename_plain(disposition))
}

fn extract_filename_star(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let key = "filename*=";
    let idx = lower.find(key)?;
    let rest = &disposition[idx + key.len()..];
    let rest = rest.split(';').next().unwrap_or(rest).trim();

    let after_charset = rest
        .strip_prefix("UTF-8''")
        .or_else(|| rest.strip_prefix("utf-8''"))?;
    Some(percent_decode(after_charset))
}

fn extract_filename_plain(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let key = "filename=";
    let idx = lower.find(key)?;
    let start = idx + key.len();
    let slice = &disposition[start..];
    let end = slice.find(';').unwrap_or(slice.len());
    let raw = slice[..end].trim().trim_matches('"');
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(c) = chars.next() {
        if c == '%' {
            let h1 = chars.next();
            let h2 = chars.next();
            if let (Some(h1), Some(h2)) = (h1, h2) {
                let hex = format!("{}{}", h1, h2);
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    pending.push(byte);
                    continue;
                }
            }
            flush_pending(&mut pending, &mut out);
            out.push('%');
            if let Some(h1) = h1 {
                out.push(h1);
            }
            if let Some(h2) = h2 {
                out.push(h2);
            }
        } else {
            flush_pending(&mut pending, &mut out);
            out.push(c);
        }
    }
    flush_pending(&mut pending, &mut out);
    out
}

fn flush_pending(pending: &mut Vec<u8>, out: &mut String) {
    if pending.is_empty() {
        return;
    }
    if let Ok(s) = std::str::from_utf8(pending) {
        out.push_str(s);
    } else {
        out.push('\u{FFFD}');
    }
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_reads_content_length_and_accept_ranges() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "12345")
                    .insert_header("accept-ranges", "bytes"),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let info = FileInfoProbe::probe(&client, &server.uri()).await.unwrap();
        assert_eq!(info.content_length, 12345);
        assert!(info.supports_pause);
    }

    #[tokio::test]
    async fn probe_fails_without_content_length() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = Client::new();
        let result = FileInfoProbe::probe(&client, &server.uri()).await;
        assert!(matches!(result, Err(EngineError::UnsupportedSource)));
    }

    #[test]
    fn extract_filename_prefers_rfc5987_form() {
        let header = "attachment; filename=\"plain.txt\"; filename*=UTF-8''encoded%20name.txt";
        assert_eq!(extract_filename(header).as_deref(), Some("encoded name.txt"));
    }

    #[test]
    fn extract_filename_falls_back_to_plain_form() {
        let header = "attachment; filename=\"report.pdf\"";
        assert_eq!(extract_filename(header).as_deref(), Some("report.pdf"));
    }

    #[test]
    fn file_name_from_url_strips_query_and_decodes() {
        assert_eq!(file_name_from_url("https://example.test/a/My%20File.zip?token=x"), "My File.zip");
    }

    #[test]
    fn ext_from_mime_maps_known_video_type() {
        assert_eq!(ext_from_mime(Some("video/mp4; charset=binary")).as_deref(), Some("mp4"));
    }

    #[test]
    fn ext_from_mime_unknown_type_returns_none() {
        assert_eq!(ext_from_mime(Some("application/octet-stream")), None);
    }

    #[test]
    fn ensure_extension_leaves_existing_extension_alone() {
        assert_eq!(ensure_extension("clip.mov".into(), Some("video/mp4")), "clip.mov");
    }

    #[test]
    fn ensure_extension_appends_from_mime_when_missing() {
        assert_eq!(ensure_extension("clip".into(), Some("video/x-matroska")), "clip.mkv");
    }

    #[tokio::test]
    async fn probe_falls_back_to_mime_extension_without_disposition_or_url_extension() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "2048")
                    .insert_header("content-type", "video/webm"),
            )
            .mount(&server)
            .await;

        let client = Client::new();
        let info = FileInfoProbe::probe(&client, &format!("{}/stream", server.uri())).await.unwrap();
        assert!(info.file_name.ends_with(".webm"), "got {}", info.file_name);
    }
}
