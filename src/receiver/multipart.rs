//! `multipart/form-data` request bodies.

use anyhow::{anyhow, Result};

use crate::http::find_subslice;

/// One part of a form.
#[derive(Clone, Debug, PartialEq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Part {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Boundary parameter of a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = format!("\r\n--{}", boundary).into_bytes();

    let start = find_subslice(body, &delimiter).ok_or_else(|| anyhow!("boundary not found"))?;
    let mut cursor = start + delimiter.len();
    let mut parts = Vec::new();
    loop {
        let rest = &body[cursor..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        let rest = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| anyhow!("malformed part delimiter"))?;
        let head_end =
            find_subslice(rest, b"\r\n\r\n").ok_or_else(|| anyhow!("part headers not terminated"))?;
        let head = String::from_utf8_lossy(&rest[..head_end]);
        let content = &rest[head_end + 4..];
        let data_end =
            find_subslice(content, &separator).ok_or_else(|| anyhow!("missing closing boundary"))?;

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in head.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "content-disposition" => {
                    for param in value.split(';').skip(1) {
                        if let Some((k, v)) = param.split_once('=') {
                            let v = v.trim().trim_matches('"').to_string();
                            match k.trim() {
                                "name" => name = Some(v),
                                "filename" => filename = Some(v),
                                _ => {}
                            }
                        }
                    }
                }
                "content-type" => content_type = Some(value.trim().to_string()),
                _ => {}
            }
        }
        parts.push(Part {
            name: name.ok_or_else(|| anyhow!("part without a name"))?,
            filename,
            content_type,
            data: content[..data_end].to_vec(),
        });

        // Advance to just past the next delimiter.
        let consumed = body.len() - content.len() + data_end + separator.len();
        cursor = consumed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MultipartForm;

    #[test]
    fn extracts_boundary() {
        assert_eq!(
            boundary("multipart/form-data; boundary=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            boundary("Multipart/Form-Data; charset=utf-8; boundary=\"q r\"").as_deref(),
            Some("q r")
        );
        assert!(boundary("application/json").is_none());
        assert!(boundary("multipart/form-data").is_none());
    }

    #[test]
    fn parses_what_the_dispatcher_sends() -> Result<()> {
        let jpeg = vec![0xFF, 0xD8, b'\r', b'\n', b'-', b'-', 0x00, 0xFF, 0xD9];
        let form = MultipartForm::default()
            .text("label", "plate_detected")
            .text("timestamp", "2024-05-01 10:20:30")
            .text("plate", "")
            .file("image", "snap.jpg", "image/jpeg", jpeg.clone());
        let body = form.encode("b0undary");
        let parts = parse(&body, "b0undary")?;
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].name, "label");
        assert_eq!(parts[0].text(), Some("plate_detected"));
        assert_eq!(parts[1].text(), Some("2024-05-01 10:20:30"));
        assert_eq!(parts[2].text(), Some(""));
        assert_eq!(parts[3].filename.as_deref(), Some("snap.jpg"));
        assert_eq!(parts[3].content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(parts[3].data, jpeg);
        Ok(())
    }

    #[test]
    fn rejects_truncated_body() {
        let body = b"--xx\r\nContent-Disposition: form-data; name=\"label\"\r\n\r\nfall".to_vec();
        assert!(parse(&body, "xx").is_err());
        assert!(parse(b"no boundary here", "xx").is_err());
    }
}
