//! Media embedded in rich-text content. Editors send HTML with inline
//! `<img>`, `<video>`, `<audio>` and PDF embeds; those tags are lifted out
//! into media rows and the remaining text is stored as content.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use agora_db::models::NewMedia;
use agora_types::models::MediaType;

use crate::error::ApiError;

/// Upper bound on stored content, after media extraction.
const MAX_CONTENT_BYTES: usize = 50_000;

static MEDIA_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<(?P<lone_kind>video|audio)\b(?P<lone>[^>]*)/\s*>|<video\b(?P<video>[^>]*)>(?P<video_body>.*?)</video\s*>|<audio\b(?P<audio>[^>]*)>(?P<audio_body>.*?)</audio\s*>|<iframe\b(?P<iframe>[^>]*)>(?:.*?</iframe\s*>)?|<object\b(?P<object>[^>]*)>(?:.*?</object\s*>)?|<img\b(?P<img>[^>]*)>|<embed\b(?P<embed>[^>]*)>|<source\b(?P<source>[^>]*)>"#,
    )
    .expect("media tag regex")
});

static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:src|data)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("src regex")
});

static PDF_TYPE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\btype\s*=\s*["']application/pdf["']"#).expect("type regex")
});

static INNER_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<source\b([^>]*)>").expect("source regex"));

static EMPTY_PARAGRAPH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<p\b[^>]*>(?:\s|&nbsp;|<br\s*/?>)*</p\s*>").expect("paragraph regex")
});

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub text: String,
    pub media: Vec<NewMedia>,
}

pub fn extract_media(html: &str) -> ExtractedContent {
    let mut media = Vec::new();

    let stripped = MEDIA_TAG.replace_all(html, |caps: &Captures<'_>| {
        match classify(caps) {
            Some((kind, path)) => {
                media.push(NewMedia {
                    media_type: kind.as_str().to_string(),
                    path,
                });
                String::new()
            }
            None => caps[0].to_string(),
        }
    });

    let text = EMPTY_PARAGRAPH.replace_all(&stripped, "").trim().to_string();
    ExtractedContent { text, media }
}

/// Extract media and reject content that ends up with neither text nor media.
pub fn prepare_content(html: &str) -> Result<ExtractedContent, ApiError> {
    let extracted = extract_media(html);
    if extracted.text.is_empty() && extracted.media.is_empty() {
        return Err(ApiError::BadRequest("Content cannot be empty".into()));
    }
    if extracted.text.len() > MAX_CONTENT_BYTES {
        return Err(ApiError::BadRequest("Content is too long".into()));
    }
    Ok(extracted)
}

/// Plain-text preview for notifications.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let plain = ANY_TAG.replace_all(text, " ");
    let plain = decode_entities(&plain);
    let words: Vec<&str> = plain.split_whitespace().collect();
    let joined = words.join(" ");

    if joined.chars().count() <= max_chars {
        joined
    } else {
        let cut: String = joined.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

fn classify(caps: &Captures<'_>) -> Option<(MediaType, String)> {
    if let Some(attrs) = caps.name("lone") {
        let kind = match caps.name("lone_kind")?.as_str().to_ascii_lowercase().as_str() {
            "video" => MediaType::Video,
            _ => MediaType::Audio,
        };
        return Some((kind, src_of(attrs.as_str())?));
    }
    if let Some(attrs) = caps.name("video") {
        let body = caps.name("video_body").map_or("", |m| m.as_str());
        return Some((MediaType::Video, src_or_inner_source(attrs.as_str(), body)?));
    }
    if let Some(attrs) = caps.name("audio") {
        let body = caps.name("audio_body").map_or("", |m| m.as_str());
        return Some((MediaType::Audio, src_or_inner_source(attrs.as_str(), body)?));
    }
    if let Some(attrs) = caps.name("img") {
        return Some((MediaType::Image, src_of(attrs.as_str())?));
    }
    if let Some(attrs) = caps
        .name("iframe")
        .or_else(|| caps.name("object"))
        .or_else(|| caps.name("embed"))
    {
        let path = src_of(attrs.as_str())?;
        let is_pdf = MediaType::from_path(&path) == Some(MediaType::Pdf)
            || PDF_TYPE_ATTR.is_match(attrs.as_str());
        return is_pdf.then_some((MediaType::Pdf, path));
    }
    if let Some(attrs) = caps.name("source") {
        let path = src_of(attrs.as_str())?;
        return MediaType::from_path(&path).map(|kind| (kind, path));
    }
    None
}

fn src_of(attrs: &str) -> Option<String> {
    let caps = SRC_ATTR.captures(attrs)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
    (!raw.is_empty()).then(|| decode_entities(raw))
}

fn src_or_inner_source(attrs: &str, body: &str) -> Option<String> {
    src_of(attrs).or_else(|| {
        INNER_SOURCE
            .captures_iter(body)
            .find_map(|c| c.get(1).and_then(|m| src_of(m.as_str())))
    })
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(extracted: &ExtractedContent) -> Vec<(&str, &str)> {
        extracted
            .media
            .iter()
            .map(|m| (m.media_type.as_str(), m.path.as_str()))
            .collect()
    }

    #[test]
    fn extracts_images_in_document_order() {
        let out = extract_media(
            r#"<p>Look</p><p><img src="/uploads/posts/a.png"></p><IMG SRC='/uploads/posts/b.jpg' alt="b"/>"#,
        );
        assert_eq!(out.text, "<p>Look</p>");
        assert_eq!(
            kinds(&out),
            vec![("image", "/uploads/posts/a.png"), ("image", "/uploads/posts/b.jpg")]
        );
    }

    #[test]
    fn video_path_from_inner_source() {
        let out = extract_media(
            r#"clip <video controls><source src="/uploads/posts/c.webm" type="video/webm"></video>"#,
        );
        assert_eq!(out.text, "clip");
        assert_eq!(kinds(&out), vec![("video", "/uploads/posts/c.webm")]);
    }

    #[test]
    fn audio_with_src_attribute() {
        let out = extract_media(r#"<audio src="/uploads/messages/v.mp3" controls></audio>"#);
        assert_eq!(kinds(&out), vec![("audio", "/uploads/messages/v.mp3")]);
        assert!(out.text.is_empty());
    }

    #[test]
    fn pdf_embeds_only_when_pdf() {
        let out = extract_media(
            r#"<iframe src="/uploads/posts/doc.pdf?page=2"></iframe><iframe src="https://video.example/embed/1"></iframe><embed src="/files/raw" type="application/pdf"><object data="/x/report.PDF"></object>"#,
        );
        assert_eq!(
            kinds(&out),
            vec![
                ("pdf", "/uploads/posts/doc.pdf?page=2"),
                ("pdf", "/files/raw"),
                ("pdf", "/x/report.PDF"),
            ]
        );
        assert_eq!(out.text, r#"<iframe src="https://video.example/embed/1"></iframe>"#);
    }

    #[test]
    fn standalone_source_by_extension() {
        let out = extract_media(r#"<source src="/a/song.ogg"><source src="/a/thing.xyz">"#);
        assert_eq!(kinds(&out), vec![("audio", "/a/song.ogg")]);
        assert_eq!(out.text, r#"<source src="/a/thing.xyz">"#);
    }

    #[test]
    fn tag_without_path_is_left_alone() {
        let out = extract_media(r#"<img alt="missing">"#);
        assert!(out.media.is_empty());
        assert_eq!(out.text, r#"<img alt="missing">"#);
    }

    #[test]
    fn decodes_ampersands_in_paths() {
        let out = extract_media(r#"<img src="/i.png?a=1&amp;b=2">"#);
        assert_eq!(out.media[0].path, "/i.png?a=1&b=2");
    }

    #[test]
    fn empty_content_is_rejected() {
        assert!(prepare_content("  <p> </p> ").is_err());
        assert!(prepare_content(r#"<img src="/a.png">"#).is_ok());
        assert!(prepare_content("hello").is_ok());
    }

    #[test]
    fn snippet_strips_markup_and_truncates() {
        assert_eq!(snippet("<p>Hello <b>world</b></p>", 50), "Hello world");
        assert_eq!(snippet("abcdefghij", 4), "abcd…");
    }
}
