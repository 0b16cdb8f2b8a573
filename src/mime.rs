//! Remote message parsing and attachment extraction
//!
//! Parses RFC 5322 messages fetched from the remote mailbox using
//! `mailparse`, extracts body text/HTML, and lists attachments with stable
//! part ids (`1`, `1.2`, `1.2.1`, ...). The MIME tree is walked depth-first
//! with an explicit stack and a depth limit, so hostile nesting cannot blow
//! the call stack. HTML is sanitized with `ammonia`.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, ParsedMail};
use serde::Serialize;
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Deepest MIME nesting that is still walked
pub const MAX_MIME_DEPTH: usize = 32;

/// Attachment metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentInfo {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`)
    pub content_type: String,
    /// Decoded size in bytes
    pub size_bytes: usize,
    /// Part id within the MIME tree
    pub part_id: String,
}

/// Parsed message representation
#[derive(Debug, Clone, Serialize)]
pub struct ParsedMessage {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// `Message-ID` header, used as the reply-linkage target
    pub message_id: Option<String>,
    /// Plain text body, truncated to the requested limit
    pub body_text: Option<String>,
    /// Sanitized HTML body, truncated to the requested limit
    pub body_html_sanitized: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Decoded attachment content
#[derive(Debug, Clone)]
pub struct AttachmentContent {
    pub info: AttachmentInfo,
    pub data: Vec<u8>,
}

/// Parse a raw message into a structured representation
///
/// # Errors
///
/// - `Internal` if `mailparse` rejects the message
pub fn parse_message(raw: &[u8], body_max_chars: usize) -> AppResult<ParsedMessage> {
    let parsed = parse_raw(raw)?;
    let headers = to_header_map(&parsed.headers);

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(&parsed, |part, part_id| {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        match leaf_attachment_name(part) {
            Some(filename) => {
                let size_bytes = part.get_body_raw().map(|b| b.len()).unwrap_or_default();
                attachments.push(AttachmentInfo {
                    filename,
                    content_type: ctype,
                    size_bytes,
                    part_id: part_id.to_owned(),
                });
            }
            None => {
                if ctype == "text/plain"
                    && body_text.is_none()
                    && let Ok(text) = part.get_body()
                {
                    body_text = Some(text);
                }
                if ctype == "text/html"
                    && body_html.is_none()
                    && let Ok(html) = part.get_body()
                {
                    body_html = Some(ammonia::clean(&html));
                }
            }
        }
        false
    });

    Ok(ParsedMessage {
        date: headers.get("date").cloned(),
        from: headers.get("from").cloned(),
        to: headers.get("to").cloned(),
        cc: headers.get("cc").cloned(),
        subject: headers.get("subject").cloned(),
        message_id: headers.get("message-id").cloned(),
        body_text: body_text.map(|t| truncate_chars(t, body_max_chars)),
        body_html_sanitized: body_html.map(|h| truncate_chars(h, body_max_chars)),
        attachments,
    })
}

/// Decode one attachment by part id
///
/// # Errors
///
/// - `NotFound` if no attachment has that part id
/// - `Internal` if the message or the part body cannot be decoded
pub fn extract_attachment(raw: &[u8], part_id: &str) -> AppResult<AttachmentContent> {
    let parsed = parse_raw(raw)?;
    let mut found = None;
    walk_parts(&parsed, |part, id| {
        if id != part_id {
            return false;
        }
        if let Some(filename) = leaf_attachment_name(part) {
            found = Some((part, filename));
        }
        true
    });

    let (part, filename) =
        found.ok_or_else(|| AppError::NotFound(format!("attachment part '{part_id}'")))?;
    let data = part
        .get_body_raw()
        .map_err(|e| AppError::Internal(format!("failed decoding attachment body: {e}")))?;
    Ok(AttachmentContent {
        info: AttachmentInfo {
            filename,
            content_type: part.ctype.mimetype.to_ascii_lowercase(),
            size_bytes: data.len(),
            part_id: part_id.to_owned(),
        },
        data,
    })
}

fn parse_raw(raw: &[u8]) -> AppResult<ParsedMail<'_>> {
    mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse message: {e}")))
}

/// Depth-first walk over leaf parts in document order
///
/// `visit` receives each leaf and its part id and returns `true` to stop.
/// Subtrees deeper than [`MAX_MIME_DEPTH`] are skipped.
fn walk_parts<'a, F>(root: &'a ParsedMail<'a>, mut visit: F)
where
    F: FnMut(&'a ParsedMail<'a>, &str) -> bool,
{
    let mut stack: Vec<(&'a ParsedMail<'a>, String, usize)> = vec![(root, "1".to_owned(), 0)];
    while let Some((part, part_id, depth)) = stack.pop() {
        if part.subparts.is_empty() {
            if visit(part, &part_id) {
                return;
            }
            continue;
        }
        if depth >= MAX_MIME_DEPTH {
            warn!(part_id = %part_id, "MIME nesting exceeds depth limit; skipping subtree");
            continue;
        }
        for (idx, sub) in part.subparts.iter().enumerate().rev() {
            stack.push((sub, format!("{part_id}.{}", idx + 1), depth + 1));
        }
    }
}

/// Attachment filename for a leaf part, `None` when the part is inline body
///
/// The outer option says whether the part is an attachment; the inner one
/// carries its filename if any.
fn leaf_attachment_name(part: &ParsedMail<'_>) -> Option<Option<String>> {
    let disp = part.get_content_disposition();
    let filename = attachment_filename(part, &disp.params);
    let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();
    is_attachment.then_some(filename)
}

/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Returns first value for each header key (case-insensitive).
fn to_header_map(headers: &[MailHeader<'_>]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for h in headers {
        map.entry(h.get_key().to_ascii_lowercase())
            .or_insert_with(|| h.get_value());
    }
    map
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
