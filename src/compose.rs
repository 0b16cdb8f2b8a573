//! Secure outbound message construction
//!
//! Builds a wire-ready RFC 5322 message from a structured request with
//! `lettre`'s message builder. Every header-bound string is stripped of
//! CR/LF before it reaches the builder, addresses must be plain ASCII, and
//! every attachment path passes the path guard before it is opened. The
//! builder takes care of RFC 2047 encoded-words, transfer encodings and line
//! lengths. A build either returns a complete message or an error; it never
//! returns a partial message.

use std::path::{Path, PathBuf};

use lettre::Address;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};

use crate::errors::{AppError, AppResult};
use crate::path_guard::{PathGuard, file_name_of};

/// Maximum length of an address (RFC 5321 path limit)
const MAX_ADDRESS_LEN: usize = 254;

/// Structured outbound message request
#[derive(Debug, Clone, Default)]
pub struct SecureMessageRequest {
    /// Sender mailbox (`addr` or `Name <addr>`); required by [`build`]
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    /// Plain-text body
    pub body: Option<String>,
    /// HTML body
    pub html_body: Option<String>,
    /// Message-ID of the message being replied to
    pub in_reply_to: Option<String>,
    /// Local files to attach
    pub attachments: Vec<PathBuf>,
}

/// Fully assembled message bytes, consumed once by the transport
#[derive(Debug)]
pub struct BuiltMessage {
    bytes: Vec<u8>,
}

impl BuiltMessage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Attachment loaded from disk after passing the path guard
struct LoadedAttachment {
    file_name: String,
    content_type: ContentType,
    data: Vec<u8>,
}

/// Body before attachments are considered
enum Content {
    Single(SinglePart),
    Alternative(MultiPart),
}

/// Build a wire-ready message
///
/// # Errors
///
/// - `InvalidInput` for a missing sender, recipients or body, an invalid
///   address (the first one found is named), or an attachment that is not a
///   readable file
/// - `SecurityBlocked` if an attachment path is vetoed by the guard
pub async fn build(request: &SecureMessageRequest, guard: &PathGuard) -> AppResult<BuiltMessage> {
    if request.to.is_empty() {
        return Err(AppError::invalid("at least one recipient is required"));
    }
    if request.body.is_none() && request.html_body.is_none() {
        return Err(AppError::invalid("a plain or HTML body is required"));
    }
    let from = request
        .from
        .as_deref()
        .ok_or_else(|| AppError::invalid("a sender address is required"))?;

    let mut builder = Message::builder()
        .from(parse_mailbox(from)?)
        .subject(sanitize_header_value(&request.subject))
        .keep_bcc();
    for addr in &request.to {
        builder = builder.to(parse_mailbox(addr)?);
    }
    for addr in &request.cc {
        builder = builder.cc(parse_mailbox(addr)?);
    }
    for addr in &request.bcc {
        builder = builder.bcc(parse_mailbox(addr)?);
    }
    if let Some(reply_to) = request.in_reply_to.as_deref() {
        let reply_to = sanitize_header_value(reply_to);
        if !reply_to.trim().is_empty() {
            builder = builder.in_reply_to(reply_to.clone()).references(reply_to);
        }
    }

    let mut attachments = Vec::with_capacity(request.attachments.len());
    for path in &request.attachments {
        attachments.push(load_attachment(path, guard).await?);
    }

    let content = body_content(request.body.as_deref(), request.html_body.as_deref());
    let assembled = if attachments.is_empty() {
        match content {
            Content::Single(part) => builder.singlepart(part),
            Content::Alternative(parts) => builder.multipart(parts),
        }
    } else {
        let mut mixed = match content {
            Content::Single(part) => MultiPart::mixed().singlepart(part),
            Content::Alternative(parts) => MultiPart::mixed().multipart(parts),
        };
        for attachment in attachments {
            mixed = mixed.singlepart(
                Attachment::new(attachment.file_name)
                    .body(attachment.data, attachment.content_type),
            );
        }
        builder.multipart(mixed)
    };

    let message =
        assembled.map_err(|e| AppError::invalid(format!("cannot assemble message: {e}")))?;
    Ok(BuiltMessage {
        bytes: message.formatted(),
    })
}

/// Strip CR and LF so a value can never start a new header line
pub fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n'))
        .collect()
}

/// Syntactic email address check: `local@domain.tld`
///
/// ASCII only. Rejects whitespace, control characters and path separators
/// so a valid address is also safe as a header value and as a directory
/// name.
pub fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN || !address.is_ascii() {
        return false;
    }
    if address.chars().any(|c| {
        c.is_whitespace()
            || c.is_control()
            || matches!(c, '/' | '\\' | '<' | '>' | '"' | ',' | ';')
    }) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

/// Validate one mailbox (`addr` or `Name <addr>`)
fn parse_mailbox(raw: &str) -> AppResult<Mailbox> {
    let invalid =
        || AppError::InvalidInput(format!("invalid email address: {}", raw.escape_debug()));

    let clean = sanitize_header_value(raw);
    let trimmed = clean.trim();
    let (name, address) = match (trimmed.rfind('<'), trimmed.ends_with('>')) {
        (Some(open), true) => (
            trimmed[..open].trim().trim_matches('"').trim(),
            &trimmed[open + 1..trimmed.len() - 1],
        ),
        _ => ("", trimmed),
    };
    if !is_valid_address(address) {
        return Err(invalid());
    }
    let email: Address = address.parse().map_err(|_| invalid())?;
    let name = (!name.is_empty()).then(|| name.to_owned());
    Ok(Mailbox::new(name, email))
}

async fn load_attachment(path: &Path, guard: &PathGuard) -> AppResult<LoadedAttachment> {
    let resolved = guard.ensure_allowed(path)?;
    let not_readable = || {
        AppError::InvalidInput(format!(
            "attachment is not a readable file: {}",
            path.display()
        ))
    };

    let meta = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| not_readable())?;
    if !meta.is_file() {
        return Err(not_readable());
    }
    let data = tokio::fs::read(&resolved)
        .await
        .map_err(|_| not_readable())?;
    let file_name = file_name_of(&resolved).unwrap_or_else(|| "attachment".to_owned());
    let content_type = ContentType::parse(&guess_content_type(&file_name)).map_err(|e| {
        AppError::Internal(format!("unusable content type for {file_name}: {e}"))
    })?;
    Ok(LoadedAttachment {
        file_name: attachment_file_name(&file_name),
        content_type,
        data,
    })
}

fn body_content(plain: Option<&str>, html: Option<&str>) -> Content {
    match (plain, html) {
        (Some(plain), Some(html)) => Content::Alternative(MultiPart::alternative_plain_html(
            plain.to_owned(),
            html.to_owned(),
        )),
        (None, Some(html)) => Content::Single(SinglePart::html(html.to_owned())),
        (Some(plain), None) => Content::Single(SinglePart::plain(plain.to_owned())),
        (None, None) => Content::Single(SinglePart::plain(String::new())),
    }
}

/// File name safe for a quoted header parameter
fn attachment_file_name(name: &str) -> String {
    sanitize_header_value(name)
        .chars()
        .map(|c| if matches!(c, '"' | '\\') { '_' } else { c })
        .collect()
}

/// MIME type from a file extension, defaulting to `application/octet-stream`
pub fn guess_content_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use mailparse::MailHeaderMap;

    use super::{
        SecureMessageRequest, build, guess_content_type, is_valid_address, sanitize_header_value,
    };
    use crate::errors::AppError;
    use crate::path_guard::PathGuard;

    fn guard() -> (PathGuard, PathBuf) {
        let root =
            std::env::temp_dir().join(format!("mail-agent-compose-{}", uuid::Uuid::new_v4()));
        (PathGuard::new(&root).expect("guard"), root)
    }

    fn request(body: Option<&str>, html: Option<&str>) -> SecureMessageRequest {
        SecureMessageRequest {
            from: Some("alice@example.com".to_owned()),
            to: vec!["bob@example.com".to_owned()],
            subject: "Quarterly numbers".to_owned(),
            body: body.map(str::to_owned),
            html_body: html.map(str::to_owned),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_only_is_single_part_text() {
        let (guard, _) = guard();
        let built = build(&request(Some("Hello Bob"), None), &guard)
            .await
            .expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert_eq!(parsed.ctype.mimetype, "text/plain");
        assert!(parsed.subparts.is_empty());
        assert_eq!(parsed.get_body().expect("body").trim_end(), "Hello Bob");
        assert_eq!(
            parsed.headers.get_first_value("Subject").as_deref(),
            Some("Quarterly numbers")
        );
    }

    #[tokio::test]
    async fn plain_and_html_become_alternative_with_plain_first() {
        let (guard, _) = guard();
        let built = build(
            &request(Some("Hello Bob"), Some("<p>Hello Bob</p>")),
            &guard,
        )
        .await
        .expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert_eq!(parsed.ctype.mimetype, "multipart/alternative");
        assert_eq!(parsed.subparts.len(), 2);
        assert_eq!(parsed.subparts[0].ctype.mimetype, "text/plain");
        assert_eq!(
            parsed.subparts[0].get_body().expect("body").trim_end(),
            "Hello Bob"
        );
        assert_eq!(parsed.subparts[1].ctype.mimetype, "text/html");
    }

    #[tokio::test]
    async fn html_only_is_single_part_html() {
        let (guard, _) = guard();
        let built = build(&request(None, Some("<b>hi</b>")), &guard)
            .await
            .expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert_eq!(parsed.ctype.mimetype, "text/html");
        assert!(parsed.subparts.is_empty());
    }

    #[tokio::test]
    async fn long_body_lines_are_transfer_encoded() {
        let (guard, _) = guard();
        let body = "a".repeat(2000);
        let built = build(&request(Some(&body), None), &guard)
            .await
            .expect("builds");
        let raw = String::from_utf8(built.as_bytes().to_vec()).expect("utf8");
        let longest = raw.split("\r\n").map(str::len).max().unwrap_or_default();
        assert!(longest <= 998, "longest line {longest}");

        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert_eq!(parsed.get_body().expect("body").trim_end(), body);
    }

    #[tokio::test]
    async fn subject_injection_cannot_forge_headers() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.subject = "Hi\r\nBcc: attacker@evil.test\r\n\r\nforged".to_owned();
        let built = build(&req, &guard).await.expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert!(parsed.headers.get_first_value("Bcc").is_none());
        let subject = parsed.headers.get_first_value("Subject").expect("subject");
        assert!(!subject.contains('\r') && !subject.contains('\n'));
        assert_eq!(parsed.get_body().expect("body").trim_end(), "body");
    }

    #[tokio::test]
    async fn bcc_is_kept_for_the_transport() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.bcc = vec!["carol@example.com".to_owned()];
        let built = build(&req, &guard).await.expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        let bcc = parsed.headers.get_first_value("Bcc").expect("bcc header");
        assert!(bcc.contains("carol@example.com"));
    }

    #[tokio::test]
    async fn reply_linkage_sets_both_headers_sanitized() {
        let (guard, _) = guard();
        let mut req = request(Some("ok"), None);
        req.in_reply_to = Some("<abc@mail.example>\r\nX-Evil: 1".to_owned());
        let built = build(&req, &guard).await.expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert!(parsed.headers.get_first_value("X-Evil").is_none());
        let in_reply_to = parsed
            .headers
            .get_first_value("In-Reply-To")
            .expect("header");
        assert!(in_reply_to.starts_with("<abc@mail.example>"));
        assert_eq!(
            parsed.headers.get_first_value("References"),
            Some(in_reply_to)
        );
    }

    #[tokio::test]
    async fn non_ascii_subject_is_encoded_and_decodes_back() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.subject = "Réunion équipe".to_owned();
        let built = build(&req, &guard).await.expect("builds");
        let raw = String::from_utf8(built.as_bytes().to_vec()).expect("utf8");
        let subject_line = raw
            .split("\r\n")
            .find(|l| l.starts_with("Subject:"))
            .expect("subject line");
        assert!(subject_line.is_ascii());
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        assert_eq!(
            parsed.headers.get_first_value("Subject").as_deref(),
            Some(req.subject.as_str())
        );
    }

    #[tokio::test]
    async fn invalid_recipient_is_named_in_error() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.cc = vec![
            "ok@example.com".to_owned(),
            "not-an-address".to_owned(),
            "bad@".to_owned(),
        ];
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(err.to_string().contains("not-an-address"));
    }

    #[tokio::test]
    async fn non_ascii_addresses_are_rejected() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.to = vec!["jöhn@exämple.com".to_owned()];
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(_)));

        let mut req = request(Some("body"), None);
        req.from = Some("Zoë <zoë@example.com>".to_owned());
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_sender_is_rejected() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.from = None;
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn display_names_survive_and_non_ascii_names_are_encoded() {
        let (guard, _) = guard();
        let mut req = request(Some("body"), None);
        req.from = Some("Zoë Example <zoe@example.com>".to_owned());
        req.to = vec!["Bob Smith <bob@example.com>".to_owned()];
        let built = build(&req, &guard).await.expect("builds");
        let raw = String::from_utf8(built.as_bytes().to_vec()).expect("utf8");
        let from_line = raw
            .split("\r\n")
            .find(|l| l.starts_with("From:"))
            .expect("from line");
        assert!(from_line.is_ascii());

        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");
        let from = parsed.headers.get_first_value("From").expect("from");
        assert!(from.contains("Zoë Example"));
        assert!(from.contains("<zoe@example.com>"));
        let to = parsed.headers.get_first_value("To").expect("to");
        assert!(to.contains("Bob Smith"));
        assert!(to.contains("<bob@example.com>"));
    }

    #[tokio::test]
    async fn attachments_use_mixed_multipart_with_base64_parts() {
        let (guard, _) = guard();
        let dir = std::env::temp_dir().join(format!("mail-agent-attach-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.expect("dir");
        let file = dir.join("report.pdf");
        let payload: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        tokio::fs::write(&file, &payload).await.expect("write");

        let mut req = request(Some("see attached"), Some("<p>see attached</p>"));
        req.attachments = vec![file];
        let built = build(&req, &guard).await.expect("builds");
        let parsed = mailparse::parse_mail(built.as_bytes()).expect("parses");

        assert_eq!(parsed.ctype.mimetype, "multipart/mixed");
        assert_eq!(parsed.subparts.len(), 2);
        assert_eq!(parsed.subparts[0].ctype.mimetype, "multipart/alternative");
        let attachment = &parsed.subparts[1];
        assert_eq!(attachment.ctype.mimetype, "application/pdf");
        assert_eq!(
            attachment
                .get_content_disposition()
                .params
                .get("filename")
                .map(String::as_str),
            Some("report.pdf")
        );
        assert_eq!(attachment.get_body_raw().expect("raw"), payload);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn blocked_or_missing_attachments_abort_the_build() {
        let (guard, root) = guard();
        let mut req = request(Some("body"), None);
        req.attachments = vec![root.join("accounts.json")];
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::SecurityBlocked(_)));

        req.attachments = vec![PathBuf::from("~/.ssh/id_ed25519")];
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::SecurityBlocked(_)));

        req.attachments = vec![
            std::env::temp_dir().join(format!("missing-{}.pdf", uuid::Uuid::new_v4())),
        ];
        let err = build(&req, &guard).await.expect_err("must fail");
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn header_and_address_helpers_behave() {
        assert_eq!(sanitize_header_value("a\r\nb\nc"), "abc");
        assert!(is_valid_address("a.b+tag@sub.example.com"));
        for bad in [
            "",
            "a@",
            "@x.com",
            "a@b",
            "a b@x.com",
            "a@@x.com",
            "a@x..com",
            "a\r\n@x.com",
            "jöhn@example.com",
            "john@exämple.com",
        ] {
            assert!(!is_valid_address(bad), "{bad:?}");
        }
        assert_eq!(guess_content_type("photo.JPG"), "image/jpeg");
        assert_eq!(guess_content_type("report.pdf"), "application/pdf");
        assert_eq!(guess_content_type("blob"), "application/octet-stream");
    }
}
