use async_imap::imap_proto::Address;
use async_imap::types::{Fetch, Flag, Name, NameAttribute};
use chrono::{DateTime, TimeZone, Utc};
use imapviewer_core::{MailAddress, MailHeader, MailboxEntry, MessageBody};
use mailparse::{parse_mail, MailParseError, ParsedMail};

pub(crate) fn mailbox_entry(name: &Name) -> MailboxEntry {
    let flags = name.attributes().iter().map(attribute_label).collect();
    MailboxEntry::new(name.name(), name.delimiter(), flags)
}

fn attribute_label(attribute: &NameAttribute<'_>) -> String {
    match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::All => "\\All".to_string(),
        NameAttribute::Archive => "\\Archive".to_string(),
        NameAttribute::Drafts => "\\Drafts".to_string(),
        NameAttribute::Flagged => "\\Flagged".to_string(),
        NameAttribute::Junk => "\\Junk".to_string(),
        NameAttribute::Sent => "\\Sent".to_string(),
        NameAttribute::Trash => "\\Trash".to_string(),
        NameAttribute::Extension(label) => label.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}

pub(crate) fn header_from_fetch(fetch: &Fetch) -> MailHeader {
    let envelope = fetch.envelope();
    let subject = envelope
        .and_then(|envelope| envelope.subject.as_deref())
        .map(decode_header_text)
        .unwrap_or_default();
    let from = envelope
        .and_then(|envelope| envelope.from.as_ref())
        .map(|list| list.iter().filter_map(mail_address).collect())
        .unwrap_or_default();
    let date = fetch
        .internal_date()
        .map(|date| date.with_timezone(&Utc))
        .or_else(|| {
            envelope
                .and_then(|envelope| envelope.date.as_deref())
                .and_then(parse_date)
        });

    let mut seen = false;
    let mut flagged = false;
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => seen = true,
            Flag::Flagged => flagged = true,
            _ => {}
        }
    }

    MailHeader {
        seq: fetch.message,
        uid: fetch.uid,
        subject,
        from,
        date,
        seen,
        flagged,
        size: fetch.size,
    }
}

fn mail_address(address: &Address<'_>) -> Option<MailAddress> {
    let mailbox = address.mailbox.as_deref().map(String::from_utf8_lossy)?;
    let address_text = match address.host.as_deref().map(String::from_utf8_lossy) {
        Some(host) if !host.is_empty() => format!("{mailbox}@{host}"),
        _ => mailbox.into_owned(),
    };
    let name = address
        .name
        .as_deref()
        .map(decode_header_text)
        .filter(|name| !name.is_empty());

    Some(MailAddress {
        name,
        address: address_text,
    })
}

/// Decodes RFC 2047 encoded words, falling back to lossy UTF-8.
pub(crate) fn decode_header_text(raw: &[u8]) -> String {
    let lossy = String::from_utf8_lossy(raw);
    let line = format!("X: {lossy}");
    match mailparse::parse_header(line.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => lossy.into_owned(),
    }
}

fn parse_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let timestamp = mailparse::dateparse(&String::from_utf8_lossy(raw)).ok()?;
    Utc.timestamp_opt(timestamp, 0).single()
}

pub(crate) fn message_body(uid: u32, raw: &[u8]) -> Result<MessageBody, MailParseError> {
    let mail = parse_mail(raw)?;
    Ok(MessageBody {
        uid,
        subject: header_value(&mail, "Subject"),
        text: find_part(&mail, &["text/plain", "text/markdown"]),
        html: find_part(&mail, &["text/html"]),
    })
}

fn header_value(mail: &ParsedMail<'_>, key: &str) -> Option<String> {
    mail.get_headers()
        .into_iter()
        .find(|header| header.get_key_ref().eq_ignore_ascii_case(key))
        .map(|header| header.get_value())
}

fn find_part(mail: &ParsedMail<'_>, mimetypes: &[&str]) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if mimetypes.contains(&content_type.as_str()) {
            return mail.get_body().ok();
        }
        return None;
    }

    mail.subparts
        .iter()
        .find_map(|part| find_part(part, mimetypes))
}
