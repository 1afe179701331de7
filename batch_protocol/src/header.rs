//! Label and entry escaping shared by both batch protocol versions.
//!
//! A record header value is `<size>,<content_type>[,<key>=<value>...]`. The
//! escaping contract is:
//!
//! * a value is written verbatim unless it is empty, contains `,` or `=`, or
//!   starts or ends with whitespace; then it is wrapped in double quotes;
//! * a value can never contain `"`;
//! * a key is non-empty, has no whitespace, no `,`, `=` or `"`, and does not
//!   start with `@` (reserved for labels computed by the server);
//! * a content type has no `,`.
//!
//! Parsing accepts exactly what encoding produces, plus items without `=`,
//! which are skipped so that future fields do not break older clients.

use std::borrow::Cow;

use data_model::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub fn validate_label_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("label name must not be empty"));
    }
    if key.starts_with('@') {
        return Err(Error::invalid_argument(format!(
            "label name '{key}' must not start with '@': reserved for computed labels"
        )));
    }
    if key
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | '=' | '"'))
    {
        return Err(Error::invalid_argument(format!(
            "label name '{key}' contains a separator, a quote or whitespace"
        )));
    }
    Ok(())
}

pub fn encode_label_value(value: &str) -> Result<Cow<'_, str>> {
    if value.contains('"') {
        return Err(Error::invalid_argument(format!(
            "label value '{value}' must not contain '\"'"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::invalid_argument(format!(
            "label value {value:?} contains a control character"
        )));
    }
    let needs_quotes = value.is_empty()
        || value.contains([',', '='])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        Ok(Cow::Owned(format!("\"{value}\"")))
    } else {
        Ok(Cow::Borrowed(value))
    }
}

pub fn validate_content_type(content_type: &str) -> Result<()> {
    if content_type.contains(',') || content_type.chars().any(char::is_control) {
        return Err(Error::invalid_argument(format!(
            "content type '{content_type}' must not contain ',' or control characters"
        )));
    }
    Ok(())
}

/// One `key=value` item of a header value. `None` is an unquoted empty value,
/// which protocol v2 uses to remove a label.
pub type LabelItem<'a> = (&'a str, Option<&'a str>);

pub fn parse_label_items(raw: &str) -> Result<Vec<LabelItem<'_>>> {
    let mut items = Vec::new();
    let mut rest = raw;

    while !rest.is_empty() {
        let Some(pos) = rest.find([',', '=']) else {
            // trailing item without '='
            break;
        };
        if rest.as_bytes()[pos] == b',' {
            rest = &rest[pos + 1..];
            continue;
        }

        let key = rest[..pos].trim();
        if key.is_empty() {
            return Err(Error::protocol(format!("empty label name in '{raw}'")));
        }
        rest = &rest[pos + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted
                .find('"')
                .ok_or_else(|| Error::protocol(format!("unterminated quote in '{raw}'")))?;
            let value = &quoted[..end];
            rest = &quoted[end + 1..];
            if let Some(next) = rest.strip_prefix(',') {
                rest = next;
            } else if !rest.is_empty() {
                return Err(Error::protocol(format!(
                    "unexpected characters after quoted value in '{raw}'"
                )));
            }
            Some(value)
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = &rest[..end];
            rest = rest.get(end + 1..).unwrap_or("");
            (!value.is_empty()).then_some(value)
        };
        items.push((key, value));
    }
    Ok(items)
}

/// Split `<size>[,<content_type>[,<labels>]]`.
pub fn split_record_value(raw: &str) -> Result<(u64, Option<&str>, Option<&str>)> {
    let (size, rest) = match raw.split_once(',') {
        Some((size, rest)) => (size, Some(rest)),
        None => (raw, None),
    };
    let size = size
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::protocol(format!("invalid record size in '{raw}'")))?;

    let Some(rest) = rest else {
        return Ok((size, None, None));
    };
    match rest.split_once(',') {
        Some((content_type, labels)) => Ok((size, Some(content_type.trim()), Some(labels))),
        None => Ok((size, Some(rest.trim()), None)),
    }
}

fn is_tchar(byte: u8) -> bool {
    // RFC 9110 token characters, minus '%' which starts an escape
    byte.is_ascii_alphanumeric() || b"!#$&'*+-.^_`|~".contains(&byte)
}

/// Percent-encode an entry or label name for the comma separated lists of
/// protocol v2.
pub fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if is_tchar(byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

pub fn decode_name(encoded: &str) -> Result<String> {
    urlencoding::decode(encoded)
        .map(Cow::into_owned)
        .map_err(|_| Error::protocol(format!("name '{encoded}' is not valid UTF-8")))
}

pub fn header_str<'a>(name: &str, value: &'a HeaderValue) -> Result<&'a str> {
    std::str::from_utf8(value.as_bytes())
        .map_err(|_| Error::protocol(format!("header '{name}' is not valid UTF-8")))
}

pub fn get_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| header_str(name, value))
        .transpose()
}

pub fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::invalid_argument(format!("invalid header name '{name}'")))?;
    let value = HeaderValue::from_bytes(value.as_bytes())
        .map_err(|_| Error::invalid_argument(format!("invalid header value {value:?}")))?;
    headers.insert(name, value);
    Ok(())
}
