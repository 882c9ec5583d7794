//! `multipart/form-data` bodies, split on their boundary.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Extracts the boundary from a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

pub fn parse(body: &[u8], boundary: &str) -> Vec<Part> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut current_pos = 0;

    while let Some(start_pos) = find_bytes(body, &delimiter, current_pos) {
        let part_start = start_pos + delimiter.len();
        if body[part_start..].starts_with(b"--") {
            break; // closing delimiter
        }
        let Some(end_pos) = find_bytes(body, &delimiter, part_start) else {
            break;
        };

        if let Some(part) = parse_part(&body[part_start..end_pos]) {
            parts.push(part);
        }
        current_pos = end_pos;
    }
    parts
}

fn parse_part(part_data: &[u8]) -> Option<Part> {
    let data = part_data.strip_prefix(b"\r\n").unwrap_or(part_data);

    let header_end = find_bytes(data, b"\r\n\r\n", 0)?;
    let header_str = std::str::from_utf8(&data[..header_end]).ok()?;
    let content = &data[header_end + 4..];
    let content = content.strip_suffix(b"\r\n").unwrap_or(content);

    let mut part = Part {
        name: None,
        file_name: None,
        content_type: None,
        data: content.to_vec(),
    };

    for line in header_str.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            part.name = disposition_param(value, "name");
            part.file_name = disposition_param(value, "filename");
        } else if key.eq_ignore_ascii_case("content-type") {
            part.content_type = Some(value.trim().to_string());
        }
    }
    Some(part)
}

fn disposition_param(value: &str, wanted: &str) -> Option<String> {
    split_params(value)
        .into_iter()
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(wanted))
        .map(|(_, v)| unquote(v.trim()))
}

/// Splits on `;` outside double quotes.
fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(&value[start..]);
    params
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => out.extend(chars.next()),
                    _ => out.push(c),
                }
            }
            out
        }
        None => value.to_string(),
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    haystack
        .get(start..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(boundary("multipart/form-data; boundary=abc"), Some("abc"));
        assert_eq!(boundary("multipart/form-data; charset=x; boundary=\"q q\""), Some("q q"));
        assert_eq!(boundary("text/plain; boundary=abc"), None);
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn splits_file_and_field_parts() {
        let body = b"--XYZ\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\r\n\
hello\r\n\
--XYZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
line one\r\nline two\r\n\
--XYZ--\r\n";

        let parts = parse(body, "XYZ");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name.as_deref(), Some("note"));
        assert_eq!(parts[0].file_name, None);
        assert_eq!(parts[0].data, b"hello");
        assert_eq!(parts[1].file_name.as_deref(), Some("a.txt"));
        assert_eq!(parts[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(parts[1].data, b"line one\r\nline two");
    }

    #[test]
    fn quoted_parameters_may_contain_semicolons() {
        let value = r#" form-data; name="file"; filename="a;b.txt""#;
        assert_eq!(disposition_param(value, "name").as_deref(), Some("file"));
        assert_eq!(disposition_param(value, "filename").as_deref(), Some("a;b.txt"));

        let escaped = r#" form-data; filename="say \"hi\"; bye.txt""#;
        assert_eq!(disposition_param(escaped, "filename").as_deref(), Some(r#"say "hi"; bye.txt"#));
        assert_eq!(disposition_param(" form-data; name=bare", "name").as_deref(), Some("bare"));
    }
}
