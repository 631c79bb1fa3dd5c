//! Request and response header blocks
//!
//! Builds the ordered field list for a request (pseudo-headers first, then
//! regular headers in the requested order) and turns decoded response
//! blocks back into a status and `Headers`.

use super::error::{Error, ErrorCode, Result};
use super::frames::{HeaderField, MetaHeaders};
use super::hpack::HpackEncoder;
use crate::http::headers::{field_size, is_valid_name, is_valid_value};
use crate::http::{Headers, Method, Request, Status};
use bytes::BytesMut;
use std::fmt;

/// Request pseudo-header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    Method,
    Authority,
    Scheme,
    Path,
}

impl PseudoHeader {
    /// Field name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            PseudoHeader::Method => ":method",
            PseudoHeader::Authority => ":authority",
            PseudoHeader::Scheme => ":scheme",
            PseudoHeader::Path => ":path",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            ":method" | "method" | "m" => Some(PseudoHeader::Method),
            ":authority" | "authority" | "a" => Some(PseudoHeader::Authority),
            ":scheme" | "scheme" | "s" => Some(PseudoHeader::Scheme),
            ":path" | "path" | "p" => Some(PseudoHeader::Path),
            _ => None,
        }
    }
}

/// Order in which request pseudo-headers are written
///
/// Browsers differ here, and the order is visible to servers that
/// fingerprint HTTP/2 clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeaderOrder([PseudoHeader; 4]);

impl PseudoHeaderOrder {
    /// Build an order; each pseudo-header must appear exactly once
    pub fn new(order: [PseudoHeader; 4]) -> Result<Self> {
        for (i, p) in order.iter().enumerate() {
            if order[i + 1..].contains(p) {
                return Err(Error::InvalidConfig(format!("pseudo-header {} listed twice", p.name())));
            }
        }
        Ok(PseudoHeaderOrder(order))
    }

    /// Parse a compact form such as `"m,a,s,p"` or `":method,:path,..."`
    pub fn parse(spec: &str) -> Result<Self> {
        let parsed: Vec<PseudoHeader> = spec
            .split(',')
            .map(|s| {
                PseudoHeader::parse(s.trim())
                    .ok_or_else(|| Error::InvalidConfig(format!("unknown pseudo-header {:?}", s.trim())))
            })
            .collect::<Result<_>>()?;
        let order: [PseudoHeader; 4] = parsed
            .try_into()
            .map_err(|_| Error::InvalidConfig(format!("pseudo-header order {:?} must name all four", spec)))?;
        Self::new(order)
    }

    /// `:method :authority :scheme :path`
    pub fn chrome() -> Self {
        use PseudoHeader::*;
        PseudoHeaderOrder([Method, Authority, Scheme, Path])
    }

    /// `:method :path :authority :scheme`
    pub fn firefox() -> Self {
        use PseudoHeader::*;
        PseudoHeaderOrder([Method, Path, Authority, Scheme])
    }

    /// `:method :scheme :path :authority`
    pub fn safari() -> Self {
        use PseudoHeader::*;
        PseudoHeaderOrder([Method, Scheme, Path, Authority])
    }

    pub fn iter(&self) -> impl Iterator<Item = PseudoHeader> + '_ {
        self.0.iter().copied()
    }
}

impl Default for PseudoHeaderOrder {
    fn default() -> Self {
        use PseudoHeader::*;
        PseudoHeaderOrder([Authority, Method, Path, Scheme])
    }
}

impl fmt::Display for PseudoHeaderOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|p| p.name()).collect();
        write!(f, "{}", names.join(","))
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidHeader(reason.into())
}

fn check_field(name: &str, value: &str) -> Result<()> {
    if !is_valid_name(name) {
        return Err(invalid(format!("invalid header field name {:?}", name)));
    }
    if !is_valid_value(value) {
        return Err(invalid(format!("invalid header field value for {:?}", name)));
    }
    Ok(())
}

/// Apply the connection-specific header rules of RFC 7540 Section 8.1.2.2
///
/// Returns false when the field is accepted but must not be sent.
fn keep_request_field(name: &str, value: &str) -> Result<bool> {
    match name {
        "host" | "content-length" => Ok(false),
        "connection" => {
            let hop_only = value.split(',').map(str::trim).all(|token| {
                token.is_empty() || token.eq_ignore_ascii_case("close") || token.eq_ignore_ascii_case("keep-alive")
            });
            if hop_only {
                Ok(false)
            } else {
                Err(invalid(format!("connection-specific header connection: {:?}", value)))
            }
        }
        "transfer-encoding" if value.trim().eq_ignore_ascii_case("chunked") => Ok(false),
        "transfer-encoding" | "upgrade" | "keep-alive" | "proxy-connection" => {
            Err(invalid(format!("connection-specific header {}", name)))
        }
        "te" if !value.trim().eq_ignore_ascii_case("trailers") => {
            Err(invalid(format!("te header value {:?} (only \"trailers\" allowed)", value)))
        }
        _ => Ok(true),
    }
}

/// Build the request header list
///
/// `pseudo_order` and `header_order` are the connection defaults; the
/// request's own overrides win.
pub fn request_fields(
    req: &Request,
    pseudo_order: &PseudoHeaderOrder,
    header_order: Option<&[String]>,
) -> Result<Vec<HeaderField>> {
    let pseudo_order = req.pseudo_order().unwrap_or(pseudo_order);
    let header_order = req.header_order().or(header_order);

    let authority = match req.headers().get("host") {
        Some(host) => host.trim().to_string(),
        None => req.authority().to_string(),
    };
    check_field("host", &authority)?;

    let mut fields = Vec::with_capacity(req.headers().len() + 6);
    for pseudo in pseudo_order.iter() {
        let value = match pseudo {
            PseudoHeader::Method => req.method().as_str().to_string(),
            PseudoHeader::Authority => authority.clone(),
            // CONNECT carries only :method and :authority
            PseudoHeader::Scheme if req.method() == Method::Connect => continue,
            PseudoHeader::Path if req.method() == Method::Connect => continue,
            PseudoHeader::Scheme => req.scheme().as_str().to_string(),
            PseudoHeader::Path => req.path().to_string(),
        };
        fields.push(HeaderField::new(pseudo.name(), value));
    }

    let mut regular: Vec<HeaderField> = Vec::with_capacity(req.headers().len() + 2);
    for (name, value) in req.headers().iter() {
        let name = name.to_ascii_lowercase();
        check_field(&name, value)?;
        if !keep_request_field(&name, value)? {
            continue;
        }
        if name == "cookie" {
            // One field per cookie-pair compresses better (RFC 7540 Section 8.1.2.5)
            for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                regular.push(HeaderField::new("cookie", pair));
            }
            continue;
        }
        regular.push(HeaderField::new(name, value.trim()));
    }

    if let Some(trailers) = req.trailers().filter(|t| !t.is_empty()) {
        if !regular.iter().any(|f| f.name == "trailer") {
            let mut names: Vec<String> = trailers.names().iter().map(|n| n.to_ascii_lowercase()).collect();
            names.sort();
            names.dedup();
            regular.push(HeaderField::new("trailer", names.join(", ")));
        }
    }

    let content_length = req.body().content_length();
    match content_length {
        Some(len) if len > 0 || req.method().expects_body() => {
            regular.push(HeaderField::new("content-length", len.to_string()));
        }
        _ => {}
    }

    sort_regular(&mut regular, header_order);
    fields.extend(regular);
    Ok(fields)
}

/// Listed names first in list order, then the rest sorted by name
fn sort_regular(fields: &mut [HeaderField], order: Option<&[String]>) {
    let rank = |name: &str| -> usize {
        order
            .and_then(|o| o.iter().position(|n| n == name))
            .unwrap_or(usize::MAX)
    };
    fields.sort_by(|a, b| rank(&a.name).cmp(&rank(&b.name)).then_with(|| a.name.cmp(&b.name)));
}

/// Build the trailer list sent after the request body
pub fn trailer_fields(trailers: &Headers) -> Result<Vec<HeaderField>> {
    let mut fields = Vec::with_capacity(trailers.len());
    for (name, value) in trailers.iter() {
        let name = name.to_ascii_lowercase();
        check_field(&name, value)?;
        if !keep_request_field(&name, value)? {
            continue;
        }
        fields.push(HeaderField::new(name, value.trim()));
    }
    Ok(fields)
}

/// Header list size as counted by SETTINGS_MAX_HEADER_LIST_SIZE
pub fn list_size(fields: &[HeaderField]) -> u64 {
    fields.iter().map(|f| field_size(&f.name, &f.value)).sum()
}

/// Refuse to encode a list the peer said it would not accept
///
/// Checked before encoding so a rejected request leaves the shared HPACK
/// state untouched.
pub fn check_list_size(fields: &[HeaderField], peer_limit: u64) -> Result<()> {
    let size = list_size(fields);
    if size > peer_limit {
        return Err(Error::HeaderListTooLarge { size, limit: peer_limit });
    }
    Ok(())
}

/// HPACK-encode a field list
pub fn encode_fields(encoder: &mut HpackEncoder, fields: &[HeaderField], dst: &mut BytesMut) -> Result<()> {
    encoder.encode(fields.iter().map(|f| (f.name.as_str(), f.value.as_str())), dst)?;
    Ok(())
}

fn malformed(stream_id: u32, reason: impl Into<String>) -> Error {
    Error::stream(stream_id, ErrorCode::ProtocolError, reason)
}

fn is_connection_specific(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Parse a response header block into its status and regular headers
pub fn parse_response(meta: &MetaHeaders) -> Result<(Status, Headers)> {
    let id = meta.stream_id;
    if meta.truncated {
        return Err(malformed(id, "response header list exceeds local limit"));
    }

    let mut status = None;
    let mut headers = Headers::new();
    let mut seen_regular = false;
    for field in &meta.fields {
        if field.is_pseudo() {
            if seen_regular {
                return Err(malformed(id, format!("pseudo-header {} after regular header", field.name)));
            }
            if field.name != ":status" {
                return Err(malformed(id, format!("unexpected response pseudo-header {}", field.name)));
            }
            if status.is_some() {
                return Err(malformed(id, "duplicate :status"));
            }
            status = Some(
                Status::parse(&field.value)
                    .map_err(|_| malformed(id, format!("malformed :status {:?}", field.value)))?,
            );
            continue;
        }
        seen_regular = true;
        if is_connection_specific(&field.name) {
            return Err(malformed(id, format!("connection-specific response header {}", field.name)));
        }
        headers.insert(field.name.clone(), field.value.clone());
    }

    let status = status.ok_or_else(|| malformed(id, "response missing :status"))?;
    Ok((status, headers))
}

/// Parse a trailing header block
pub fn parse_trailers(meta: &MetaHeaders) -> Result<Headers> {
    let id = meta.stream_id;
    if meta.truncated {
        return Err(malformed(id, "trailer list exceeds local limit"));
    }
    let mut trailers = Headers::new();
    for field in &meta.fields {
        if field.is_pseudo() {
            return Err(malformed(id, format!("pseudo-header {} in trailers", field.name)));
        }
        trailers.insert(field.name.clone(), field.value.clone());
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RequestBody;

    fn names(fields: &[HeaderField]) -> Vec<&str> {
        fields.iter().map(|f| f.name.as_str()).collect()
    }

    fn meta(fields: &[(&str, &str)]) -> MetaHeaders {
        MetaHeaders {
            stream_id: 1,
            end_stream: false,
            priority: None,
            fields: fields.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect(),
            truncated: false,
        }
    }

    #[test]
    fn test_default_order_pseudo_first_then_sorted() {
        let req = Request::builder()
            .url("https://example.com/x?y=1")
            .header("User-Agent", "t")
            .header("Accept", "*/*")
            .build()
            .unwrap();
        let fields = request_fields(&req, &PseudoHeaderOrder::default(), None).unwrap();
        assert_eq!(
            names(&fields),
            vec![":authority", ":method", ":path", ":scheme", "accept", "user-agent"]
        );
        assert_eq!(fields[0].value, "example.com");
        assert_eq!(fields[2].value, "/x?y=1");
    }

    #[test]
    fn test_request_order_overrides() {
        let req = Request::builder()
            .url("https://example.com/")
            .header("accept", "*/*")
            .header("user-agent", "t")
            .header("x-z", "1")
            .header_order(["user-agent", "accept"])
            .pseudo_order(PseudoHeaderOrder::chrome())
            .build()
            .unwrap();
        let fields = request_fields(&req, &PseudoHeaderOrder::default(), None).unwrap();
        assert_eq!(
            names(&fields),
            vec![":method", ":authority", ":scheme", ":path", "user-agent", "accept", "x-z"]
        );
    }

    #[test]
    fn test_host_header_overrides_authority() {
        let req = Request::builder()
            .url("https://10.0.0.1/")
            .header("Host", "example.org")
            .build()
            .unwrap();
        let fields = request_fields(&req, &PseudoHeaderOrder::default(), None).unwrap();
        assert_eq!(fields[0].value, "example.org");
        assert!(!names(&fields).contains(&"host"));
    }

    #[test]
    fn test_cookie_split() {
        let req = Request::builder()
            .url("https://example.com/")
            .header("Cookie", "a=1; b=2;c=3")
            .build()
            .unwrap();
        let fields = request_fields(&req, &PseudoHeaderOrder::default(), None).unwrap();
        let cookies: Vec<&str> = fields.iter().filter(|f| f.name == "cookie").map(|f| f.value.as_str()).collect();
        assert_eq!(cookies, vec!["a=1", "b=2", "c=3"]);
    }

    #[test]
    fn test_connection_specific_headers() {
        let build = |name: &str, value: &str| {
            Request::builder()
                .url("https://example.com/")
                .header(name, value)
                .build()
                .unwrap()
        };
        let order = PseudoHeaderOrder::default();

        let fields = request_fields(&build("Connection", "close"), &order, None).unwrap();
        assert!(!names(&fields).contains(&"connection"));
        assert!(request_fields(&build("te", "trailers"), &order, None).is_ok());

        for (name, value) in [
            ("Connection", "upgrade"),
            ("Upgrade", "websocket"),
            ("Keep-Alive", "timeout=5"),
            ("Transfer-Encoding", "gzip"),
            ("TE", "gzip"),
        ] {
            let err = request_fields(&build(name, value), &order, None).unwrap_err();
            assert!(matches!(err, Error::InvalidHeader(_)), "{} accepted", name);
        }
    }

    #[test]
    fn test_content_length_and_trailer_header() {
        let req = Request::builder()
            .method(Method::Post)
            .url("https://example.com/upload")
            .body(RequestBody::from_bytes("hello"))
            .trailer("X-Checksum", "abc")
            .build()
            .unwrap();
        let fields = request_fields(&req, &PseudoHeaderOrder::default(), None).unwrap();
        let get = |n: &str| fields.iter().find(|f| f.name == n).map(|f| f.value.as_str());
        assert_eq!(get("content-length"), Some("5"));
        assert_eq!(get("trailer"), Some("x-checksum"));

        // Empty POST still declares its length; empty GET does not
        let post = Request::builder().method(Method::Post).url("https://example.com/").build().unwrap();
        let fields = request_fields(&post, &PseudoHeaderOrder::default(), None).unwrap();
        assert!(fields.iter().any(|f| f.name == "content-length" && f.value == "0"));
        let get = Request::builder().url("https://example.com/").build().unwrap();
        let fields = request_fields(&get, &PseudoHeaderOrder::default(), None).unwrap();
        assert!(!fields.iter().any(|f| f.name == "content-length"));
    }

    #[test]
    fn test_list_size_check() {
        let fields = vec![HeaderField::new(":method", "GET"), HeaderField::new("x-a", "1234")];
        assert_eq!(list_size(&fields), 7 + 3 + 32 + 3 + 4 + 32);
        assert!(check_list_size(&fields, 81).is_ok());
        assert!(matches!(
            check_list_size(&fields, 80),
            Err(Error::HeaderListTooLarge { size: 81, limit: 80 })
        ));
    }

    #[test]
    fn test_pseudo_order_parse() {
        assert_eq!(PseudoHeaderOrder::parse("m,a,s,p").unwrap(), PseudoHeaderOrder::chrome());
        assert_eq!(
            PseudoHeaderOrder::parse(":method, :path, :authority, :scheme").unwrap(),
            PseudoHeaderOrder::firefox()
        );
        assert!(PseudoHeaderOrder::parse("m,a,s").is_err());
        assert!(PseudoHeaderOrder::parse("m,m,s,p").is_err());
        assert_eq!(PseudoHeaderOrder::default().to_string(), ":authority,:method,:path,:scheme");
    }

    #[test]
    fn test_parse_response() {
        let (status, headers) = parse_response(&meta(&[
            (":status", "200"),
            ("content-type", "text/plain"),
            ("x-a", "1"),
            ("x-b", "2"),
        ]))
        .unwrap();
        assert_eq!(status.code(), 200);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("x-b"), Some("2"));
    }

    #[test]
    fn test_parse_response_rejects_malformed() {
        for fields in [
            vec![("content-type", "text/plain")],
            vec![(":status", "20x")],
            vec![(":status", "200"), (":path", "/")],
            vec![(":status", "200"), ("connection", "close")],
            vec![("x-a", "1"), (":status", "200")],
        ] {
            let err = parse_response(&meta(&fields)).unwrap_err();
            assert!(matches!(err, Error::Stream { code: ErrorCode::ProtocolError, .. }), "{:?}", fields);
        }
    }

    #[test]
    fn test_parse_trailers() {
        let trailers = parse_trailers(&meta(&[("x-checksum", "abc")])).unwrap();
        assert_eq!(trailers.get("x-checksum"), Some("abc"));
        assert!(parse_trailers(&meta(&[(":status", "200")])).is_err());
    }
}
