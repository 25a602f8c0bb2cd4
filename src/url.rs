//! LDAP URL parsing and building (RFC 4516).
//!
//! ```text
//! scheme://hostport/dn[?attrs[?scope[?filter[?exts]]]]
//! ```
//!
//! Parsing percent-decodes every component. Serializing encodes only the
//! characters that would be ambiguous in their segment, so the text of a
//! round-tripped URL may differ while its fields do not.

use crate::config::{ProtocolScheme, Scope};
use crate::error::UrlError;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use std::str::FromStr;

/// Filter applied when the URL leaves the filter segment empty.
pub const DEFAULT_FILTER: &str = "(objectClass=*)";

/// Characters escaped in the DN and filter segments.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Attribute and extension lists additionally use `,` as separator.
const LIST_ITEM: &AsciiSet = &SEGMENT.add(b',').add(b'!').add(b'=');

/// `ldapi` hosts are socket paths; `/` and `:` must not leak into the URL.
const SOCKET_PATH: &AsciiSet = &SEGMENT.add(b'/').add(b':').add(b',');

/// One entry of the extensions segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Extension {
    pub critical: bool,
    pub name: String,
    pub value: Option<String>,
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.critical {
            f.write_str("!")?;
        }
        write!(f, "{}", utf8_percent_encode(&self.name, LIST_ITEM))?;
        if let Some(value) = &self.value {
            write!(f, "={}", utf8_percent_encode(value, LIST_ITEM))?;
        }
        Ok(())
    }
}

/// Parsed LDAP URL.
#[derive(Debug, Clone)]
pub struct LdapUrl {
    source: String,
    scheme: ProtocolScheme,
    host: String,
    port: u16,
    dn: String,
    attributes: Vec<String>,
    scope: Scope,
    filter: String,
    extensions: Vec<Extension>,
}

/// Semantic equality: the source text is ignored.
impl PartialEq for LdapUrl {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.host == other.host
            && self.port == other.port
            && self.dn == other.dn
            && self.attributes == other.attributes
            && self.scope == other.scope
            && self.filter == other.filter
            && self.extensions == other.extensions
    }
}

impl Eq for LdapUrl {}

impl Default for LdapUrl {
    fn default() -> Self {
        Self {
            source: "ldap://localhost/".to_string(),
            scheme: ProtocolScheme::Ldap,
            host: "localhost".to_string(),
            port: 389,
            dn: String::new(),
            attributes: Vec::new(),
            scope: Scope::Base,
            filter: DEFAULT_FILTER.to_string(),
            extensions: Vec::new(),
        }
    }
}

/// Borrowed split of a URL into its raw segments. Used by both the full parser
/// and [`test_url`], which must not build an owned structure.
struct RawUrl<'a> {
    scheme: ProtocolScheme,
    host: &'a str,
    port: Option<&'a str>,
    dn: &'a str,
    attrs: &'a str,
    scope: &'a str,
    filter: &'a str,
    exts: &'a str,
}

impl<'a> RawUrl<'a> {
    fn split(input: &'a str) -> Result<Self, UrlError> {
        let input = input.trim();
        let (token, rest) = input
            .split_once("://")
            .ok_or_else(|| UrlError::Malformed("missing \"://\"".to_string()))?;
        let scheme = ProtocolScheme::from_token(token)
            .ok_or_else(|| UrlError::BadScheme(token.to_string()))?;

        let (hostport, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        if hostport.contains('?') {
            return Err(UrlError::Malformed("\"?\" before the base DN".to_string()));
        }

        let (host, port) = split_hostport(scheme, hostport)?;

        let mut segments = path.split('?');
        let dn = segments.next().unwrap_or("");
        let attrs = segments.next().unwrap_or("");
        let scope = segments.next().unwrap_or("");
        let filter = segments.next().unwrap_or("");
        let exts = segments.next().unwrap_or("");
        if segments.next().is_some() {
            return Err(UrlError::Malformed("too many \"?\" separators".to_string()));
        }

        Ok(Self {
            scheme,
            host,
            port,
            dn,
            attrs,
            scope,
            filter,
            exts,
        })
    }

    /// Syntax checks that do not allocate.
    fn check(&self) -> Result<(), UrlError> {
        self.port_number()?;
        for segment in [self.host, self.dn, self.attrs, self.filter, self.exts] {
            check_escapes(segment)?;
        }
        if !self.scope.is_empty() && Scope::from_url_token(self.scope).is_none() {
            return Err(bad_scope(self.scope));
        }
        if !self.exts.is_empty() {
            for ext in self.exts.split(',') {
                let name = ext.strip_prefix('!').unwrap_or(ext);
                let name = name.split_once('=').map_or(name, |(n, _)| n);
                if name.is_empty() {
                    return Err(UrlError::Malformed("empty extension".to_string()));
                }
            }
        }
        Ok(())
    }

    fn port_number(&self) -> Result<u16, UrlError> {
        match self.port {
            None | Some("") => Ok(self.scheme.default_port()),
            Some(p) => p.parse().map_err(|_| UrlError::BadPort(p.to_string())),
        }
    }
}

fn split_hostport(scheme: ProtocolScheme, hostport: &str) -> Result<(&str, Option<&str>), UrlError> {
    if scheme == ProtocolScheme::Ldapi {
        return Ok((hostport, None));
    }
    if let Some(bracketed) = hostport.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| UrlError::Malformed("unterminated \"[\" in host".to_string()))?;
        return match after {
            "" => Ok((host, None)),
            _ => after
                .strip_prefix(':')
                .map(|port| (host, Some(port)))
                .ok_or_else(|| UrlError::Malformed("garbage after \"]\" in host".to_string())),
        };
    }
    Ok(match hostport.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (hostport, None),
    })
}

fn bad_scope(token: &str) -> UrlError {
    UrlError::Malformed(format!("invalid scope {:?}", token))
}

/// Checks that every `%` escape is two hex digits and that the decoded bytes
/// are UTF-8.
fn check_escapes(segment: &str) -> Result<(), UrlError> {
    let bytes = segment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(UrlError::BadEncoding(segment.to_string()));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    if segment.contains('%') && !decodes_to_utf8(segment) {
        return Err(UrlError::BadEncoding(segment.to_string()));
    }
    Ok(())
}

/// UTF-8 check over the decoded byte stream, one character at a time.
fn decodes_to_utf8(segment: &str) -> bool {
    let mut bytes = percent_decode_str(segment);
    let mut buf = [0u8; 4];
    while let Some(lead) = bytes.next() {
        let width = match lead {
            0x00..=0x7f => 1,
            0xc2..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf4 => 4,
            _ => return false,
        };
        buf[0] = lead;
        for slot in buf.iter_mut().take(width).skip(1) {
            match bytes.next() {
                Some(b) => *slot = b,
                None => return false,
            }
        }
        if std::str::from_utf8(&buf[..width]).is_err() {
            return false;
        }
    }
    true
}

fn decode(segment: &str) -> Result<String, UrlError> {
    check_escapes(segment)?;
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| UrlError::BadEncoding(segment.to_string()))
}

/// Pure syntax check of an LDAP URL. Performs no I/O.
pub fn test_url(input: &str) -> bool {
    RawUrl::split(input).and_then(|raw| raw.check()).is_ok()
}

impl LdapUrl {
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let raw = RawUrl::split(input)?;
        raw.check()?;

        let mut attributes = raw
            .attrs
            .split(',')
            .filter(|a| !a.is_empty())
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;
        // A lone `*` (escaped or not) asks for all attributes, same as empty.
        if attributes.len() == 1 && attributes[0] == "*" {
            attributes.clear();
        }

        let scope = match raw.scope {
            "" => Scope::Base,
            token => Scope::from_url_token(token).ok_or_else(|| bad_scope(token))?,
        };

        let filter = match raw.filter {
            "" => DEFAULT_FILTER.to_string(),
            f => decode(f)?,
        };

        let extensions = match raw.exts {
            "" => Vec::new(),
            list => list
                .split(',')
                .map(|ext| {
                    let (critical, body) = match ext.strip_prefix('!') {
                        Some(body) => (true, body),
                        None => (false, ext),
                    };
                    let (name, value) = match body.split_once('=') {
                        Some((n, v)) => (decode(n)?, Some(decode(v)?)),
                        None => (decode(body)?, None),
                    };
                    Ok(Extension { critical, name, value })
                })
                .collect::<Result<Vec<_>, UrlError>>()?,
        };

        Ok(Self {
            source: input.trim().to_string(),
            scheme: raw.scheme,
            host: decode(raw.host)?,
            port: raw.port_number()?,
            dn: decode(raw.dn)?,
            attributes,
            scope,
            filter,
            extensions,
        })
    }

    /// The text this URL was parsed from, or its serialization after a setter
    /// changed it.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn scheme(&self) -> ProtocolScheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Requested attributes. Empty means all attributes.
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// True if any extension is marked critical.
    pub fn has_critical_extensions(&self) -> bool {
        self.extensions.iter().any(|e| e.critical)
    }

    /// Fails on the first critical extension whose name is not in `known`
    /// (compared case-insensitively).
    pub fn validate_extensions(&self, known: &[&str]) -> Result<(), UrlError> {
        match self
            .extensions
            .iter()
            .find(|e| e.critical && !known.iter().any(|k| k.eq_ignore_ascii_case(&e.name)))
        {
            Some(ext) => Err(UrlError::UnsupportedCriticalExtension(ext.name.clone())),
            None => Ok(()),
        }
    }

    /// `scheme://host[:port]/` without any search component.
    pub fn connection_url(&self) -> String {
        format!("{}://{}/", self.scheme, self.hostport())
    }

    pub fn set_scheme(&mut self, scheme: ProtocolScheme) {
        if self.port == self.scheme.default_port() {
            self.port = scheme.default_port();
        }
        self.scheme = scheme;
        self.refresh();
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_string();
        self.refresh();
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
        self.refresh();
    }

    pub fn set_dn(&mut self, dn: &str) {
        self.dn = dn.to_string();
        self.refresh();
    }

    pub fn set_attributes<I, S>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes
            .into_iter()
            .map(Into::into)
            .filter(|a: &String| !a.is_empty() && a != "*")
            .collect();
        self.refresh();
    }

    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
        self.refresh();
    }

    pub fn set_filter(&mut self, filter: &str) {
        self.filter = if filter.is_empty() {
            DEFAULT_FILTER.to_string()
        } else {
            filter.to_string()
        };
        self.refresh();
    }

    pub fn push_extension(&mut self, extension: Extension) {
        self.extensions.push(extension);
        self.refresh();
    }

    fn refresh(&mut self) {
        self.source = self.to_string();
    }

    fn hostport(&self) -> String {
        match self.scheme {
            ProtocolScheme::Ldapi => utf8_percent_encode(&self.host, SOCKET_PATH).to_string(),
            _ => {
                let host = if self.host.contains(':') {
                    format!("[{}]", self.host)
                } else {
                    utf8_percent_encode(&self.host, SEGMENT).to_string()
                };
                if self.port == self.scheme.default_port() {
                    host
                } else {
                    format!("{}:{}", host, self.port)
                }
            }
        }
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.scheme,
            self.hostport(),
            utf8_percent_encode(&self.dn, SEGMENT)
        )?;

        // Emit segments only up to the last one that differs from its default.
        let has_exts = !self.extensions.is_empty();
        let has_filter = has_exts || self.filter != DEFAULT_FILTER;
        let has_scope = has_filter || self.scope != Scope::Base;
        let has_attrs = has_scope || !self.attributes.is_empty();

        if has_attrs {
            f.write_str("?")?;
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|a| utf8_percent_encode(a, LIST_ITEM).to_string())
                .collect();
            f.write_str(&attrs.join(","))?;
        }
        if has_scope {
            write!(f, "?{}", self.scope.as_url_token())?;
        }
        if has_filter {
            write!(f, "?{}", utf8_percent_encode(&self.filter, SEGMENT))?;
        }
        if has_exts {
            let exts: Vec<String> = self.extensions.iter().map(ToString::to_string).collect();
            write!(f, "?{}", exts.join(","))?;
        }
        Ok(())
    }
}

impl FromStr for LdapUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
