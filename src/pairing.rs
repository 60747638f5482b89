//! Session identity shared with the viewer as a `cc://` pairing URI.

use std::path::Path;

use qrcode::render::unicode::Dense1x2;
use qrcode::QrCode;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{BridgeError, Result};

pub const SESSION_ID_LEN: usize = 16;
pub const SECRET_LEN: usize = 32;
const URI_SCHEME: &str = "cc";
const FALLBACK_NAME: &str = "Terminal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPairing {
    pub session_id: String,
    pub secret: String,
    pub display_name: Option<String>,
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl SessionPairing {
    pub fn generate(display_name: Option<String>) -> Self {
        Self {
            session_id: random_token(SESSION_ID_LEN),
            secret: random_token(SECRET_LEN),
            display_name: display_name.filter(|name| !name.trim().is_empty()),
        }
    }

    pub fn to_uri(&self) -> String {
        match &self.display_name {
            Some(name) => format!(
                "{URI_SCHEME}://{}:{}:{}",
                self.session_id,
                self.secret,
                urlencoding::encode(name)
            ),
            None => format!("{URI_SCHEME}://{}:{}", self.session_id, self.secret),
        }
    }

    /// The pairing URI as a QR code drawn with half-block characters, light
    /// on dark so it scans from a dark terminal. `None` if the URI does not
    /// fit in a QR symbol.
    pub fn render_qr(&self) -> Option<String> {
        let code = QrCode::new(self.to_uri().as_bytes()).ok()?;
        Some(
            code.render::<Dense1x2>()
                .dark_color(Dense1x2::Light)
                .light_color(Dense1x2::Dark)
                .build(),
        )
    }

    /// Parse `cc://id:secret[:name]`. Any scheme is tolerated; a bare
    /// `id:secret` works too.
    pub fn parse(uri: &str) -> Result<Self> {
        let body = uri
            .trim()
            .split_once("://")
            .map_or(uri.trim(), |(_, rest)| rest);
        let mut parts = body.splitn(3, ':');
        let session_id = parts.next().unwrap_or_default();
        let secret = parts.next().unwrap_or_default();
        if session_id.is_empty() || secret.is_empty() {
            return Err(BridgeError::Pairing(format!(
                "expected {URI_SCHEME}://<id>:<secret>[:<name>], got `{uri}`"
            )));
        }
        let display_name = match parts.next().filter(|name| !name.is_empty()) {
            Some(encoded) => Some(
                urlencoding::decode(encoded)
                    .map_err(|error| BridgeError::Pairing(format!("bad session name: {error}")))?
                    .into_owned(),
            ),
            None => None,
        };
        Ok(Self {
            session_id: session_id.to_string(),
            secret: secret.to_string(),
            display_name,
        })
    }
}

/// Name shown to the viewer when `--name` is absent: the working
/// directory's name, unless that is the filesystem root or the user's own
/// name.
pub fn default_session_name(cwd: &Path, user: Option<&str>) -> String {
    match cwd.file_name().and_then(|name| name.to_str()) {
        Some(name) if !name.is_empty() && Some(name) != user => name.to_string(),
        _ => FALLBACK_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn generated_ids_are_alphanumeric() {
        let pairing = SessionPairing::generate(None);
        assert_eq!(pairing.session_id.len(), SESSION_ID_LEN);
        assert_eq!(pairing.secret.len(), SECRET_LEN);
        assert!(pairing.secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pairing.secret, SessionPairing::generate(None).secret);
    }

    #[test]
    fn uri_encodes_display_name() {
        let pairing = SessionPairing {
            session_id: "abc".into(),
            secret: "s3cr3t".into(),
            display_name: Some("my app: v2".into()),
        };
        let uri = pairing.to_uri();
        assert_eq!(uri, "cc://abc:s3cr3t:my%20app%3A%20v2");
        assert_eq!(SessionPairing::parse(&uri).unwrap(), pairing);
    }

    #[test]
    fn qr_code_is_a_square_block() {
        let pairing = SessionPairing::generate(Some("api".into()));
        let qr = pairing.render_qr().expect("uri fits in a QR symbol");
        let rows: Vec<&str> = qr.lines().collect();
        let width = rows[0].chars().count();
        assert!(width > 20);
        assert!(rows.iter().all(|row| row.chars().count() == width));
        // Two modules per character cell vertically.
        assert_eq!(rows.len(), width.div_ceil(2));
        assert!(qr.chars().all(|c| matches!(c, ' ' | '█' | '▀' | '▄' | '\n')));
    }

    #[test]
    fn oversized_uri_has_no_qr_code() {
        let pairing = SessionPairing {
            session_id: "abc".into(),
            secret: "x".repeat(8000),
            display_name: None,
        };
        assert!(pairing.render_qr().is_none());
    }

    #[test]
    fn parse_without_name_or_scheme() {
        let pairing = SessionPairing::parse("abc:def").unwrap();
        assert_eq!(pairing.session_id, "abc");
        assert_eq!(pairing.display_name, None);

        let pairing = SessionPairing::parse("cc://abc:def:").unwrap();
        assert_eq!(pairing.display_name, None);
    }

    #[test]
    fn parse_rejects_missing_secret() {
        assert!(matches!(
            SessionPairing::parse("cc://abc"),
            Err(BridgeError::Pairing(_))
        ));
        assert!(SessionPairing::parse("cc://:secret").is_err());
    }

    #[test]
    fn default_name_falls_back_for_root_and_home() {
        assert_eq!(default_session_name(Path::new("/work/cc-bridge"), Some("ana")), "cc-bridge");
        assert_eq!(default_session_name(Path::new("/"), Some("ana")), "Terminal");
        assert_eq!(default_session_name(Path::new("/home/ana"), Some("ana")), "Terminal");
    }
}
