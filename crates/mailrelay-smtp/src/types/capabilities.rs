//! Negotiated server capabilities.

use std::collections::HashSet;

use super::{AuthMechanism, Extension, Reply};

/// Extension set negotiated on a session.
///
/// Built from a successful EHLO/LHLO reply. A session that fell back to
/// HELO has an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Domain the server announced on the first reply line.
    pub server_name: String,
    /// Supported extensions.
    pub extensions: HashSet<Extension>,
}

impl Capabilities {
    /// Parses the multi-line EHLO/LHLO reply.
    ///
    /// The first line carries the server's domain; every following line
    /// advertises one extension.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        let server_name = reply
            .message
            .first()
            .and_then(|line| line.split_whitespace().next())
            .unwrap_or_default()
            .to_string();

        let extensions = reply
            .message
            .iter()
            .skip(1)
            .map(|line| Extension::parse(line))
            .collect();

        Self {
            server_name,
            extensions,
        }
    }

    /// Checks if the server supports an extension.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.contains(ext)
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.supports(&Extension::StartTls)
    }

    /// Checks if PIPELINING is supported.
    #[must_use]
    pub fn supports_pipelining(&self) -> bool {
        self.supports(&Extension::Pipelining)
    }

    /// Checks if 8BITMIME is supported.
    #[must_use]
    pub fn supports_8bitmime(&self) -> bool {
        self.supports(&Extension::EightBitMime)
    }

    /// Checks if SMTPUTF8 is supported.
    #[must_use]
    pub fn supports_smtputf8(&self) -> bool {
        self.supports(&Extension::SmtpUtf8)
    }

    /// Returns true if SIZE was advertised, with or without a limit.
    #[must_use]
    pub fn supports_size(&self) -> bool {
        self.extensions
            .iter()
            .any(|ext| matches!(ext, Extension::Size(_)))
    }

    /// Returns the maximum message size, if advertised.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Size(Some(size)) if *size > 0 => Some(*size),
            _ => None,
        })
    }

    /// Returns supported authentication mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Auth(mechanisms) => Some(mechanisms.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;

    fn ehlo(lines: &[&str]) -> Reply {
        Reply::new(
            ReplyCode::OK,
            lines.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn parses_extension_lines_after_greeting() {
        let caps = Capabilities::from_ehlo(&ehlo(&[
            "mx.example.com Hello client",
            "PIPELINING",
            "size 1000",
            "STARTTLS",
            "AUTH PLAIN LOGIN",
        ]));

        assert_eq!(caps.server_name, "mx.example.com");
        assert!(caps.supports_pipelining());
        assert!(caps.supports_starttls());
        assert!(caps.supports_size());
        assert_eq!(caps.max_message_size(), Some(1000));
        assert_eq!(
            caps.auth_mechanisms(),
            vec![AuthMechanism::Plain, AuthMechanism::Login]
        );
    }

    #[test]
    fn single_line_reply_has_no_extensions() {
        let caps = Capabilities::from_ehlo(&ehlo(&["mx.example.com"]));
        assert!(caps.extensions.is_empty());
        assert!(!caps.supports_pipelining());
    }

    #[test]
    fn size_zero_means_no_limit() {
        let caps = Capabilities::from_ehlo(&ehlo(&["mx", "SIZE 0"]));
        assert!(caps.supports_size());
        assert_eq!(caps.max_message_size(), None);
    }
}
