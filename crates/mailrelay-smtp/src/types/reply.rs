//! Server replies.

/// One (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code shared by every line.
    pub code: ReplyCode,
    /// Text of each line, without code or separator.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a reply from its lines.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Creates a single-line reply.
    #[must_use]
    pub fn single(code: u16, text: impl Into<String>) -> Self {
        Self::new(ReplyCode::new(code), vec![text.into()])
    }

    /// Returns true for 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Enhanced status code (RFC 3463) leading the first line, e.g. `5.1.1`.
    ///
    /// Returns `None` when the text does not start with one or its class
    /// disagrees with the reply code.
    #[must_use]
    pub fn enhanced_code(&self) -> Option<&str> {
        let first = self.message.first()?;
        let candidate = first.split_whitespace().next()?;
        let mut parts = candidate.split('.');
        let class = parts.next()?;
        let subject = parts.next()?;
        let detail = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let numeric = |part: &str, max: usize| {
            (1..=max).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit())
        };
        let class_matches =
            class.len() == 1 && class.parse::<u16>().ok() == Some(self.code.as_u16() / 100);
        (class_matches && numeric(subject, 3) && numeric(detail, 3)).then_some(candidate)
    }

    /// All lines joined with newlines.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message.join(" / "))
    }
}

/// Three-digit reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// 220 service ready.
    pub const SERVICE_READY: Self = Self(220);
    /// 250 requested action completed.
    pub const OK: Self = Self(250);
    /// 334 authentication challenge.
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 start message input.
    pub const START_DATA: Self = Self(354);
    /// 450 mailbox busy.
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 550 mailbox unavailable.
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 552 message exceeds storage allocation.
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 553 mailbox name not allowed.
    pub const MAILBOX_NAME_NOT_ALLOWED: Self = Self(553);

    /// Wraps a numeric code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Numeric value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true for 2xx.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self.0, 200..=299)
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
