use serde::Serialize;

#[derive(Debug, PartialEq, Eq, Serialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// An SMTP reply produced, or substituted, by policy
#[derive(Debug, PartialEq, Eq, Serialize, Clone)]
#[must_use]
pub struct Reply {
    /// SMTP 3-digit response code
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// The textual portion of the response to send
    pub text: String,
}

impl Reply {
    pub fn new<S: Into<String>>(
        code: u16,
        enhanced_code: Option<EnhancedStatusCode>,
        text: S,
    ) -> Self {
        Self {
            code,
            enhanced_code,
            text: text.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{enh} "));
        }
        for (idx, text) in self.text.lines().enumerate() {
            if idx > 0 {
                line.push(' ');
            }
            line.push_str(text);
        }
        line
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.to_single_line())
    }
}
