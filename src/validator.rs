//! Response validators.
//!
//! A validator is a predicate over a raw [`Response`]. A response it rejects
//! is handled exactly like a transport failure: the session retries, then
//! reconnects, then gives up.
//!
//! Without an explicit validator the session applies [`accepts_by_default`]:
//! write acknowledgements pass, data responses must be non-blank and not a
//! textual NaN.

use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::transport::Response;

/// Named predicate over responses.
#[derive(Clone)]
pub struct Validator {
    name: Arc<str>,
    check: Arc<dyn Fn(&Response) -> bool + Send + Sync>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Validator").field(&self.name).finish()
    }
}

impl Validator {
    /// Wrap a predicate. `name` shows up in rejection messages.
    pub fn new<F>(name: &str, check: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            check: Arc::new(check),
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the predicate.
    pub fn check(&self, response: &Response) -> bool {
        (self.check)(response)
    }

    /// The default acceptance rule as a validator.
    pub fn default_rule() -> Self {
        Self::new("default", accepts_by_default)
    }

    /// Data responses must parse as a finite float.
    pub fn numeric() -> Self {
        Self::new("numeric", |response| {
            response.as_f64().is_some_and(f64::is_finite)
        })
    }

    /// Data response text must equal one of `options` (case-insensitive).
    pub fn one_of(options: &[&str]) -> Self {
        let options: Vec<String> = options.iter().map(|o| o.to_ascii_lowercase()).collect();
        Self::new("one_of", move |response| {
            let text = response.text().to_ascii_lowercase();
            options.iter().any(|o| *o == text)
        })
    }

    /// Data response text must match `pattern`.
    pub fn matches(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        Ok(Self::new(pattern, move |response| {
            regex.is_match(&response.text())
        }))
    }

    /// Data response must be exactly `length` bytes.
    pub fn length(length: usize) -> Self {
        Self::new("length", move |response| response.bytes().len() == length)
    }
}

/// Acceptance rule applied when the caller gives no validator.
pub fn accepts_by_default(response: &Response) -> bool {
    if response.is_ack() {
        return true;
    }
    let text = response.text();
    let unsigned = text.strip_prefix(&['+', '-'][..]).unwrap_or(&*text);
    !text.is_empty() && !unsigned.eq_ignore_ascii_case("nan")
}
