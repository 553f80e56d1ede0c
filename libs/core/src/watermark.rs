use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque upstream cursor. Never compared by value, only replaced.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorTracker {
    current: Option<Watermark>,
}

impl CursorTracker {
    pub fn new(initial: Option<Watermark>) -> Self {
        Self { current: initial }
    }

    /// Replaces the cursor. A fetch that carried no watermark leaves it as is.
    pub fn advance(&mut self, next: Option<Watermark>) {
        if let Some(next) = next.filter(|wm| !wm.as_str().is_empty()) {
            self.current = Some(next);
        }
    }

    pub fn current(&self) -> Option<&Watermark> {
        self.current.as_ref()
    }

    pub fn as_query(&self) -> Option<&str> {
        self.current.as_ref().map(Watermark::as_str)
    }
}
