// Stop-string detection for token generation

/// Outcome of feeding one detokenized piece to a [`StopMatcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum StopCheck {
    /// Keep generating. `release` is text that can no longer turn into a
    /// stop string and is safe to show.
    Continue { release: String },
    /// A stop string completed. The accumulated text has been truncated at
    /// its earliest occurrence; `release` is the final visible text.
    Stop { release: String, matched: String },
}

/// Accumulates generated text and truncates at the earliest stop string.
///
/// Text that might be the beginning of a stop string is held back until the
/// next piece disambiguates it, so streamed fragments never contain any part
/// of a stop string.
#[derive(Debug, Clone)]
pub struct StopMatcher {
    stops: Vec<String>,
    text: String,
    /// Byte offset up to which text has been released.
    released: usize,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            text: String::new(),
            released: 0,
        }
    }

    pub fn push(&mut self, piece: &str) -> StopCheck {
        self.text.push_str(piece);

        if let Some((at, matched)) = self.earliest_match() {
            self.text.truncate(at);
            let release = self.take_release(at);
            return StopCheck::Stop { release, matched };
        }

        let safe_end = self.text.len() - self.held_suffix_len();
        let release = self.take_release(safe_end);
        StopCheck::Continue { release }
    }

    /// Release whatever is still held back. Called once generation ends for
    /// a reason other than a stop string.
    pub fn finish(&mut self) -> String {
        self.take_release(self.text.len())
    }

    pub fn into_text(self) -> String {
        self.text
    }

    fn take_release(&mut self, end: usize) -> String {
        if end <= self.released {
            return String::new();
        }
        let out = self.text[self.released..end].to_string();
        self.released = end;
        out
    }

    /// Earliest byte offset at which any stop string occurs.
    fn earliest_match(&self) -> Option<(usize, String)> {
        self.stops
            .iter()
            .filter_map(|stop| self.text.find(stop.as_str()).map(|at| (at, stop)))
            .min_by_key(|(at, _)| *at)
            .map(|(at, stop)| (at, stop.clone()))
    }

    /// Length of the longest suffix of the text that is a proper prefix of a
    /// stop string.
    fn held_suffix_len(&self) -> usize {
        let longest = self.stops.iter().map(String::len).max().unwrap_or(0);
        let max_hold = longest.saturating_sub(1).min(self.text.len());

        for k in (1..=max_hold).rev() {
            let start = self.text.len() - k;
            if !self.text.is_char_boundary(start) {
                continue;
            }
            let suffix = &self.text[start..];
            if self.stops.iter().any(|stop| stop.starts_with(suffix)) {
                return k;
            }
        }
        0
    }
}
