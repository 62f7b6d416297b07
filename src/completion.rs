//! Argument completion
//!
//! Resolves a partially typed argument value into ranked suggestions. Prompt
//! arguments and resource template arguments share the same resolution
//! rules; only the place the [`CompletionSource`] comes from differs.
//!
//! 1. An explicit [`Completer`] wins and its result is returned as-is.
//! 2. Otherwise a static enum is fuzzy-ranked against the partial value.
//! 3. Otherwise the result is empty.

use std::future::Future;
use std::sync::Arc;

use crate::error::{BoxError, Error, Result};
use crate::protocol::{Completion, MAX_COMPLETION_VALUES};
use crate::tool::BoxFuture;

/// Highest error score a candidate may have and still be suggested.
const MATCH_THRESHOLD: f64 = 0.6;

/// Caller-defined completion logic for a single argument
pub trait Completer: Send + Sync {
    fn complete(&self, value: String) -> BoxFuture<'_, std::result::Result<Completion, BoxError>>;
}

/// Shared handle to a completer
pub type CompleterHandle = Arc<dyn Completer>;

struct FnCompleter<F> {
    f: F,
}

impl<F, Fut> Completer for FnCompleter<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Completion, BoxError>> + Send + 'static,
{
    fn complete(&self, value: String) -> BoxFuture<'_, std::result::Result<Completion, BoxError>> {
        Box::pin((self.f)(value))
    }
}

/// Wrap an async function as a [`CompleterHandle`]
///
/// ```rust
/// use toolbox_mcp::completion::completer_fn;
/// use toolbox_mcp::protocol::Completion;
///
/// let languages = completer_fn(|value: String| async move {
///     let all = ["rust", "ruby", "go"];
///     let values = all
///         .iter()
///         .filter(|l| l.starts_with(&value))
///         .map(|l| l.to_string())
///         .collect();
///     Ok(Completion::new(values))
/// });
/// # let _ = languages;
/// ```
pub fn completer_fn<F, Fut>(f: F) -> CompleterHandle
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Completion, BoxError>> + Send + 'static,
{
    Arc::new(FnCompleter { f })
}

/// Where the suggestions for one argument come from
#[derive(Clone, Default)]
pub struct CompletionSource {
    pub completer: Option<CompleterHandle>,
    pub enum_values: Option<Vec<String>>,
}

impl std::fmt::Debug for CompletionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSource")
            .field("completer", &self.completer.is_some())
            .field("enum_values", &self.enum_values)
            .finish()
    }
}

impl CompletionSource {
    pub fn completer(completer: CompleterHandle) -> Self {
        Self {
            completer: Some(completer),
            enum_values: None,
        }
    }

    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            completer: None,
            enum_values: Some(values.into_iter().map(Into::into).collect()),
        }
    }

    /// True if this source can produce any suggestion at all
    pub fn can_complete(&self) -> bool {
        self.completer.is_some() || self.enum_values.is_some()
    }
}

/// Resolve a partial value against a completion source.
pub async fn resolve(source: &CompletionSource, value: &str) -> Result<Completion> {
    if let Some(completer) = &source.completer {
        let completion = completer
            .complete(value.to_string())
            .await
            .map_err(|e| Error::Internal(format!("Error completing argument: {}", e)))?;

        if completion.values.len() > MAX_COMPLETION_VALUES {
            return Err(Error::unexpected_state_with(
                format!(
                    "Completer returned {} values, the maximum is {}",
                    completion.values.len(),
                    MAX_COMPLETION_VALUES
                ),
                serde_json::json!({ "count": completion.values.len() }),
            ));
        }
        return Ok(completion);
    }

    if let Some(values) = &source.enum_values {
        let matches = fuzzy_rank(values, value);
        let total = matches.len();
        let values: Vec<String> = matches.into_iter().take(MAX_COMPLETION_VALUES).collect();
        return Ok(Completion::new(values)
            .with_total(total)
            .with_has_more(total > MAX_COMPLETION_VALUES));
    }

    Ok(Completion::default())
}

/// Rank candidates by similarity to `query`, best first.
///
/// Each candidate is scored by sliding a query-sized window over it and
/// taking the closest window; matches further into the candidate score
/// slightly worse. An empty query keeps every candidate in order.
pub fn fuzzy_rank(candidates: &[String], query: &str) -> Vec<String> {
    if query.is_empty() {
        return candidates.to_vec();
    }

    let query = query.to_lowercase();
    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .filter_map(|candidate| {
            let score = match_score(&candidate.to_lowercase(), &query);
            (score <= MATCH_THRESHOLD).then_some((score, candidate))
        })
        .collect();

    // stable: equal scores keep declaration order
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.into_iter().map(|(_, c)| c.clone()).collect()
}

fn match_score(candidate: &str, query: &str) -> f64 {
    let chars: Vec<char> = candidate.chars().collect();
    let width = query.chars().count();

    if chars.len() <= width {
        return 1.0 - strsim::normalized_damerau_levenshtein(candidate, query);
    }

    let mut best = f64::MAX;
    for start in 0..=(chars.len() - width) {
        let window: String = chars[start..start + width].iter().collect();
        let similarity = strsim::normalized_damerau_levenshtein(&window, query);
        let score = (1.0 - similarity) + start as f64 / 100.0;
        if score < best {
            best = score;
        }
    }
    best
}
