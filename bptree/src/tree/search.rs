//! Search operators over the leaf chain.
//!
//! Every operator descends to a starting leaf and walks the doubly-linked leaf
//! chain from there, stopping as soon as the key order rules out further
//! matches. Operators without a usable bound (negations, regular expressions,
//! unanchored patterns) scan the whole chain.
//!
//! # Design
//!
//! Values stored in extension blocks are only loaded when the caller asks for
//! them or a value filter has to inspect them. A count-only search over such
//! entries takes the value count from the entry itself.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use super::navigator::Navigator;
use crate::entry::{EntryValue, LeafEntry, RecordPointer};
use crate::error::TreeError;
use crate::key::Key;
use crate::layout::{LeafRecord, LeafRecordEntry};
use crate::storage::ByteStorage;

/// A search condition on keys.
#[derive(Debug, Clone)]
pub enum SearchOperator {
    Less(Key),
    LessOrEqual(Key),
    Equal(Key),
    NotEqual(Key),
    Greater(Key),
    GreaterOrEqual(Key),
    In(Vec<Key>),
    NotIn(Vec<Key>),
    /// Inclusive range. Bounds may be given in either order.
    Between(Key, Key),
    NotBetween(Key, Key),
    /// Case-insensitive glob over string keys: `*` matches any run, `?` one character.
    Like(String),
    NotLike(String),
    Matches(Regex),
    NotMatches(Regex),
    /// Any key other than the absent key.
    Exists,
    NotExists,
}

impl SearchOperator {
    /// Builds an operator from its textual name and parameters.
    ///
    /// Pattern operators take a single string key; `exists` and `!exists`
    /// take none.
    pub fn from_parts(op: &str, params: Vec<Key>) -> Result<Self, TreeError> {
        let len = params.len();
        let arity = |n: usize| {
            if len == n {
                Ok(())
            } else {
                Err(TreeError::InvalidArgument(format!(
                    "operator {op:?} takes {n} parameter(s), got {len}"
                )))
            }
        };
        let single = |params: Vec<Key>| -> Result<Key, TreeError> {
            arity(1)?;
            params
                .into_iter()
                .next()
                .ok_or_else(|| TreeError::InvalidArgument(format!("operator {op:?} needs a key")))
        };
        let pattern = |params: Vec<Key>| -> Result<String, TreeError> {
            match single(params)? {
                Key::String(s) => Ok(s),
                other => Err(TreeError::InvalidArgument(format!(
                    "operator {op:?} needs a string pattern, got {other}"
                ))),
            }
        };
        let pair = |params: Vec<Key>| -> Result<(Key, Key), TreeError> {
            arity(2)?;
            let mut it = params.into_iter();
            match (it.next(), it.next()) {
                (Some(a), Some(b)) => Ok((a, b)),
                _ => Err(TreeError::InvalidArgument(format!(
                    "operator {op:?} needs two keys"
                ))),
            }
        };

        Ok(match op {
            "<" => Self::Less(single(params)?),
            "<=" => Self::LessOrEqual(single(params)?),
            "==" => Self::Equal(single(params)?),
            "!=" => Self::NotEqual(single(params)?),
            ">" => Self::Greater(single(params)?),
            ">=" => Self::GreaterOrEqual(single(params)?),
            "in" => Self::In(params),
            "!in" => Self::NotIn(params),
            "between" => {
                let (a, b) = pair(params)?;
                Self::Between(a, b)
            }
            "!between" => {
                let (a, b) = pair(params)?;
                Self::NotBetween(a, b)
            }
            "like" => Self::Like(pattern(params)?),
            "!like" => Self::NotLike(pattern(params)?),
            "matches" => Self::Matches(compile_regex(&pattern(params)?)?),
            "!matches" => Self::NotMatches(compile_regex(&pattern(params)?)?),
            "exists" => {
                arity(0)?;
                Self::Exists
            }
            "!exists" => {
                arity(0)?;
                Self::NotExists
            }
            other => {
                return Err(TreeError::InvalidArgument(format!(
                    "unknown operator {other:?}"
                )));
            }
        })
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, TreeError> {
    Regex::new(pattern).map_err(|e| TreeError::InvalidPattern(e.to_string()))
}

/// Translates a glob into an anchored, case-insensitive regular expression.
pub fn like_regex(pattern: &str) -> Result<Regex, TreeError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| TreeError::InvalidPattern(e.to_string()))
}

/// The literal text before a glob's first wildcard.
fn like_prefix(pattern: &str) -> &str {
    pattern
        .find(['*', '?'])
        .map_or(pattern, |end| &pattern[..end])
}

/// True when every case variant of `prefix` is ASCII. `k` and `s` also fold
/// with the Kelvin sign and the long s, which sort past all ASCII text.
fn folds_within_ascii(prefix: &str) -> bool {
    prefix.is_ascii() && !prefix.contains(['k', 'K', 's', 'S'])
}

fn matches_string(regex: &Regex, key: &Key) -> bool {
    key.as_str().is_some_and(|s| regex.is_match(s))
}

/// What a search returns.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Return matching entries with their values.
    pub include_entries: bool,
    /// Return matching keys.
    pub include_keys: bool,
    /// Return all matching values in one flat list.
    pub include_values: bool,
    /// Count matching keys and values.
    pub include_count: bool,
    /// Only consider values whose record pointer is in this set.
    pub filter: Option<HashSet<RecordPointer>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            include_entries: true,
            include_keys: false,
            include_values: false,
            include_count: true,
            filter: None,
        }
    }
}

impl SearchOptions {
    /// Counts matches without materializing them.
    #[must_use]
    pub fn count_only() -> Self {
        Self {
            include_entries: false,
            include_keys: false,
            include_values: false,
            include_count: true,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl IntoIterator<Item = RecordPointer>) -> Self {
        self.filter = Some(filter.into_iter().collect());
        self
    }

    const fn needs_values(&self) -> bool {
        self.include_entries || self.include_values || self.filter.is_some()
    }
}

/// Matches found by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    pub entries: Vec<LeafEntry>,
    pub keys: Vec<Key>,
    pub values: Vec<EntryValue>,
    /// Matching keys.
    pub key_count: usize,
    /// Matching values across all matching keys.
    pub value_count: usize,
}

impl SearchResult {
    /// Record pointers of every returned entry.
    pub fn record_pointers(&self) -> impl Iterator<Item = &RecordPointer> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().map(|v| &v.record_pointer))
            .chain(self.values.iter().map(|v| &v.record_pointer))
    }
}

struct Collector<'o> {
    options: &'o SearchOptions,
    result: SearchResult,
}

impl<'o> Collector<'o> {
    fn new(options: &'o SearchOptions) -> Self {
        Self {
            options,
            result: SearchResult::default(),
        }
    }

    async fn add<S: ByteStorage>(
        &mut self,
        nav: &mut Navigator<'_, S>,
        entry: &LeafRecordEntry,
    ) -> Result<(), TreeError> {
        if !self.options.needs_values() {
            self.push(entry.key.clone(), entry.value_count(), None);
            return Ok(());
        }
        let mut values = nav.entry_values(entry).await?;
        if let Some(filter) = &self.options.filter {
            values.retain(|v| filter.contains(&v.record_pointer));
        }
        if !values.is_empty() {
            self.push(entry.key.clone(), values.len(), Some(values));
        }
        Ok(())
    }

    fn push(&mut self, key: Key, value_count: usize, values: Option<Vec<EntryValue>>) {
        let result = &mut self.result;
        if self.options.include_count {
            result.key_count += 1;
            result.value_count += value_count;
        }
        if self.options.include_keys {
            result.keys.push(key.clone());
        }
        let Some(values) = values else {
            return;
        };
        if self.options.include_values {
            result.values.extend(values.iter().cloned());
        }
        if self.options.include_entries {
            result.entries.push(LeafEntry::new(key, values));
        }
    }
}

/// Runs `operator` over the tree read by `nav`.
pub async fn search<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    operator: &SearchOperator,
    options: &SearchOptions,
) -> Result<SearchResult, TreeError> {
    let mut collector = Collector::new(options);
    match operator {
        SearchOperator::Equal(key) => equal(nav, &mut collector, key).await?,
        SearchOperator::NotExists => equal(nav, &mut collector, &Key::Absent).await?,
        SearchOperator::NotEqual(key) => scan(nav, &mut collector, |k| k != key).await?,
        SearchOperator::Exists => scan(nav, &mut collector, |k| !k.is_absent()).await?,
        SearchOperator::Less(key) => backward(nav, &mut collector, key, false).await?,
        SearchOperator::LessOrEqual(key) => backward(nav, &mut collector, key, true).await?,
        SearchOperator::Greater(key) => {
            forward(nav, &mut collector, key, |k| k > key, |_| false).await?;
        }
        SearchOperator::GreaterOrEqual(key) => {
            forward(nav, &mut collector, key, |k| k >= key, |_| false).await?;
        }
        SearchOperator::Between(a, b) => {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            forward(nav, &mut collector, low, |k| k >= low, |k| k > high).await?;
        }
        SearchOperator::NotBetween(a, b) => {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            scan(nav, &mut collector, |k| k < low || k > high).await?;
        }
        SearchOperator::In(keys) => any_of(nav, &mut collector, keys).await?,
        SearchOperator::NotIn(keys) => {
            let mut sorted = keys.clone();
            sorted.sort();
            scan(nav, &mut collector, |k| sorted.binary_search(k).is_err()).await?;
        }
        SearchOperator::Like(pattern) => like(nav, &mut collector, pattern).await?,
        SearchOperator::NotLike(pattern) => {
            let regex = like_regex(pattern)?;
            scan(nav, &mut collector, |k| !matches_string(&regex, k)).await?;
        }
        SearchOperator::Matches(regex) => {
            scan(nav, &mut collector, |k| matches_string(regex, k)).await?;
        }
        SearchOperator::NotMatches(regex) => {
            scan(nav, &mut collector, |k| !matches_string(regex, k)).await?;
        }
    }
    Ok(collector.result)
}

async fn equal<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    collector: &mut Collector<'_>,
    key: &Key,
) -> Result<(), TreeError> {
    let leaf = nav.find_leaf(key).await?;
    if let Ok(index) = leaf.search(key) {
        collector.add(nav, &leaf.entries[index]).await?;
    }
    Ok(())
}

/// Walks the whole chain, collecting entries whose key passes `keep`.
async fn scan<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    collector: &mut Collector<'_>,
    keep: impl Fn(&Key) -> bool,
) -> Result<(), TreeError> {
    let mut leaf = Some(nav.first_leaf().await?);
    while let Some(current) = leaf {
        for entry in current.entries.iter().filter(|e| keep(&e.key)) {
            collector.add(nav, entry).await?;
        }
        leaf = nav.next_leaf(&current).await?;
    }
    Ok(())
}

/// Walks forward from the leaf owning `start`, collecting entries that pass
/// `keep` until one passes `stop`.
async fn forward<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    collector: &mut Collector<'_>,
    start: &Key,
    keep: impl Fn(&Key) -> bool,
    stop: impl Fn(&Key) -> bool,
) -> Result<(), TreeError> {
    let mut leaf = Some(nav.find_leaf(start).await?);
    while let Some(current) = leaf {
        for entry in &current.entries {
            if stop(&entry.key) {
                return Ok(());
            }
            if keep(&entry.key) {
                collector.add(nav, entry).await?;
            }
        }
        leaf = nav.next_leaf(&current).await?;
    }
    Ok(())
}

/// Walks backward from the leaf owning `bound`, then reports in key order.
async fn backward<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    collector: &mut Collector<'_>,
    bound: &Key,
    inclusive: bool,
) -> Result<(), TreeError> {
    let below = |k: &Key| if inclusive { k <= bound } else { k < bound };
    let mut matched: Vec<LeafRecordEntry> = Vec::new();
    let mut leaf = Some(nav.find_leaf(bound).await?);
    while let Some(current) = leaf {
        matched.extend(current.entries.iter().rev().filter(|e| below(&e.key)).cloned());
        leaf = nav.prev_leaf(&current).await?;
    }
    for entry in matched.iter().rev() {
        collector.add(nav, entry).await?;
    }
    Ok(())
}

/// Looks up each key, reusing the current leaf while keys stay within it.
async fn any_of<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    collector: &mut Collector<'_>,
    keys: &[Key],
) -> Result<(), TreeError> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut leaf: Option<LeafRecord> = None;
    for key in &sorted {
        let reusable = leaf
            .as_ref()
            .and_then(LeafRecord::last_key)
            .is_some_and(|last| key <= last);
        if !reusable {
            leaf = Some(nav.find_leaf(key).await?);
        }
        let Some(current) = &leaf else {
            continue;
        };
        if let Ok(index) = current.search(key) {
            collector.add(nav, &current.entries[index]).await?;
        }
    }
    Ok(())
}

async fn like<S: ByteStorage>(
    nav: &mut Navigator<'_, S>,
    collector: &mut Collector<'_>,
    pattern: &str,
) -> Result<(), TreeError> {
    let regex = like_regex(pattern)?;
    let prefix = like_prefix(pattern);
    if prefix.is_empty() || !folds_within_ascii(prefix) {
        return scan(nav, collector, |k| matches_string(&regex, k)).await;
    }
    // Case variants of an ASCII prefix sort between its all-uppercase and
    // all-lowercase spellings.
    let lowest = Key::String(prefix.to_ascii_uppercase());
    let highest = prefix.to_ascii_lowercase();
    let past_prefix = |k: &Key| {
        k.as_str().is_some_and(|s| {
            let head = s.as_bytes().get(..highest.len()).unwrap_or(s.as_bytes());
            head > highest.as_bytes()
        })
    };
    forward(
        nav,
        collector,
        &lowest,
        |k| matches_string(&regex, k),
        past_prefix,
    )
    .await
}

/// A full-scan search that permanently excludes values across runs.
///
/// For every entry with values left after filtering and blacklisting, the
/// callback receives the entry and returns the values to exclude. Excluded
/// values are dropped from this and every later run of the same operator;
/// the remaining values are returned.
pub struct BlacklistingSearchOperator<F> {
    callback: F,
    blacklist: HashSet<RecordPointer>,
}

impl<F> BlacklistingSearchOperator<F>
where
    F: FnMut(&LeafEntry) -> Vec<EntryValue> + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            blacklist: HashSet::new(),
        }
    }

    /// Record pointers excluded so far.
    pub const fn blacklist(&self) -> &HashSet<RecordPointer> {
        &self.blacklist
    }

    #[must_use]
    pub fn is_blacklisted(&self, record_pointer: &RecordPointer) -> bool {
        self.blacklist.contains(record_pointer)
    }

    /// Runs the operator over the tree read by `nav`.
    pub async fn run<S: ByteStorage>(
        &mut self,
        nav: &mut Navigator<'_, S>,
        options: &SearchOptions,
    ) -> Result<SearchResult, TreeError> {
        let mut collector = Collector::new(options);
        let mut leaf = Some(nav.first_leaf().await?);
        while let Some(current) = leaf {
            for entry in &current.entries {
                let mut values = nav.entry_values(entry).await?;
                values.retain(|v| {
                    !self.blacklist.contains(&v.record_pointer)
                        && options
                            .filter
                            .as_ref()
                            .is_none_or(|f| f.contains(&v.record_pointer))
                });
                if values.is_empty() {
                    continue;
                }
                let candidate = LeafEntry::new(entry.key.clone(), values);
                let excluded = (self.callback)(&candidate);
                self.blacklist
                    .extend(excluded.into_iter().map(|v| v.record_pointer));
                let LeafEntry { key, mut values } = candidate;
                values.retain(|v| !self.blacklist.contains(&v.record_pointer));
                if !values.is_empty() {
                    collector.push(key, values.len(), Some(values));
                }
            }
            leaf = nav.next_leaf(&current).await?;
        }
        Ok(collector.result)
    }
}

impl<F> std::fmt::Debug for BlacklistingSearchOperator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistingSearchOperator")
            .field("blacklist", &self.blacklist.len())
            .finish_non_exhaustive()
    }
}
