//! Synchronous Standby Names
//!
//! Parsing of PostgreSQL's `synchronous_standby_names` setting and the
//! naming scheme used for managed standbys in it.
//!
//! Two surface forms are understood:
//!
//! - a bare comma separated list: `node1` or `a,b`
//! - a quorum count followed by a parenthesized list: `2 (a,b)`
//!
//! Tokens are only trimmed. Quotes and the whitespace inside them are kept
//! as written so the result can be compared with what was configured.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Prefix of the application name used by managed standbys
pub const STOLON_NAME_PREFIX: &str = "stolon_";

/// Result of parsing a standby name list
///
/// A malformed value still yields the names that could be read, next to
/// the error, so callers can make a degraded comparison.
#[derive(Debug)]
pub struct StandbyNames {
    pub names: Vec<String>,
    pub error: Option<Error>,
}

impl StandbyNames {
    /// Drop the partial list when parsing failed
    pub fn into_result(self) -> Result<Vec<String>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.names),
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    ExpectDigitsOrList,
    InDigits,
    ExpectOpenParen,
    InParenList,
    UnterminatedParenList,
    PlainList,
}

/// Locates the part of the value holding the comma separated names
struct Scanner<'a> {
    input: &'a str,
    state: ScanState,
    list_start: usize,
    list_end: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            state: ScanState::ExpectDigitsOrList,
            list_start: 0,
            list_end: input.len(),
        }
    }

    /// Run until a terminal state is reached, returning the list source
    fn run(mut self) -> (&'a str, ScanState) {
        for (i, c) in self.input.char_indices() {
            self.state = match self.state {
                ScanState::ExpectDigitsOrList if c.is_ascii_digit() => ScanState::InDigits,
                ScanState::ExpectDigitsOrList => ScanState::PlainList,

                ScanState::InDigits if c.is_ascii_digit() => ScanState::InDigits,
                ScanState::InDigits | ScanState::ExpectOpenParen if c == '(' => {
                    self.list_start = i + 1;
                    ScanState::InParenList
                }
                ScanState::InDigits | ScanState::ExpectOpenParen if c.is_whitespace() => {
                    ScanState::ExpectOpenParen
                }
                // A number not followed by a list is read as a plain name
                ScanState::InDigits | ScanState::ExpectOpenParen => ScanState::PlainList,

                ScanState::InParenList if c == ')' => {
                    self.list_end = i;
                    break;
                }
                ScanState::InParenList => ScanState::InParenList,

                ScanState::UnterminatedParenList | ScanState::PlainList => break,
            };

            if self.state == ScanState::PlainList {
                break;
            }
        }

        if self.state == ScanState::InParenList && self.list_end == self.input.len() {
            self.state = ScanState::UnterminatedParenList;
        }

        match self.state {
            ScanState::InParenList => (&self.input[self.list_start..self.list_end], self.state),
            ScanState::UnterminatedParenList => (&self.input[self.list_start..], self.state),
            _ => (self.input, ScanState::PlainList),
        }
    }
}

/// Parse a `synchronous_standby_names` value into its ordered name list
///
/// The quorum count is consumed but not returned. An unclosed `N (` list
/// returns the names after the bracket together with
/// [`Error::MalformedSyncStandbyList`].
pub fn parse_synchronous_standby_names(s: &str) -> StandbyNames {
    let (source, state) = Scanner::new(s.trim()).run();
    let mut names = split_names(source);

    let error = if state == ScanState::UnterminatedParenList {
        // A dangling comma before the cut-off names nothing
        if names.last().is_some_and(String::is_empty) {
            names.pop();
        }
        Some(Error::missing_bracket())
    } else {
        None
    };

    StandbyNames { names, error }
}

fn split_names(source: &str) -> Vec<String> {
    if source.trim().is_empty() {
        return Vec::new();
    }
    source.split(',').map(|t| t.trim().to_string()).collect()
}

/// Application name of a managed standby
pub fn stolon_name(db_uid: &str) -> String {
    format!("{}{}", STOLON_NAME_PREFIX, db_uid)
}

pub fn is_stolon_name(name: &str) -> bool {
    name.starts_with(STOLON_NAME_PREFIX)
}

/// Db UID encoded in a managed standby name
pub fn uid_from_stolon_name(name: &str) -> Option<&str> {
    name.strip_prefix(STOLON_NAME_PREFIX)
        .filter(|uid| !uid.is_empty())
}

/// Build the setting value requiring every given standby to acknowledge
///
/// Managed standbys are named from their db UID, external ones are used as
/// given. Names are sorted so equal sets always produce the same value. An
/// empty set disables synchronous replication (empty value).
pub fn synchronous_standby_names_value(db_uids: &[String], external: &[String]) -> String {
    let names: BTreeSet<String> = db_uids
        .iter()
        .map(|uid| stolon_name(uid))
        .chain(external.iter().cloned())
        .collect();

    if names.is_empty() {
        return String::new();
    }

    let names: Vec<String> = names.into_iter().collect();
    format!("{} ({})", names.len(), names.join(","))
}

/// Db UIDs of the managed standbys named in a live setting value
///
/// Unmanaged names are skipped. A parse error is passed along with the
/// UIDs read so far.
pub fn reported_sync_standbys(live: &str) -> (Vec<String>, Option<Error>) {
    let parsed = parse_synchronous_standby_names(live);
    let uids = parsed
        .names
        .iter()
        .filter_map(|name| uid_from_stolon_name(name))
        .map(str::to_string)
        .collect();
    (uids, parsed.error)
}

/// Whether the live setting already names exactly the desired standbys
///
/// Managed standbys are compared by their application name and external
/// ones as given, so a missing or extra name of either kind is a mismatch.
/// A malformed live value never counts as converged.
pub fn sync_standbys_converged(desired_uids: &[String], external: &[String], live: &str) -> bool {
    let parsed = parse_synchronous_standby_names(live);
    if let Some(e) = &parsed.error {
        tracing::warn!("live synchronous_standby_names {:?} is malformed: {}", live, e);
        return false;
    }

    let desired: BTreeSet<String> = desired_uids
        .iter()
        .map(|uid| stolon_name(uid))
        .chain(external.iter().cloned())
        .collect();
    let live: BTreeSet<String> = parsed.names.into_iter().collect();
    desired == live
}
