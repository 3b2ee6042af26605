// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interest registry
//!
//! Tracks, per session, the keys and patterns the session subscribes to.
//! Sessions are referenced by identity only; the registry never owns a
//! session. Registration is not retroactive: the registry only answers
//! questions about mutations processed after the call returns.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::{CacheError, CacheResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterestPattern {
    Key(String),
    /// Regular expression matched against the whole key
    Regex(String),
    AllKeys,
}

impl fmt::Display for InterestPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterestPattern::Key(key) => write!(f, "key '{key}'"),
            InterestPattern::Regex(pattern) => write!(f, "regex '{pattern}'"),
            InterestPattern::AllKeys => f.write_str("all keys"),
        }
    }
}

/// One registered interest of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub session: String,
    pub pattern: InterestPattern,
    pub durable: bool,
}

#[derive(Debug)]
struct CompiledRegex {
    regex: Regex,
    durable: bool,
}

#[derive(Debug, Default)]
struct SessionInterests {
    keys: HashMap<String, bool>,
    regexes: BTreeMap<String, CompiledRegex>,
    all_keys: Option<bool>,
}

impl SessionInterests {
    fn matches(&self, key: &str) -> bool {
        self.all_keys.is_some()
            || self.keys.contains_key(key)
            || self.regexes.values().any(|r| r.regex.is_match(key))
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.regexes.is_empty() && self.all_keys.is_none()
    }

    fn retain_durable(&mut self) {
        self.keys.retain(|_, durable| *durable);
        self.regexes.retain(|_, r| r.durable);
        if self.all_keys == Some(false) {
            self.all_keys = None;
        }
    }

    fn interests(&self, session: &str) -> Vec<Interest> {
        let mut keys: Vec<_> = self.keys.iter().collect();
        keys.sort();
        let mut out: Vec<Interest> = keys
            .into_iter()
            .map(|(key, durable)| Interest {
                session: session.to_string(),
                pattern: InterestPattern::Key(key.clone()),
                durable: *durable,
            })
            .collect();
        out.extend(self.regexes.iter().map(|(pattern, r)| Interest {
            session: session.to_string(),
            pattern: InterestPattern::Regex(pattern.clone()),
            durable: r.durable,
        }));
        if let Some(durable) = self.all_keys {
            out.push(Interest {
                session: session.to_string(),
                pattern: InterestPattern::AllKeys,
                durable,
            });
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct InterestRegistry {
    sessions: RwLock<BTreeMap<String, SessionInterests>>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, SessionInterests>> {
        self.sessions.read().expect("interest registry lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, SessionInterests>> {
        self.sessions.write().expect("interest registry lock poisoned")
    }

    /// Register interest in exact keys. Re-registering a key replaces its
    /// durability with the latest call's.
    pub fn register_keys<K: AsRef<str>>(
        &self,
        session: &str,
        keys: &[K],
        durable: bool,
    ) -> CacheResult<()> {
        if keys.iter().any(|k| k.as_ref().is_empty()) {
            return Err(CacheError::invalid_parameter_named(
                "interest keys must not be empty",
                "keys",
            ));
        }
        let mut sessions = self.write();
        let entry = sessions.entry(session.to_string()).or_default();
        for key in keys {
            entry.keys.insert(key.as_ref().to_string(), durable);
        }
        log::debug!(
            "[{session}] registered {} key(s), durable={durable}",
            keys.len()
        );
        Ok(())
    }

    /// Remove exact-key interest. Keys that are not registered are ignored.
    pub fn unregister_keys<K: AsRef<str>>(&self, session: &str, keys: &[K]) {
        let mut sessions = self.write();
        if let Some(entry) = sessions.get_mut(session) {
            for key in keys {
                entry.keys.remove(key.as_ref());
            }
            if entry.is_empty() {
                sessions.remove(session);
            }
        }
    }

    /// Register interest in every key fully matching `pattern`.
    pub fn register_regex(&self, session: &str, pattern: &str, durable: bool) -> CacheResult<()> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            CacheError::invalid_parameter_named(
                format!("invalid interest pattern '{pattern}': {e}"),
                "pattern",
            )
        })?;
        self.write()
            .entry(session.to_string())
            .or_default()
            .regexes
            .insert(pattern.to_string(), CompiledRegex { regex, durable });
        log::debug!("[{session}] registered regex '{pattern}', durable={durable}");
        Ok(())
    }

    pub fn unregister_regex(&self, session: &str, pattern: &str) {
        let mut sessions = self.write();
        if let Some(entry) = sessions.get_mut(session) {
            entry.regexes.remove(pattern);
            if entry.is_empty() {
                sessions.remove(session);
            }
        }
    }

    pub fn register_all_keys(&self, session: &str, durable: bool) {
        self.write()
            .entry(session.to_string())
            .or_default()
            .all_keys = Some(durable);
        log::debug!("[{session}] registered interest in all keys, durable={durable}");
    }

    pub fn unregister_all_keys(&self, session: &str) {
        let mut sessions = self.write();
        if let Some(entry) = sessions.get_mut(session) {
            entry.all_keys = None;
            if entry.is_empty() {
                sessions.remove(session);
            }
        }
    }

    /// Re-install interests from a persisted session record.
    pub fn restore(&self, session: &str, interests: &[Interest]) -> CacheResult<()> {
        for interest in interests {
            match &interest.pattern {
                InterestPattern::Key(key) => {
                    self.register_keys(session, &[key.as_str()], interest.durable)?
                }
                InterestPattern::Regex(pattern) => {
                    self.register_regex(session, pattern, interest.durable)?
                }
                InterestPattern::AllKeys => self.register_all_keys(session, interest.durable),
            }
        }
        Ok(())
    }

    /// Whether `session` holds any interest matching `key`
    pub fn is_interested(&self, session: &str, key: &str) -> bool {
        self.read()
            .get(session)
            .map(|entry| entry.matches(key))
            .unwrap_or(false)
    }

    /// Sessions with an interest matching `key`, in identity order.
    pub fn matching_sessions(&self, key: &str) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.matches(key))
            .map(|(session, _)| session.clone())
            .collect()
    }

    pub fn interests_for(&self, session: &str) -> Vec<Interest> {
        self.read()
            .get(session)
            .map(|entry| entry.interests(session))
            .unwrap_or_default()
    }

    pub fn durable_interests(&self, session: &str) -> Vec<Interest> {
        self.interests_for(session)
            .into_iter()
            .filter(|i| i.durable)
            .collect()
    }

    /// Drop every interest of `session`.
    pub fn remove_session(&self, session: &str) {
        self.write().remove(session);
    }

    /// Drop only the non-durable interests of `session`.
    pub fn remove_non_durable(&self, session: &str) {
        let mut sessions = self.write();
        if let Some(entry) = sessions.get_mut(session) {
            entry.retain_durable();
            if entry.is_empty() {
                sessions.remove(session);
            }
        }
    }
}
