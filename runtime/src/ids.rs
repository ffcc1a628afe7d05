//! Identifiers and topics (spec §3, §4.1).
//!
//! `AgentId`, `AgentType` and `TopicId` are plain value types: `Clone`,
//! `Eq`, `Hash`, constructed through validating constructors. Canonical
//! string form is `type/source` for both, parsed by splitting on the
//! first `/` only (a key or source may itself contain `/`).

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, RuntimeError};

static AGENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-\.]+$").unwrap());
static TOPIC_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-\.\:\=]+$").unwrap());

/// Registration key for a factory that produces agents of a given logical
/// type. Distinct from [`AgentId`], which additionally carries an instance
/// key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentType(pub String);

impl AgentType {
    pub fn new(type_name: impl Into<String>) -> Result<Self> {
        let type_name = type_name.into();
        if !AGENT_TYPE_RE.is_match(&type_name) {
            return Err(RuntimeError::Validation(format!(
                "invalid agent type: {type_name}. must match ^[\\w\\-\\.]+$"
            )));
        }
        Ok(Self(type_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<AgentType> for String {
    fn from(value: AgentType) -> Self {
        value.0
    }
}

/// The address of an agent instance: a `(type, key)` pair. `type` must name
/// a registered factory; `key` is arbitrary UTF-8 chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    r#type: String,
    key: String,
}

impl AgentId {
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let r#type = agent_type.into();
        if !AGENT_TYPE_RE.is_match(&r#type) {
            return Err(RuntimeError::Validation(format!(
                "invalid agent type: {type}. must match ^[\\w\\-\\.]+$",
                r#type = r#type
            )));
        }
        Ok(Self {
            r#type,
            key: key.into(),
        })
    }

    pub fn from_type(agent_type: &AgentType, key: impl Into<String>) -> Self {
        Self {
            r#type: agent_type.0.clone(),
            key: key.into(),
        }
    }

    pub fn r#type(&self) -> &str {
        &self.r#type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Parses `type/key`, splitting on the first `/` only.
    pub fn from_str_id(value: &str) -> Result<Self> {
        let (r#type, key) = value
            .split_once('/')
            .ok_or_else(|| RuntimeError::Validation(format!("invalid agent id: {value}")))?;
        Self::new(r#type, key)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.key)
    }
}

/// A `(type, source)` pair addressing a publish-subscribe channel, following
/// the CloudEvents `type`/`source` naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId {
    r#type: String,
    source: String,
}

impl TopicId {
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Result<Self> {
        let r#type = topic_type.into();
        if !TOPIC_TYPE_RE.is_match(&r#type) {
            return Err(RuntimeError::Validation(format!(
                "invalid topic type: {type}. must match ^[\\w\\-\\.\\:\\=]+$",
                r#type = r#type
            )));
        }
        Ok(Self {
            r#type,
            source: source.into(),
        })
    }

    pub fn r#type(&self) -> &str {
        &self.r#type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn from_str_id(value: &str) -> Result<Self> {
        let (r#type, source) = value
            .split_once('/')
            .ok_or_else(|| RuntimeError::Validation(format!("invalid topic id: {value}")))?;
        Self::new(r#type, source)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.source)
    }
}
