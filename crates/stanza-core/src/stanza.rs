//! Generic protocol units.
//!
//! The protocol transport delivers decoded stanzas as a small element tree.
//! [`Stanza`] keeps that tree generic (name, namespace, attributes, children,
//! text) and layers typed accessors on top for the handful of envelope
//! attributes the engine cares about: kind, id, addressing, error info.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::addr::PeerAddr;
use crate::error::{Result, StanzaError};

/// Top-level stanza kinds of the messaging protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StanzaKind {
    /// Request/response unit with a correlated id.
    Iq,
    /// One-way chat payload.
    Message,
    /// Availability broadcast.
    Presence,
    /// Anything else; tolerated and ignored.
    Other,
}

/// Kind attribute of an iq stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

impl IqKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqKind::Get => "get",
            IqKind::Set => "set",
            IqKind::Result => "result",
            IqKind::Error => "error",
        }
    }
}

impl FromStr for IqKind {
    type Err = StanzaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(IqKind::Get),
            "set" => Ok(IqKind::Set),
            "result" => Ok(IqKind::Result),
            "error" => Ok(IqKind::Error),
            other => Err(StanzaError::UnexpectedStanza(other.to_string())),
        }
    }
}

/// Kind attribute of a message stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Chat,
    GroupChat,
    Normal,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::GroupChat => "groupchat",
            MessageKind::Normal => "normal",
            MessageKind::Error => "error",
        }
    }
}

/// A decoded XML-like protocol unit.
///
/// Attribute order is irrelevant to the protocol, so attributes live in a
/// sorted map to keep `Debug` output and serialized forms stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    /// Element name.
    pub name: String,

    /// Element namespace, when declared.
    pub namespace: Option<String>,

    /// Attributes of this element.
    pub attrs: BTreeMap<String, String>,

    /// Child elements, in document order.
    pub children: Vec<Stanza>,

    /// Text payload, when present.
    pub text: Option<String>,
}

impl Stanza {
    /// Create an element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attrs: BTreeMap::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Create an element with a namespace.
    pub fn new_ns(name: impl Into<String>, ns: impl Into<String>) -> Self {
        let mut stanza = Self::new(name);
        stanza.namespace = Some(ns.into());
        stanza
    }

    /// Set an attribute (builder style).
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Append a child element (builder style).
    pub fn with_child(mut self, child: Stanza) -> Self {
        self.children.push(child);
        self
    }

    /// Set the text payload (builder style).
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set an attribute in place.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Append a child in place.
    pub fn add_child(&mut self, child: Stanza) {
        self.children.push(child);
    }

    /// Attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given name and namespace.
    pub fn child_ns(&self, name: &str, ns: &str) -> Option<&Stanza> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace.as_deref() == Some(ns))
    }

    /// Text payload, or empty string.
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// Text of the first child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text())
    }

    /// Kind of this stanza derived from the element name.
    pub fn kind(&self) -> StanzaKind {
        match self.name.as_str() {
            "iq" => StanzaKind::Iq,
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            _ => StanzaKind::Other,
        }
    }

    /// Correlation id, when present.
    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    /// `type` attribute interpreted as an iq kind.
    pub fn iq_kind(&self) -> Option<IqKind> {
        self.attr("type").and_then(|t| t.parse().ok())
    }

    /// `type` attribute interpreted as a message kind. A chat message with
    /// no type attribute counts as `Normal`, matching the wire default.
    pub fn message_kind(&self) -> MessageKind {
        match self.attr("type") {
            Some("chat") => MessageKind::Chat,
            Some("groupchat") => MessageKind::GroupChat,
            Some("error") => MessageKind::Error,
            _ => MessageKind::Normal,
        }
    }

    /// Sender address, parsed.
    pub fn from_addr(&self) -> Result<PeerAddr> {
        self.attr("from")
            .ok_or_else(|| StanzaError::MissingAttr("from".into()))?
            .parse()
    }

    /// Recipient address, parsed.
    pub fn to_addr(&self) -> Result<PeerAddr> {
        self.attr("to")
            .ok_or_else(|| StanzaError::MissingAttr("to".into()))?
            .parse()
    }

    /// Conversation thread id carried by a message stanza.
    pub fn thread(&self) -> Option<&str> {
        self.child_text("thread").filter(|t| !t.is_empty())
    }

    /// Build the generic acknowledgement for this iq: result kind, swapped
    /// addressing, same id, no payload.
    pub fn reply_result(&self) -> Stanza {
        let mut reply = Stanza::new("iq").with_attr("type", IqKind::Result.as_str());
        if let Some(id) = self.id() {
            reply.set_attr("id", id);
        }
        if let Some(from) = self.attr("from") {
            reply.set_attr("to", from);
        }
        if let Some(to) = self.attr("to") {
            reply.set_attr("from", to);
        }
        reply
    }

    /// Error code from an error child, when present.
    pub fn error_code(&self) -> Option<&str> {
        self.child("error").and_then(|e| e.attr("code"))
    }

    /// Human-readable error text from an error child, when present.
    pub fn error_text(&self) -> Option<&str> {
        self.child("error")
            .and_then(|e| e.child("text"))
            .map(|t| t.text())
            .filter(|t| !t.is_empty())
    }
}
