// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Protocol errors as values. Every error a handler can produce is a single
//! [`NcError`] record which the one reply emitter in `daemon::reply` turns
//! into an `<rpc-error>` document. Handlers never build reply XML themselves.

use std::fmt;

/// The closed set of `<error-tag>` values this server can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    InUse,
    InvalidValue,
    TooBig,
    MissingAttribute,
    BadAttribute,
    UnknownAttribute,
    MissingElement,
    BadElement,
    UnknownElement,
    UnknownNamespace,
    AccessDenied,
    LockDenied,
    ResourceDenied,
    DataExists,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
    MalformedMessage,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::InUse => "in-use",
            Tag::InvalidValue => "invalid-value",
            Tag::TooBig => "too-big",
            Tag::MissingAttribute => "missing-attribute",
            Tag::BadAttribute => "bad-attribute",
            Tag::UnknownAttribute => "unknown-attribute",
            Tag::MissingElement => "missing-element",
            Tag::BadElement => "bad-element",
            Tag::UnknownElement => "unknown-element",
            Tag::UnknownNamespace => "unknown-namespace",
            Tag::AccessDenied => "access-denied",
            Tag::LockDenied => "lock-denied",
            Tag::ResourceDenied => "resource-denied",
            Tag::DataExists => "data-exists",
            Tag::DataMissing => "data-missing",
            Tag::OperationNotSupported => "operation-not-supported",
            Tag::OperationFailed => "operation-failed",
            Tag::MalformedMessage => "malformed-message",
        }
    }

    /// The canonical human readable message for a tag, used when the
    /// error value carries no message of its own.
    pub fn default_message(&self) -> &'static str {
        match self {
            Tag::InUse => "Resource is already in use",
            Tag::InvalidValue => "Unacceptable value for one or more parameters",
            Tag::TooBig => "The request is too large to be handled",
            Tag::MissingAttribute => "An expected attribute is missing",
            Tag::BadAttribute => "An attribute value is not correct",
            Tag::UnknownAttribute => "An unexpected attribute is present",
            Tag::MissingElement => "An expected element is missing",
            Tag::BadElement => "An element value is not correct",
            Tag::UnknownElement => "An unexpected element is present",
            Tag::UnknownNamespace => "An unexpected namespace is present",
            Tag::AccessDenied => {
                "Access to the requested resource is denied due to authorization failure"
            }
            Tag::LockDenied => {
                "Access to the requested lock is denied because the lock is currently held by another entity"
            }
            Tag::ResourceDenied => "Request could not be completed because of insufficient resources",
            Tag::DataExists => "Requested data model content already exists",
            Tag::DataMissing => "Requested data model content does not exist",
            Tag::OperationNotSupported => {
                "Requested operation is not supported by this implementation"
            }
            Tag::OperationFailed => "Requested operation failed due to some reason",
            Tag::MalformedMessage => "Failed to parse XML message",
        }
    }
}

/// The `<error-type>` of an rpc-error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

impl ErrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrType::Transport => "transport",
            ErrType::Rpc => "rpc",
            ErrType::Protocol => "protocol",
            ErrType::Application => "application",
        }
    }
}

/// Optional diagnostic pairs carried in `<error-info>`. Which of these are
/// emitted (and in what pairing) depends on the tag, see `daemon::reply`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub bad_namespace: Option<String>,
    pub bad_element: Option<String>,
    pub bad_attribute: Option<String>,
    pub session_id: Option<u32>,
}

impl ErrorInfo {
    pub fn is_empty(&self) -> bool {
        self.bad_namespace.is_none()
            && self.bad_element.is_none()
            && self.bad_attribute.is_none()
            && self.session_id.is_none()
    }
}

/// A single tagged protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcError {
    pub tag: Tag,
    pub typ: ErrType,
    pub message: String,
    pub info: ErrorInfo,
}

impl NcError {
    pub fn new(tag: Tag, typ: ErrType) -> Self {
        NcError { tag, typ, message: String::new(), info: ErrorInfo::default() }
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_bad_element<S: Into<String>>(mut self, elem: S) -> Self {
        self.info.bad_element = Some(elem.into());
        self
    }

    pub fn with_bad_attribute<S: Into<String>>(mut self, attr: S) -> Self {
        self.info.bad_attribute = Some(attr.into());
        self
    }

    pub fn with_bad_namespace<S: Into<String>>(mut self, ns: S) -> Self {
        self.info.bad_namespace = Some(ns.into());
        self
    }

    pub fn with_session_id(mut self, id: u32) -> Self {
        self.info.session_id = Some(id);
        self
    }

    /// The message to put in `<error-message>`, falling back to the
    /// canonical text for the tag.
    pub fn message(&self) -> &str {
        if self.message.is_empty() {
            self.tag.default_message()
        } else {
            &self.message
        }
    }
}

impl fmt::Display for NcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.tag.as_str(), self.typ.as_str(), self.message())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_messages_cover_every_tag() {
        let tags = [
            Tag::InUse,
            Tag::InvalidValue,
            Tag::TooBig,
            Tag::MissingAttribute,
            Tag::BadAttribute,
            Tag::UnknownAttribute,
            Tag::MissingElement,
            Tag::BadElement,
            Tag::UnknownElement,
            Tag::UnknownNamespace,
            Tag::AccessDenied,
            Tag::LockDenied,
            Tag::ResourceDenied,
            Tag::DataExists,
            Tag::DataMissing,
            Tag::OperationNotSupported,
            Tag::OperationFailed,
            Tag::MalformedMessage,
        ];
        for tag in tags {
            assert!(!tag.as_str().is_empty());
            assert!(!tag.default_message().is_empty());
        }
    }

    #[test]
    fn message_falls_back_to_tag_text() {
        let err = NcError::new(Tag::DataExists, ErrType::Application);
        assert_eq!(err.message(), "Requested data model content already exists");

        let err = err.with_message("no thanks");
        assert_eq!(err.message(), "no thanks");
    }

    #[test]
    fn builder_fills_info() {
        let err = NcError::new(Tag::MissingAttribute, ErrType::Protocol)
            .with_bad_element("rpc")
            .with_bad_attribute("message-id");
        assert_eq!(err.info.bad_element.as_deref(), Some("rpc"));
        assert_eq!(err.info.bad_attribute.as_deref(), Some("message-id"));
        assert!(err.info.session_id.is_none());
    }
}
