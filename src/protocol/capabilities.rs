//! Capability negotiation types and the packed server capability bitmask

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Capabilities advertised by this client during `initialize`. Roots are
/// always advertised; sampling and elicitation only when a local handler
/// is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub roots: RootsCapability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationCapability>,
}

impl ClientCapabilities {
    pub fn new(sampling: bool, elicitation: bool) -> Self {
        Self {
            roots: RootsCapability { list_changed: true },
            sampling: sampling.then(|| Value::Object(Default::default())),
            elicitation: elicitation.then(ElicitationCapability::default),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    pub list_changed: bool,
}

/// Both elicitation modes are supported when a handler is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitationCapability {
    pub form: Value,
    pub url: Value,
}

impl Default for ElicitationCapability {
    fn default() -> Self {
        Self {
            form: Value::Object(Default::default()),
            url: Value::Object(Default::default()),
        }
    }
}

/// Capabilities declared by a server in its `initialize` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolCapabilities>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    #[serde(default)]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapabilities {
    #[serde(default)]
    pub subscribe: Option<bool>,
    #[serde(default)]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCapabilities {
    #[serde(default)]
    pub list_changed: Option<bool>,
}

/// Server capability flags packed into disjoint bits for cheap storage and
/// comparison across sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityFlags(pub u32);

impl CapabilityFlags {
    pub const NONE: CapabilityFlags = CapabilityFlags(0);
    pub const LOGGING: CapabilityFlags = CapabilityFlags(1 << 0);
    pub const COMPLETIONS: CapabilityFlags = CapabilityFlags(1 << 1);
    pub const PROMPTS: CapabilityFlags = CapabilityFlags(1 << 2);
    pub const PROMPTS_LIST_CHANGED: CapabilityFlags = CapabilityFlags(1 << 3);
    pub const RESOURCES: CapabilityFlags = CapabilityFlags(1 << 4);
    pub const RESOURCES_SUBSCRIBE: CapabilityFlags = CapabilityFlags(1 << 5);
    pub const RESOURCES_LIST_CHANGED: CapabilityFlags = CapabilityFlags(1 << 6);
    pub const TOOLS: CapabilityFlags = CapabilityFlags(1 << 7);
    pub const TOOLS_LIST_CHANGED: CapabilityFlags = CapabilityFlags(1 << 8);

    pub fn from_capabilities(caps: &ServerCapabilities) -> CapabilityFlags {
        let mut flags = CapabilityFlags::NONE;
        if caps.logging.is_some() {
            flags |= Self::LOGGING;
        }
        if caps.completions.is_some() {
            flags |= Self::COMPLETIONS;
        }
        if let Some(prompts) = &caps.prompts {
            flags |= Self::PROMPTS;
            if prompts.list_changed == Some(true) {
                flags |= Self::PROMPTS_LIST_CHANGED;
            }
        }
        if let Some(resources) = &caps.resources {
            flags |= Self::RESOURCES;
            if resources.subscribe == Some(true) {
                flags |= Self::RESOURCES_SUBSCRIBE;
            }
            if resources.list_changed == Some(true) {
                flags |= Self::RESOURCES_LIST_CHANGED;
            }
        }
        if let Some(tools) = &caps.tools {
            flags |= Self::TOOLS;
            if tools.list_changed == Some(true) {
                flags |= Self::TOOLS_LIST_CHANGED;
            }
        }
        flags
    }

    pub fn contains(&self, other: CapabilityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CapabilityFlags {
    type Output = CapabilityFlags;
    fn bitor(self, rhs: CapabilityFlags) -> CapabilityFlags {
        CapabilityFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CapabilityFlags {
    fn bitor_assign(&mut self, rhs: CapabilityFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for CapabilityFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: &[(CapabilityFlags, &str)] = &[
            (CapabilityFlags::LOGGING, "logging"),
            (CapabilityFlags::COMPLETIONS, "completions"),
            (CapabilityFlags::PROMPTS, "prompts"),
            (CapabilityFlags::PROMPTS_LIST_CHANGED, "prompts.listChanged"),
            (CapabilityFlags::RESOURCES, "resources"),
            (CapabilityFlags::RESOURCES_SUBSCRIBE, "resources.subscribe"),
            (
                CapabilityFlags::RESOURCES_LIST_CHANGED,
                "resources.listChanged",
            ),
            (CapabilityFlags::TOOLS, "tools"),
            (CapabilityFlags::TOOLS_LIST_CHANGED, "tools.listChanged"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Handshake request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// Handshake result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icons: Option<Value>,
}

/// Implementation info exchanged during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            version: version.into(),
        }
    }
}
