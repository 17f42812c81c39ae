//! Closed, process-wide tool registry.
//!
//! Built once at startup from the built-in catalogue plus config overrides and
//! shared read-only afterwards. Names not in the registry are denied by the
//! gate as `unknown_tool`.

use std::collections::BTreeMap;

use tracing::warn;

use super::schema::{ArgField, ArgKind};
use super::{BudgetLimits, Risk, ToolDescriptor, ToolFamily};
use crate::config::ToolOverride;

/// Default high-risk capability tool, gated by the session capability flag.
pub const CAPABILITY_TOOL: &str = "run_python";

/// Read-only map of tool name to descriptor.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
    capability_tool: Option<String>,
}

impl ToolRegistry {
    /// Registry from explicit descriptors. Later duplicates replace earlier ones.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ToolDescriptor>,
        capability_tool: Option<&str>,
    ) -> Self {
        let tools = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self {
            tools,
            capability_tool: capability_tool.map(str::to_string),
        }
    }

    /// The built-in catalogue with [`CAPABILITY_TOOL`] as the capability tool.
    pub fn builtin() -> Self {
        Self::from_descriptors(builtin_catalogue(), Some(CAPABILITY_TOOL))
    }

    /// Designate a different capability tool.
    #[must_use]
    pub fn with_capability_tool(mut self, name: &str) -> Self {
        if !self.tools.contains_key(name) {
            warn!(tool = name, "capability tool is not in the registry");
        }
        self.capability_tool = Some(name.to_string());
        self
    }

    /// Apply config overrides. Overrides naming unknown tools are ignored.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ToolOverride>) -> Self {
        for (name, ov) in overrides {
            let Some(desc) = self.tools.get_mut(name) else {
                warn!(tool = %name, "ignoring override for unknown tool");
                continue;
            };
            if let Some(calls) = ov.calls_per_turn {
                desc.limits.calls_per_turn = calls;
            }
            if let Some(bytes) = ov.bytes_per_turn {
                desc.limits.bytes_per_turn = (bytes > 0).then_some(bytes);
            }
            if let Some(grant) = ov.require_grant {
                desc.require_grant = grant;
            }
            if let Some(deny) = ov.deny_in_replay {
                desc.deny_in_replay = deny;
            }
        }
        self
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Whether `name` is the designated high-risk capability.
    pub fn is_capability(&self, name: &str) -> bool {
        self.capability_tool.as_deref() == Some(name)
    }

    /// Name of the capability tool, if any.
    pub fn capability_tool(&self) -> Option<&str> {
        self.capability_tool.as_deref()
    }

    /// Tool names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    /// Number of tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry has no tools.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Built-in catalogue
// ---------------------------------------------------------------------------

const FILE_BYTES: u64 = 200_000;
const EXEC_BYTES: u64 = 100_000;

fn builtin_catalogue() -> Vec<ToolDescriptor> {
    use ArgKind::{Bool, Dict, Int, List, Str};
    use ToolFamily::{Code, Filesystem, Memory, Network, Reasoning, Sandbox, Shell};

    let req = ArgField::required;
    let opt = ArgField::optional;

    vec![
        // Filesystem.
        ToolDescriptor::new("read_file", Filesystem, Risk::Low, BudgetLimits::calls_and_bytes(20, FILE_BYTES))
            .with_schema(vec![req("path", Str), opt("max_bytes", Int)]),
        ToolDescriptor::new("write_file", Filesystem, Risk::High, BudgetLimits::calls_and_bytes(10, FILE_BYTES))
            .requires_grant()
            .denied_in_replay()
            .with_schema(vec![req("path", Str), req("content", Str), opt("max_bytes", Int)]),
        ToolDescriptor::new("list_dir", Filesystem, Risk::Low, BudgetLimits::calls(20))
            .with_schema(vec![req("path", Str), opt("max_items", Int)]),
        ToolDescriptor::new("search_files", Filesystem, Risk::Low, BudgetLimits::calls(10))
            .with_schema(vec![req("directory", Str), req("pattern", Str), opt("max_results", Int)]),
        // Memory.
        ToolDescriptor::new("memory_store", Memory, Risk::Medium, BudgetLimits::calls(30)).with_schema(vec![
            req("key", Str),
            req("value", Str),
            opt("tags", List),
            opt("db_path", Str),
        ]),
        ToolDescriptor::new("memory_retrieve", Memory, Risk::Low, BudgetLimits::calls(40))
            .with_schema(vec![req("key", Str), opt("db_path", Str)]),
        ToolDescriptor::new("memory_search", Memory, Risk::Low, BudgetLimits::calls(40))
            .with_schema(vec![req("query", Str), opt("max_results", Int), opt("db_path", Str)]),
        ToolDescriptor::new("memory_delete", Memory, Risk::High, BudgetLimits::calls(10))
            .requires_grant()
            .denied_in_replay()
            .with_schema(vec![req("key", Str), opt("db_path", Str)]),
        // Network.
        ToolDescriptor::new("fetch_url", Network, Risk::Medium, BudgetLimits::calls_and_bytes(10, FILE_BYTES))
            .with_schema(vec![req("url", Str), opt("max_bytes", Int), opt("timeout", Int)]),
        ToolDescriptor::new("search_web", Network, Risk::Low, BudgetLimits::calls(10))
            .with_schema(vec![req("query", Str), opt("max_results", Int)]),
        // Sandbox.
        ToolDescriptor::new("sandbox_exec", Sandbox, Risk::High, BudgetLimits::calls_and_bytes(8, FILE_BYTES))
            .requires_grant()
            .denied_in_replay()
            .with_schema(vec![
                req("command", Str),
                opt("workdir", Str),
                opt("timeout_seconds", Int),
                opt("image", Str),
                opt("memory_limit", Str),
                opt("cpu_limit", Int),
                opt("network_disabled", Bool),
                opt("env", Dict),
                opt("max_output", Int),
            ]),
        // Code.
        ToolDescriptor::new("grep_files", Code, Risk::Low, BudgetLimits::calls(20)).with_schema(vec![
            req("pattern", Str),
            req("directory", Str),
            opt("file_pattern", Str),
            opt("max_results", Int),
            opt("context_lines", Int),
        ]),
        ToolDescriptor::new("apply_diff", Code, Risk::High, BudgetLimits::calls(10))
            .requires_grant()
            .denied_in_replay()
            .with_schema(vec![req("file_path", Str), req("diff", Str), opt("dry_run", Bool)]),
        ToolDescriptor::new("get_symbols", Code, Risk::Low, BudgetLimits::calls(20))
            .with_schema(vec![req("file_path", Str), opt("max_symbols", Int)]),
        // Reasoning.
        ToolDescriptor::new("think", Reasoning, Risk::Low, BudgetLimits::calls(50))
            .with_schema(vec![req("thought", Str), opt("category", Str)]),
        ToolDescriptor::new("plan", Reasoning, Risk::Low, BudgetLimits::calls(10))
            .with_schema(vec![req("goal", Str), req("steps", List), opt("current_step", Int)]),
        ToolDescriptor::new("ask_user", Reasoning, Risk::Low, BudgetLimits::calls(5))
            .with_schema(vec![req("question", Str), opt("options", List), opt("context", Str)]),
        // Shell.
        ToolDescriptor::new("run_command", Shell, Risk::High, BudgetLimits::calls_and_bytes(12, EXEC_BYTES))
            .requires_grant()
            .denied_in_replay()
            .with_schema(vec![req("command", Str), opt("cwd", Str), opt("timeout", Int), opt("max_output", Int)]),
        ToolDescriptor::new(CAPABILITY_TOOL, Shell, Risk::High, BudgetLimits::calls_and_bytes(6, EXEC_BYTES))
            .requires_grant()
            .denied_in_replay()
            .with_schema(vec![req("code", Str), opt("cwd", Str), opt("timeout", Int), opt("max_output", Int)]),
    ]
}
