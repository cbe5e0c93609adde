//! Script location and call-stack types.

use std::fmt;

use smol_str::SmolStr;

/// Location of a statement inside a build script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptLocation {
    /// Full path of the script file.
    pub path: String,
    /// 1-based line of the statement.
    pub line: u64,
    /// Name of the command at this location.
    pub name: SmolStr,
}

impl ScriptLocation {
    /// Create a new location.
    #[must_use]
    pub fn new(path: impl Into<String>, line: u64, name: impl Into<SmolStr>) -> Self {
        Self {
            path: path.into(),
            line,
            name: name.into(),
        }
    }
}

/// Kind of scope a call frame was opened by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Base,
    BuildsystemDirectory,
    FunctionCall,
    MacroCall,
    IncludeFile,
    InlineListFile,
    PolicyScope,
    VariableScope,
}

impl FrameType {
    /// Wire name used by the JSON protocol.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Base => "BaseType",
            FrameType::BuildsystemDirectory => "BuildsystemDirectoryType",
            FrameType::FunctionCall => "FunctionCallType",
            FrameType::MacroCall => "MacroCallType",
            FrameType::IncludeFile => "IncludeFileType",
            FrameType::InlineListFile => "InlineListFileType",
            FrameType::PolicyScope => "PolicyScopeType",
            FrameType::VariableScope => "VariableScopeType",
        }
    }
}

/// One frame of a script call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceFrame {
    /// Location the frame is currently executing.
    pub location: ScriptLocation,
    /// Scope kind that opened the frame.
    pub frame_type: FrameType,
}

/// Call stack snapshot, most recent frame first.
///
/// The interpreter produces these; the engine treats them as opaque apart
/// from their depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<BacktraceFrame>,
}

impl Backtrace {
    /// Build a backtrace from frames ordered most recent first.
    #[must_use]
    pub fn new(frames: Vec<BacktraceFrame>) -> Self {
        Self { frames }
    }

    /// Number of frames on the stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The innermost frame, if any.
    #[must_use]
    pub fn top(&self) -> Option<&BacktraceFrame> {
        self.frames.first()
    }

    /// All frames, most recent first.
    #[must_use]
    pub fn frames(&self) -> &[BacktraceFrame] {
        &self.frames
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(
                f,
                "  {}:{} ({})",
                frame.location.path, frame.location.line, frame.location.name
            )?;
        }
        Ok(())
    }
}
