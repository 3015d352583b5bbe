use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an attachable device as reported by the device listing
/// command (for adb, the serial number).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum PointerSize {
    Four,
    Eight,
}

impl PointerSize {
    pub fn bytes(self) -> u64 {
        match self {
            PointerSize::Four => 4,
            PointerSize::Eight => 8,
        }
    }
}

impl TryFrom<u64> for PointerSize {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(PointerSize::Four),
            8 => Ok(PointerSize::Eight),
            other => Err(format!("unsupported pointer size: {} (expected 4 or 8)", other)),
        }
    }
}

impl From<PointerSize> for u64 {
    fn from(value: PointerSize) -> Self {
        value.bytes()
    }
}

impl fmt::Display for PointerSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Version and pointer width of the managed runtime inside the target
/// process, as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDescriptor {
    pub version: String,
    pub pointer_size: PointerSize,
}

impl fmt::Display for RuntimeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-byte pointers)", self.version, self.pointer_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OffsetField {
    #[serde(rename = "classLinkerOffset")]
    ClassLinker,
    #[serde(rename = "quickGenericJniTrampolineOffset")]
    QuickGenericJniTrampoline,
    #[serde(rename = "method.interpreterCode")]
    MethodInterpreterCode,
    #[serde(rename = "method.jniCode")]
    MethodJniCode,
    #[serde(rename = "method.quickCode")]
    MethodQuickCode,
    #[serde(rename = "method.accessFlags")]
    MethodAccessFlags,
}

impl OffsetField {
    pub const ALL: [OffsetField; 6] = [
        OffsetField::ClassLinker,
        OffsetField::QuickGenericJniTrampoline,
        OffsetField::MethodInterpreterCode,
        OffsetField::MethodJniCode,
        OffsetField::MethodQuickCode,
        OffsetField::MethodAccessFlags,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OffsetField::ClassLinker => "classLinkerOffset",
            OffsetField::QuickGenericJniTrampoline => "quickGenericJniTrampolineOffset",
            OffsetField::MethodInterpreterCode => "method.interpreterCode",
            OffsetField::MethodJniCode => "method.jniCode",
            OffsetField::MethodQuickCode => "method.quickCode",
            OffsetField::MethodAccessFlags => "method.accessFlags",
        }
    }
}

impl fmt::Display for OffsetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodOffsets {
    pub interpreter_code: u64,
    pub jni_code: u64,
    pub quick_code: u64,
    pub access_flags: u64,
}

/// Structure layout facts measured by the agent inside the target runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetTable {
    pub class_linker: u64,
    pub quick_generic_jni_trampoline: u64,
    pub method: MethodOffsets,
}

impl OffsetTable {
    pub fn get(&self, field: OffsetField) -> u64 {
        match field {
            OffsetField::ClassLinker => self.class_linker,
            OffsetField::QuickGenericJniTrampoline => self.quick_generic_jni_trampoline,
            OffsetField::MethodInterpreterCode => self.method.interpreter_code,
            OffsetField::MethodJniCode => self.method.jni_code,
            OffsetField::MethodQuickCode => self.method.quick_code,
            OffsetField::MethodAccessFlags => self.method.access_flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    /// Triggering call made before the hook was installed.
    BeforeInstall,
    /// Triggering call made after the hook was installed.
    AfterInstall,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::BeforeInstall => f.write_str("before_install"),
            HookPhase::AfterInstall => f.write_str("after_install"),
        }
    }
}
