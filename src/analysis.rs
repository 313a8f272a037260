use std::fmt;

use crate::bpf::unwinder_bindings::unwind_rule_t;

/// Agent-wide identifier for one analyzed binary (an executable or shared
/// object with a particular build id).
pub type BinaryId = u64;

/// Identifier of the address space a binary is mapped into. Process groups
/// sharing one set of mappings share the id.
pub type AddressSpace = u32;

/// Everything the analysis pipeline produced for one binary, in the shape
/// the kernel side consumes. Runtime configs are present only when the
/// binary embeds the matching runtime.
#[derive(Debug, Clone, Default)]
pub struct BinaryAnalysis {
    pub unwind_table: UnwindTableAnalysis,
    pub tls: Option<TlsConfig>,
    pub python: Option<PythonConfig>,
    pub pthread: Option<PthreadConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct UnwindTableAnalysis {
    pub address_space: AddressSpace,
    /// Monotonic per address space. A re-executed or re-mapped binary gets a
    /// higher generation than everything it replaces.
    pub generation: i64,
    /// Executable ranges covered by `rows`, sorted by `begin` and
    /// non-overlapping within a single analysis.
    pub segments: Vec<SegmentSpan>,
    pub rows: Vec<unwind_rule_t>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub variables: Vec<TlsVariable>,
}

#[derive(Debug, Clone)]
pub struct TlsVariable {
    /// Displacement of the variable from the thread control block.
    pub offset: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PythonConfig {
    pub version: PythonVersion,
    /// Displacement of the interpreter's thread state TLS slot from the
    /// thread control block. Negative on x86-64.
    pub py_thread_state_tls_offset: i64,
    pub relative_py_runtime_address: u64,
    pub relative_py_interp_head_address: u64,
    pub relative_auto_tss_key_address: u64,
    pub unicode_type_size_log2: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PthreadConfig {
    pub key_data_size: u64,
    pub key_data_value_offset: u64,
    pub key_data_seq_offset: u64,
    pub first_specific_block_offset: u64,
    pub specific_array_offset: u64,
    pub struct_pthread_pointer_offset: u64,
    pub key_second_level_size: u64,
    pub key_first_level_size: u64,
    pub keys_max: u64,
}
